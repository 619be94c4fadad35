//! Provider abstraction
//!
//! A [`MailProvider`] hides whether an account is serviced over the
//! Gmail REST API or over IMAP/SMTP. The manager only ever talks to
//! this trait.

pub mod gmail;
pub mod imap;
pub mod normalize;

pub use gmail::GmailProvider;
pub use imap::ImapProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{
    FetchOptions, Folder, Message, SendOptions, SendOutcome, SyncOptions, SyncStats,
};
use crate::Result;

/// Provider lifecycle. Operations other than `initialize` require
/// `Ready`; a destroyed provider stays destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Created,
    Initializing,
    Ready,
    Error,
    Destroyed,
}

/// What a provider can do beyond the common surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Server-side push (Gmail watch) or IDLE.
    pub push: bool,
    /// Native label support as opposed to single-folder placement.
    pub labels: bool,
    /// Incremental change feed (Gmail history API).
    pub incremental_sync: bool,
    /// Remote calls allowed per `rate_window_secs`; zero means the
    /// provider does not self-throttle.
    pub rate_limit: u32,
    pub rate_window_secs: u64,
}

/// One mail backend bound to one account.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn account_id(&self) -> &str;

    fn state(&self) -> ProviderState;

    fn capabilities(&self) -> Capabilities;

    /// Verify connectivity and credentials. Must be called before any
    /// other operation; repeated calls are no-ops once `Ready`.
    async fn initialize(&self) -> Result<()>;

    /// Pull messages into the store. Returns what changed.
    async fn sync(&self, opts: SyncOptions) -> Result<SyncStats>;

    async fn get_folders(&self) -> Result<Vec<Folder>>;

    async fn get_messages(&self, folder: &str, opts: FetchOptions) -> Result<Vec<Message>>;

    async fn get_message(&self, message_id: &str) -> Result<Message>;

    /// Provider-native search. IMAP translates the query to SEARCH
    /// keys; Gmail passes it through as a `q` parameter.
    async fn search(&self, query: &str, opts: FetchOptions) -> Result<Vec<Message>>;

    async fn mark_read(&self, message_id: &str, read: bool) -> Result<()>;

    async fn mark_starred(&self, message_id: &str, starred: bool) -> Result<()>;

    /// Move to a folder (IMAP) or swap labels (Gmail).
    async fn move_message(&self, message_id: &str, folder: &str) -> Result<()>;

    /// Move to trash; permanent delete only when already in trash or
    /// no trash folder exists.
    async fn delete_message(&self, message_id: &str) -> Result<()>;

    async fn send_message(&self, opts: SendOptions) -> Result<SendOutcome>;

    /// Begin push/IDLE monitoring of the given folder.
    async fn start_watch(&self, folder: &str) -> Result<()>;

    async fn stop_watch(&self, folder: &str) -> Result<()>;

    /// Tear down connections and background tasks. Idempotent.
    async fn destroy(&self) -> Result<()>;
}

/// Builds providers for the manager; swapped out in tests.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(
        &self,
        account: &crate::types::Account,
    ) -> Result<std::sync::Arc<dyn MailProvider>>;
}
