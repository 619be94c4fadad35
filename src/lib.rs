//! Multi-account mail synchronization engine
//!
//! Accounts are serviced by pluggable providers (Gmail REST API or
//! IMAP/SMTP) behind one [`provider::MailProvider`] trait. The
//! [`manager::EmailServiceManager`] owns the providers, caps sync
//! concurrency, merges cross-account reads, and parks mutations in an
//! offline queue when the network is down. Every observable change is
//! published on a typed event stream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mailsync::{EmailServiceManager, EngineConfig, MemoryStore, StaticCredentials};
//!
//! # async fn run() {
//! let credentials = Arc::new(StaticCredentials::new());
//! let store = Arc::new(MemoryStore::new());
//! let (manager, events) =
//!     EmailServiceManager::with_defaults(EngineConfig::default(), credentials, store, None);
//! # let _ = (manager, events);
//! # }
//! ```

pub mod compose;
pub mod config;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod store;
pub mod types;

pub use config::{AuthMethod, EngineConfig, ImapConfig, SmtpConfig};
pub use credentials::{CredentialProvider, DecryptedCredentials, StaticCredentials};
pub use error::{MailError, Result};
pub use manager::{offline_queue::OfflineQueue, DefaultProviderFactory, EmailServiceManager};
pub use provider::{Capabilities, GmailProvider, ImapProvider, MailProvider, ProviderFactory, ProviderState};
pub use store::{MemoryStore, MessageStore};
pub use types::{
    Account, AccountCredentials, AccountStatus, AccountSyncConfig, Address, Attachment,
    AttachmentSource, EventBus,
    FetchOptions, Folder, FolderType, MailEvent, Message, MessageFlags, Priority, ProviderKind,
    SendOptions, SendOutcome, SyncOptions, SyncState, SyncStats, SyncStatus,
};
