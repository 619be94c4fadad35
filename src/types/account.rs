//! Account model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ImapConfig, SmtpConfig};

/// Which backend services an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Imap,
}

/// Lifecycle status as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Connected,
    Disconnected,
    Error,
    Connecting,
}

/// Encrypted credential blob plus the metadata needed to use it.
///
/// The blob itself is opaque to the engine; a [`crate::CredentialProvider`]
/// decrypts it and refreshes OAuth tokens on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredentials {
    pub encrypted: String,
    /// OAuth token expiry, when known. Callers treat a token expiring
    /// within the next minute as already expired.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Per-account background sync tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSyncConfig {
    /// Whether background passes pick this account up at all.
    pub enabled: bool,
    /// Override of the engine-wide sync interval, in seconds.
    pub interval_secs: Option<u64>,
}

impl Default for AccountSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
        }
    }
}

/// A configured mail account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub provider: ProviderKind,
    pub status: AccountStatus,
    pub credentials: AccountCredentials,
    /// Present for IMAP accounts, ignored for Gmail.
    pub imap: Option<ImapConfig>,
    /// Present for IMAP accounts, ignored for Gmail.
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub sync: AccountSyncConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// The IMAP config, or an error for a Gmail account.
    pub fn imap_config(&self) -> crate::Result<&ImapConfig> {
        self.imap.as_ref().ok_or_else(|| {
            crate::MailError::Config(format!("account {} has no IMAP configuration", self.id))
        })
    }

    pub fn smtp_config(&self) -> crate::Result<&SmtpConfig> {
        self.smtp.as_ref().ok_or_else(|| {
            crate::MailError::Config(format!("account {} has no SMTP configuration", self.id))
        })
    }
}
