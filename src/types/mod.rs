//! Normalized data model shared by every provider
//!
//! Providers translate their native representations (Gmail labels and
//! payloads, IMAP flags and envelopes) into these types; everything above
//! the provider layer is provider-agnostic.

pub mod account;
pub mod event;

pub use account::{Account, AccountCredentials, AccountStatus, AccountSyncConfig, ProviderKind};
pub use event::{EventBus, MailEvent};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An address + optional display name pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }

    /// Parse `"Name <user@host>"` or a bare address.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let (Some(lt), Some(gt)) = (raw.rfind('<'), raw.rfind('>')) {
            if gt > lt {
                let address = raw[lt + 1..gt].trim().to_string();
                let name = raw[..lt].trim().trim_matches('"').trim();
                return Self {
                    name: (!name.is_empty()).then(|| name.to_string()),
                    address,
                };
            }
        }
        Self::new(raw)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Normalized message flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFlags {
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub is_draft: bool,
    pub is_sent: bool,
    pub is_trashed: bool,
    pub is_spam: bool,
    pub has_attachments: bool,
}

/// Message priority parsed from headers (IMAP) or label heuristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Parse an X-Priority / Importance header value.
    ///
    /// "high"/"urgent" or numeric 1 map to High, "low" or numeric 5 to
    /// Low, everything else to Normal.
    pub fn parse_header(value: &str) -> Self {
        let lower = value.to_lowercase();
        if lower.contains("high") || lower.contains("urgent") || lower.trim().starts_with('1') {
            Self::High
        } else if lower.contains("low") || lower.trim().starts_with('5') {
            Self::Low
        } else {
            Self::Normal
        }
    }
}

/// A message attachment (metadata only; content is fetched on demand).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Normalized email record.
///
/// `id` is stable across syncs for the same remote message:
/// `{account_id}-{uid}` for IMAP, the native message id for Gmail.
/// Re-syncing therefore upserts rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub flags: MessageFlags,
    pub priority: Priority,
    pub folder: String,
    pub labels: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub headers: Vec<(String, String)>,
    pub date: DateTime<Utc>,
}

impl Message {
    /// Stable id for an IMAP message.
    pub fn imap_id(account_id: &str, uid: u32) -> String {
        format!("{account_id}-{uid}")
    }
}

/// Folder type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Custom,
    /// Non-selectable container boxes such as `[Gmail]`.
    System,
}

impl FolderType {
    /// Classify a folder from its raw mailbox name.
    pub fn classify(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower == "inbox" {
            Self::Inbox
        } else if lower.contains("sent") {
            Self::Sent
        } else if lower.contains("draft") {
            Self::Drafts
        } else if lower.contains("trash") || lower.contains("deleted") {
            Self::Trash
        } else if lower.contains("spam") || lower.contains("junk") {
            Self::Spam
        } else if lower.contains("archive") || lower.contains("all mail") {
            Self::Archive
        } else if lower.starts_with('[') && lower.ends_with(']') {
            Self::System
        } else {
            Self::Custom
        }
    }
}

/// A mail folder. Rebuilt on every `get_folders` call; the cache layer
/// is a read-through optimization, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    /// Derived from the full mailbox path (IMAP) or label id (Gmail).
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub folder_type: FolderType,
    pub message_count: Option<u32>,
    pub unread_count: Option<u32>,
    pub selectable: bool,
}

/// Per-account sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

/// Cumulative sync statistics for one account.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total_messages: u64,
    pub new_messages: u64,
    pub updated_messages: u64,
    pub deleted_messages: u64,
    pub sync_errors: u64,
}

/// The operation a sync is currently performing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub kind: String,
    pub folder: Option<String>,
    /// 0–100.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
}

/// Per-account sync status, owned and transitioned only by the manager
/// around each provider sync call (idle -> syncing -> idle | error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub account_id: String,
    pub state: SyncState,
    pub current_operation: Option<SyncOperation>,
    pub last_error: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub stats: SyncStats,
}

impl SyncStatus {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: SyncState::Idle,
            current_operation: None,
            last_error: None,
            last_sync: None,
            stats: SyncStats::default(),
        }
    }
}

/// Options for `sync_account`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Include spam and trash folders.
    pub full_sync: bool,
    /// Only fetch messages newer than this.
    pub since: Option<DateTime<Utc>>,
    /// Per-folder fetch cap.
    pub limit: Option<usize>,
}

/// Options for `get_messages`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

/// An outgoing attachment source. Each variant is validated accessible
/// before the message is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AttachmentSource {
    Buffer {
        filename: String,
        content_type: Option<String>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    File {
        path: String,
        filename: Option<String>,
        content_type: Option<String>,
    },
    Url {
        url: String,
        filename: String,
        content_type: Option<String>,
    },
}

/// Options for `send_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentSource>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Result of an SMTP submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub response: String,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_classification() {
        assert_eq!(FolderType::classify("INBOX"), FolderType::Inbox);
        assert_eq!(FolderType::classify("[Gmail]/Sent Mail"), FolderType::Sent);
        assert_eq!(FolderType::classify("Trash"), FolderType::Trash);
        assert_eq!(FolderType::classify("Junk"), FolderType::Spam);
        assert_eq!(FolderType::classify("Deleted Items"), FolderType::Trash);
        assert_eq!(FolderType::classify("Drafts"), FolderType::Drafts);
        assert_eq!(FolderType::classify("Archive"), FolderType::Archive);
        assert_eq!(FolderType::classify("Receipts"), FolderType::Custom);
        assert_eq!(FolderType::classify("[Gmail]"), FolderType::System);
    }

    #[test]
    fn address_parsing() {
        let addr = Address::parse("John Doe <john@example.com>");
        assert_eq!(addr.name.as_deref(), Some("John Doe"));
        assert_eq!(addr.address, "john@example.com");

        let addr = Address::parse("\"Jane Doe\" <jane@example.com>");
        assert_eq!(addr.name.as_deref(), Some("Jane Doe"));

        let addr = Address::parse("bare@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.address, "bare@example.com");
    }

    #[test]
    fn priority_header_parsing() {
        assert_eq!(Priority::parse_header("High"), Priority::High);
        assert_eq!(Priority::parse_header("Urgent"), Priority::High);
        assert_eq!(Priority::parse_header("1 (Highest)"), Priority::High);
        assert_eq!(Priority::parse_header("5 (Lowest)"), Priority::Low);
        assert_eq!(Priority::parse_header("low"), Priority::Low);
        assert_eq!(Priority::parse_header("3 (Normal)"), Priority::Normal);
        assert_eq!(Priority::parse_header(""), Priority::Normal);
    }

    #[test]
    fn imap_id_is_deterministic() {
        assert_eq!(Message::imap_id("acct-1", 42), "acct-1-42");
        assert_eq!(Message::imap_id("acct-1", 42), Message::imap_id("acct-1", 42));
    }
}
