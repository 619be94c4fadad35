//! Unified error types for the sync engine
//!
//! Every error carries enough classification for callers to decide on
//! retry behavior: authentication errors are never retried, network
//! errors are retried with backoff (and queued at the manager layer),
//! resource-exhaustion errors are rejected immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine error type shared by pools, providers and the manager.
///
/// All errors are serializable so they can cross an IPC boundary intact.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum MailError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Invalid or expired credentials. Never retried automatically; the
    /// caller must refresh credentials and re-initialize the provider.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transient network failure (reset, timeout, DNS, refused).
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed response or missing required field. Not retried.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection pool is at capacity for new accounts.
    #[error("Connection pool full: limit of {0} reached")]
    ConnectionLimit(usize),

    /// Sync concurrency cap reached. Caller decides whether to resubmit.
    #[error("Concurrency limit reached: {0} syncs already in flight")]
    ConcurrencyLimit(usize),

    /// Reconnection attempts exhausted.
    #[error("Max reconnect attempts reached for account {0}")]
    ReconnectExhausted(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Provider not initialized for account {0}")]
    NotInitialized(String),

    #[error("Provider destroyed for account {0}")]
    Destroyed(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

/// Error-code fragments that classify a failure as network-level.
///
/// Mirrors the OS-level codes surfaced in error text by the TCP/TLS
/// stacks underneath the IMAP, SMTP and HTTP clients.
const NETWORK_ERROR_CODES: &[&str] = &[
    "econnreset",
    "enotfound",
    "econnrefused",
    "etimedout",
    "enetdown",
    "enetunreach",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "timed out",
    "dns error",
    "network unreachable",
];

impl MailError {
    /// Whether this failure is network-class: eligible for reconnect
    /// backoff at the pool layer and offline queueing at the manager.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Send(msg) | Self::Other(msg) | Self::Protocol(msg) => {
                let lower = msg.to_lowercase();
                NETWORK_ERROR_CODES.iter().any(|code| lower.contains(code))
            }
            _ => false,
        }
    }

    /// Whether this failure is an authentication problem (never retried).
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Classify a raw error string from an underlying client library.
    ///
    /// IMAP servers report auth failures in the tagged NO response text;
    /// the TLS/TCP stacks report network failures in io error text.
    pub fn classify(context: &str, raw: impl std::fmt::Display) -> Self {
        let text = raw.to_string();
        let lower = text.to_lowercase();
        if lower.contains("authent")
            || lower.contains("login failed")
            || lower.contains("invalid credentials")
            || lower.contains("invalid_grant")
        {
            Self::Auth(format!("{context}: {text}"))
        } else if NETWORK_ERROR_CODES.iter().any(|code| lower.contains(code)) {
            Self::Network(format!("{context}: {text}"))
        } else {
            Self::Other(format!("{context}: {text}"))
        }
    }
}

impl From<std::io::Error> for MailError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut => MailError::Network(err.to_string()),
            _ => MailError::Other(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MailError {
    fn from(err: serde_json::Error) -> Self {
        MailError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            MailError::Network(err.to_string())
        } else if err.is_decode() {
            MailError::Protocol(err.to_string())
        } else {
            MailError::Other(err.to_string())
        }
    }
}

/// Result type alias using MailError
pub type Result<T> = std::result::Result<T, MailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_classification_matches_os_codes() {
        assert!(MailError::Other("read: ECONNRESET".into()).is_network());
        assert!(MailError::Send("getaddrinfo ENOTFOUND smtp.example.com".into()).is_network());
        assert!(MailError::Network("anything".into()).is_network());
        assert!(!MailError::Auth("invalid password".into()).is_network());
        assert!(!MailError::Other("mailbox does not exist".into()).is_network());
    }

    #[test]
    fn classify_detects_auth_failures() {
        let err = MailError::classify("LOGIN", "NO [AUTHENTICATIONFAILED] Invalid credentials");
        assert!(err.is_auth());

        let err = MailError::classify("connect", "ETIMEDOUT while connecting");
        assert!(err.is_network());
    }

    #[test]
    fn io_error_kinds_map_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(MailError::from(io).is_network());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!MailError::from(io).is_network());
    }
}
