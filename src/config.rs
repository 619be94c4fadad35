//! Engine and per-server configuration
//!
//! All durations are plain seconds/milliseconds in serde-friendly form so
//! configuration can round-trip through the host application unchanged.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a server authenticates us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Plain username/password (resolved from the credential blob).
    Password { user: String },
    /// OAuth2 XOAUTH2; the access token is fetched from the
    /// credential provider at connect time.
    OAuth2 { user: String },
}

impl AuthMethod {
    pub fn user(&self) -> &str {
        match self {
            Self::Password { user } | Self::OAuth2 { user } => user,
        }
    }
}

/// IMAP server settings for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub auth: AuthMethod,
    /// Connection establishment timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ImapConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// SMTP server settings for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub auth: AuthMethod,
    /// Maximum pooled connections lettre keeps open for this account.
    #[serde(default = "default_smtp_pool_size")]
    pub max_connections: u32,
    /// Messages sent on one connection before it is recycled.
    #[serde(default = "default_smtp_messages_per_connection")]
    pub max_messages_per_connection: u64,
    /// Outbound rate limit: messages allowed per window.
    #[serde(default = "default_smtp_rate_limit")]
    pub rate_limit: u32,
    /// Outbound rate limit window in seconds.
    #[serde(default = "default_smtp_rate_window")]
    pub rate_window_secs: u64,
}

/// Engine-wide tunables owned by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum syncs allowed in flight at once.
    pub max_concurrent_syncs: usize,
    /// Background sync cadence in seconds (0 disables the timer).
    pub sync_interval_secs: u64,
    /// Offline queue drain cadence in seconds.
    pub queue_drain_interval_secs: u64,
    /// Offline queue capacity; oldest items are evicted when full.
    pub offline_queue_size: usize,
    /// Attempts per queued item before it is discarded.
    pub offline_queue_max_attempts: u32,
    /// IMAP connection pool capacity (live sessions across accounts).
    pub max_imap_connections: usize,
    /// Reconnect backoff base delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Per-remote-operation timeout in seconds.
    pub operation_timeout_secs: u64,
    /// NOOP keep-alive cadence for non-idling IMAP connections, seconds.
    pub keepalive_interval_secs: u64,
    /// IDLE refresh cadence in seconds; must stay under the 30-minute
    /// server-side IDLE timeout.
    pub idle_refresh_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: 3,
            sync_interval_secs: 15 * 60,
            queue_drain_interval_secs: 60,
            offline_queue_size: 1000,
            offline_queue_max_attempts: 3,
            max_imap_connections: 10,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            operation_timeout_secs: 60,
            keepalive_interval_secs: 5 * 60,
            idle_refresh_secs: 29 * 60,
        }
    }
}

impl EngineConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Backoff delay before reconnect attempt `attempt` (0-based):
    /// `base * 2^attempt`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_smtp_pool_size() -> u32 {
    5
}

fn default_smtp_messages_per_connection() -> u64 {
    100
}

fn default_smtp_rate_limit() -> u32 {
    10
}

fn default_smtp_rate_window() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_per_attempt() {
        let config = EngineConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(2000));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(16000));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_syncs, 3);
        assert_eq!(config.sync_interval_secs, 900);
        assert_eq!(config.offline_queue_size, 1000);
        assert_eq!(config.max_imap_connections, 10);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.idle_refresh_secs, 29 * 60);
    }
}
