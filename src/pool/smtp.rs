//! SMTP transport pool
//!
//! One pooled `AsyncSmtpTransport` per account; lettre handles the
//! per-connection lifecycle (reuse, recycling after N messages), this
//! layer handles authentication, rate limiting, and retry on transient
//! failures. Message assembly lives in [`crate::compose`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::compose;
use crate::config::{EngineConfig, SmtpConfig};
use crate::credentials::DecryptedCredentials;
use crate::rate_limit::RateWindow;
use crate::types::{Address, SendOptions, SendOutcome};
use crate::{MailError, Result};

type Transport = AsyncSmtpTransport<Tokio1Executor>;

struct AccountTransport {
    mailer: RwLock<Transport>,
    /// Messages submitted since the transport was last built; drives
    /// recycling after `max_messages_per_connection`.
    sent: AtomicU64,
    config: SmtpConfig,
    credentials: DecryptedCredentials,
    rate: RateWindow,
}

/// Per-account SMTP transports, keyed by account id.
pub struct SmtpPool {
    accounts: RwLock<HashMap<String, Arc<AccountTransport>>>,
    engine: EngineConfig,
    http: reqwest::Client,
}

impl SmtpPool {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            engine,
            http: reqwest::Client::new(),
        }
    }

    /// Build (or reuse) the transport for an account.
    pub async fn acquire(
        &self,
        account_id: &str,
        config: &SmtpConfig,
        credentials: DecryptedCredentials,
    ) -> Result<()> {
        if self.accounts.read().await.contains_key(account_id) {
            return Ok(());
        }
        let mailer = build_transport(config, &credentials)?;
        let entry = Arc::new(AccountTransport {
            mailer: RwLock::new(mailer),
            sent: AtomicU64::new(0),
            config: config.clone(),
            credentials,
            rate: RateWindow::new(
                config.rate_limit as usize,
                Duration::from_secs(config.rate_window_secs),
            ),
        });
        self.accounts
            .write()
            .await
            .insert(account_id.to_string(), entry);
        info!(account_id, host = %config.host, "SMTP transport ready");
        Ok(())
    }

    pub async fn remove(&self, account_id: &str) {
        self.accounts.write().await.remove(account_id);
    }

    /// Assemble and submit a message, retrying transient failures with
    /// a fresh transport and exponential backoff. Returns the outcome
    /// together with the formatted RFC 822 bytes so callers can save a
    /// copy of what was delivered.
    pub async fn send(
        &self,
        account_id: &str,
        from: &Address,
        opts: &SendOptions,
    ) -> Result<(SendOutcome, Vec<u8>)> {
        let entry = self
            .accounts
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| MailError::AccountNotFound(account_id.to_string()))?;

        let message_id = format!("<{}@mailsync>", uuid::Uuid::new_v4());

        entry.rate.acquire().await;

        let mut mailer = entry.mailer.read().await.clone();
        let mut last_err = None;
        for attempt in 0..self.engine.max_reconnect_attempts {
            // lettre messages are consumed by send, so rebuild per try.
            let email = compose::build_mime(&self.http, from, opts, &message_id).await?;
            let mime = email.formatted();
            match mailer.send(email).await {
                Ok(response) => {
                    debug!(account_id, %message_id, "message accepted by server");
                    self.note_sent(&entry, account_id).await;
                    let outcome = SendOutcome {
                        message_id,
                        accepted: opts
                            .to
                            .iter()
                            .chain(&opts.cc)
                            .chain(&opts.bcc)
                            .map(|a| a.address.clone())
                            .collect(),
                        rejected: Vec::new(),
                        response: response.message().collect::<Vec<_>>().join(" "),
                    };
                    return Ok((outcome, mime));
                }
                Err(e) => {
                    let err = classify_smtp_error(&e);
                    if !err.is_network() || attempt + 1 >= self.engine.max_reconnect_attempts {
                        return Err(err);
                    }
                    let delay = self.engine.reconnect_delay(attempt);
                    warn!(account_id, error = %err, ?delay, "SMTP send failed, retrying");
                    tokio::time::sleep(delay).await;
                    mailer = build_transport(&entry.config, &entry.credentials)?;
                    *entry.mailer.write().await = mailer.clone();
                    entry.sent.store(0, Ordering::SeqCst);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MailError::Send("send retries exhausted".into())))
    }

    /// Count a delivered message and rebuild the transport once the
    /// per-connection message budget is spent.
    async fn note_sent(&self, entry: &AccountTransport, account_id: &str) {
        let sent = entry.sent.fetch_add(1, Ordering::SeqCst) + 1;
        if !recycle_due(sent, entry.config.max_messages_per_connection) {
            return;
        }
        match build_transport(&entry.config, &entry.credentials) {
            Ok(fresh) => {
                *entry.mailer.write().await = fresh;
                entry.sent.store(0, Ordering::SeqCst);
                debug!(account_id, sent, "recycled SMTP transport");
            }
            Err(e) => warn!(account_id, error = %e, "SMTP transport recycle failed"),
        }
    }
}

/// A transport is recycled after `max` delivered messages; zero
/// disables recycling.
fn recycle_due(sent: u64, max: u64) -> bool {
    max > 0 && sent >= max
}

fn build_transport(config: &SmtpConfig, credentials: &DecryptedCredentials) -> Result<Transport> {
    let pool = PoolConfig::new()
        .max_size(config.max_connections)
        .idle_timeout(Duration::from_secs(60));

    // Implicit TLS on 465, STARTTLS everywhere else.
    let builder = if config.port == 465 {
        Transport::relay(&config.host)
    } else {
        Transport::starttls_relay(&config.host)
    }
    .map_err(|e| MailError::Config(format!("SMTP relay setup failed: {e}")))?
    .port(config.port)
    .pool_config(pool);

    let builder = match credentials {
        DecryptedCredentials::Password { username, password } => builder
            .credentials(Credentials::new(username.clone(), password.clone()))
            .authentication(vec![Mechanism::Plain, Mechanism::Login]),
        DecryptedCredentials::OAuth2 {
            username,
            access_token,
        } => builder
            .credentials(Credentials::new(username.clone(), access_token.clone()))
            .authentication(vec![Mechanism::Xoauth2]),
    };

    Ok(builder.build())
}

fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> MailError {
    if e.is_permanent() {
        let text = e.to_string();
        if text.contains("535") || text.to_lowercase().contains("authent") {
            MailError::Auth(text)
        } else {
            MailError::Send(text)
        }
    } else {
        MailError::classify("SMTP", &e.to_string())
    }
}
