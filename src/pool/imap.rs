//! IMAP connection pool
//!
//! One operational connection per account, shared behind a mutex so
//! commands are serialized, plus an optional dedicated monitor
//! connection per watched folder running IDLE. Both count against the
//! pool-wide connection cap.
//!
//! Keep-alive NOOPs run every five minutes on the operational
//! connection. IDLE sessions are refreshed before the RFC 2177
//! half-hour mark so servers do not drop them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_imap::Session;
use async_native_tls::TlsStream;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ImapConfig};
use crate::credentials::DecryptedCredentials;
use crate::types::{EventBus, MailEvent};
use crate::{MailError, Result};

pub type ImapSession = Session<TlsStream<TcpStream>>;

/// SASL XOAUTH2 initial response.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Everything needed to (re)establish one account's session.
#[derive(Clone)]
struct ConnectSpec {
    account_id: String,
    config: ImapConfig,
    credentials: DecryptedCredentials,
}

/// A live IMAP session with its selected-folder bookkeeping.
pub struct ImapConnection {
    session: Option<ImapSession>,
    selected: Option<String>,
    spec: ConnectSpec,
}

impl ImapConnection {
    /// The underlying session. Errors if the connection was torn down
    /// and not yet re-established.
    pub fn session(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::Network("IMAP session is not connected".into()))
    }

    pub fn take_session(&mut self) -> Option<ImapSession> {
        self.selected = None;
        self.session.take()
    }

    pub fn restore_session(&mut self, session: ImapSession) {
        self.session = Some(session);
    }

    /// SELECT a folder, skipping the round trip when already selected.
    pub async fn select(&mut self, folder: &str) -> Result<async_imap::types::Mailbox> {
        let session = self.session()?;
        let mailbox = session
            .select(folder)
            .await
            .map_err(|e| MailError::classify("SELECT", &e.to_string()))?;
        self.selected = Some(folder.to_string());
        Ok(mailbox)
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub async fn noop(&mut self) -> Result<()> {
        self.session()?
            .noop()
            .await
            .map_err(|e| MailError::classify("NOOP", &e.to_string()))
    }

    /// Drop and redial the session.
    pub async fn reconnect(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            let _ = logout(session).await;
        }
        self.selected = None;
        self.session = Some(dial(&self.spec).await?);
        Ok(())
    }
}

async fn logout(mut session: ImapSession) -> Result<()> {
    session
        .logout()
        .await
        .map_err(|e| MailError::Protocol(format!("LOGOUT failed: {e}")))
}

/// Establish a TLS session and authenticate.
async fn dial(spec: &ConnectSpec) -> Result<ImapSession> {
    let host = spec.config.host.as_str();
    let port = spec.config.port;
    info!(account_id = %spec.account_id, host, port, "connecting to IMAP server");

    let connect = TcpStream::connect((host, port));
    let tcp = tokio::time::timeout(spec.config.connect_timeout(), connect)
        .await
        .map_err(|_| MailError::Timeout(spec.config.connect_timeout_secs))?
        .map_err(|e| MailError::Network(format!("TCP connection failed: {e}")))?;

    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tls
        .connect(host, tcp)
        .await
        .map_err(|e| MailError::Network(format!("TLS handshake failed: {e}")))?;

    let client = async_imap::Client::new(tls_stream);

    let session = match &spec.credentials {
        DecryptedCredentials::Password { username, password } => client
            .login(username, password)
            .await
            .map_err(|(e, _)| MailError::Auth(format!("LOGIN failed: {e}")))?,
        DecryptedCredentials::OAuth2 {
            username,
            access_token,
        } => {
            let auth = XOAuth2 {
                user: username.clone(),
                access_token: access_token.clone(),
            };
            client
                .authenticate("XOAUTH2", auth)
                .await
                .map_err(|(e, _)| MailError::Auth(format!("XOAUTH2 failed: {e}")))?
        }
    };

    debug!(account_id = %spec.account_id, "IMAP session established");
    Ok(session)
}

struct IdleHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct PooledAccount {
    conn: Arc<Mutex<ImapConnection>>,
    keepalive: JoinHandle<()>,
    idle: HashMap<String, IdleHandle>,
}

/// Pool of IMAP connections, capped across all accounts.
pub struct ImapPool {
    accounts: RwLock<HashMap<String, PooledAccount>>,
    /// Operational + monitor connections currently open.
    open: Arc<AtomicUsize>,
    engine: EngineConfig,
    events: EventBus,
}

impl ImapPool {
    pub fn new(engine: EngineConfig, events: EventBus) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            open: Arc::new(AtomicUsize::new(0)),
            engine,
            events,
        }
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.engine.max_imap_connections;
        let prev = self.open.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            self.open.fetch_sub(1, Ordering::SeqCst);
            return Err(MailError::ConnectionLimit(max));
        }
        Ok(())
    }

    /// Get the account's operational connection, dialing it on first
    /// use. Fails with `ConnectionLimit` when the pool is full.
    pub async fn acquire(
        &self,
        account_id: &str,
        config: &ImapConfig,
        credentials: DecryptedCredentials,
    ) -> Result<Arc<Mutex<ImapConnection>>> {
        if let Some(entry) = self.accounts.read().await.get(account_id) {
            return Ok(entry.conn.clone());
        }

        self.reserve_slot()?;
        let spec = ConnectSpec {
            account_id: account_id.to_string(),
            config: config.clone(),
            credentials,
        };
        let session = match dial(&spec).await {
            Ok(s) => s,
            Err(e) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let conn = Arc::new(Mutex::new(ImapConnection {
            session: Some(session),
            selected: None,
            spec,
        }));

        let keepalive = self.spawn_keepalive(account_id.to_string(), conn.clone());

        let mut accounts = self.accounts.write().await;
        // Lost the race against a concurrent acquire for the same
        // account: keep the winner's connection.
        if let Some(existing) = accounts.get(account_id) {
            self.open.fetch_sub(1, Ordering::SeqCst);
            keepalive.abort();
            if let Some(session) = conn.lock().await.take_session() {
                let _ = logout(session).await;
            }
            return Ok(existing.conn.clone());
        }
        accounts.insert(
            account_id.to_string(),
            PooledAccount {
                conn: conn.clone(),
                keepalive,
                idle: HashMap::new(),
            },
        );
        Ok(conn)
    }

    fn spawn_keepalive(
        &self,
        account_id: String,
        conn: Arc<Mutex<ImapConnection>>,
    ) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.engine.keepalive_interval_secs);
        let engine = self.engine.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut guard = conn.lock().await;
                if guard.noop().await.is_ok() {
                    continue;
                }
                warn!(account_id = %account_id, "keep-alive NOOP failed, reconnecting");
                let mut recovered = false;
                for attempt in 0..engine.max_reconnect_attempts {
                    match guard.reconnect().await {
                        Ok(()) => {
                            recovered = true;
                            break;
                        }
                        Err(e) if e.is_auth() => {
                            warn!(account_id = %account_id, error = %e, "keep-alive reconnect rejected");
                            break;
                        }
                        Err(e) => {
                            let delay = engine.reconnect_delay(attempt);
                            warn!(account_id = %account_id, error = %e, attempt, ?delay,
                                  "keep-alive reconnect failed");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                if !recovered {
                    events.emit(MailEvent::ReconnectExhausted {
                        account_id: account_id.clone(),
                        folder: None,
                    });
                }
            }
        })
    }

    /// Run an operation against the account's operational connection
    /// with the configured per-operation timeout. Network failures
    /// trigger a reconnect and a retry with exponential backoff; once
    /// the attempt budget is spent, `ReconnectExhausted` is emitted and
    /// the terminal error returned. Auth and protocol errors are never
    /// retried.
    pub async fn run_retrying<T>(
        &self,
        account_id: &str,
        conn: &Arc<Mutex<ImapConnection>>,
        mut op: impl for<'a> FnMut(&'a mut ImapConnection) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = {
                let mut guard = conn.lock().await;
                match tokio::time::timeout(self.engine.operation_timeout(), op(&mut guard)).await {
                    Ok(result) => result,
                    Err(_) => Err(MailError::Timeout(self.engine.operation_timeout_secs)),
                }
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_network() => e,
                Err(e) => return Err(e),
            };

            if attempt + 1 >= self.engine.max_reconnect_attempts {
                warn!(account_id, error = %err, "IMAP operation retries exhausted");
                self.events.emit(MailEvent::ReconnectExhausted {
                    account_id: account_id.to_string(),
                    folder: None,
                });
                return Err(MailError::ReconnectExhausted(account_id.to_string()));
            }
            let delay = self.engine.reconnect_delay(attempt);
            attempt += 1;
            warn!(account_id, error = %err, attempt, ?delay, "IMAP operation failed, reconnecting");
            tokio::time::sleep(delay).await;

            let mut guard = conn.lock().await;
            match guard.reconnect().await {
                Ok(()) => {}
                Err(e) if e.is_auth() => return Err(e),
                // Leave the session down; the next attempt fails fast
                // and consumes the budget.
                Err(e) => warn!(account_id, error = %e, "reconnect failed"),
            }
        }
    }

    /// Start monitoring a folder with IDLE on a dedicated connection.
    /// Replaces any existing monitor for the same folder.
    pub async fn start_idle(
        &self,
        account_id: &str,
        folder: &str,
        config: &ImapConfig,
        credentials: DecryptedCredentials,
    ) -> Result<()> {
        self.stop_idle(account_id, folder).await;
        self.reserve_slot()?;

        let spec = ConnectSpec {
            account_id: account_id.to_string(),
            config: config.clone(),
            credentials,
        };
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(idle_loop(
            spec,
            folder.to_string(),
            self.engine.clone(),
            self.events.clone(),
            stop.clone(),
            self.open.clone(),
        ));

        let mut accounts = self.accounts.write().await;
        let Some(entry) = accounts.get_mut(account_id) else {
            task.abort();
            if !stop.swap(true, Ordering::SeqCst) {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(MailError::AccountNotFound(account_id.to_string()));
        };
        entry.idle.insert(folder.to_string(), IdleHandle { stop, task });
        Ok(())
    }

    pub async fn stop_idle(&self, account_id: &str, folder: &str) {
        let handle = {
            let mut accounts = self.accounts.write().await;
            accounts
                .get_mut(account_id)
                .and_then(|e| e.idle.remove(folder))
        };
        if let Some(handle) = handle {
            handle.task.abort();
            // The stop flag doubles as the slot-release token so the
            // monitor's own exit path cannot also decrement.
            if !handle.stop.swap(true, Ordering::SeqCst) {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
            debug!(account_id, folder, "stopped IDLE monitor");
        }
    }

    /// Tear down everything for one account.
    pub async fn remove(&self, account_id: &str) {
        let entry = self.accounts.write().await.remove(account_id);
        if let Some(entry) = entry {
            entry.keepalive.abort();
            for (_, handle) in entry.idle {
                handle.task.abort();
                if !handle.stop.swap(true, Ordering::SeqCst) {
                    self.open.fetch_sub(1, Ordering::SeqCst);
                }
            }
            if let Some(session) = entry.conn.lock().await.take_session() {
                let _ = logout(session).await;
            }
            self.open.fetch_sub(1, Ordering::SeqCst);
            info!(account_id, "removed IMAP connection");
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        for id in ids {
            self.remove(&id).await;
        }
    }
}

/// Dedicated-connection IDLE loop.
///
/// Refreshes IDLE before servers time it out, reconnects with
/// exponential backoff on transport errors, and gives up after the
/// configured attempt budget (or immediately on auth failure),
/// emitting `ReconnectExhausted` so the account falls back to interval
/// polling.
async fn idle_loop(
    spec: ConnectSpec,
    folder: String,
    engine: EngineConfig,
    events: EventBus,
    stop: Arc<AtomicBool>,
    open: Arc<AtomicUsize>,
) {
    let account_id = spec.account_id.clone();
    let refresh = Duration::from_secs(engine.idle_refresh_secs);
    let mut session: Option<ImapSession> = None;
    let mut attempt: u32 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        // (Re)establish and select.
        if session.is_none() {
            match dial(&spec).await {
                Ok(s) => {
                    session = Some(s);
                    attempt = 0;
                }
                Err(e) => {
                    events.emit(MailEvent::IdleError {
                        account_id: account_id.clone(),
                        folder: folder.clone(),
                        error: e.to_string(),
                    });
                    if e.is_auth() || attempt + 1 >= engine.max_reconnect_attempts {
                        warn!(account_id = %account_id, folder = %folder, error = %e,
                              "IDLE monitor giving up");
                        events.emit(MailEvent::ReconnectExhausted {
                            account_id: account_id.clone(),
                            folder: Some(folder.clone()),
                        });
                        break;
                    }
                    let delay = engine.reconnect_delay(attempt);
                    attempt += 1;
                    debug!(account_id = %account_id, attempt, ?delay, "IDLE reconnect backoff");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        }

        let Some(mut live) = session.take() else {
            continue;
        };
        if let Err(e) = live.select(&folder).await {
            warn!(account_id = %account_id, folder = %folder, error = %e, "IDLE SELECT failed");
            let _ = logout(live).await;
            continue;
        }

        let mut idle = live.idle();
        if let Err(e) = idle.init().await {
            warn!(account_id = %account_id, error = %e, "IDLE init failed");
            if let Ok(s) = idle.done().await {
                let _ = logout(s).await;
            }
            continue;
        }

        let (idle_future, stop_source) = idle.wait();
        let waited = tokio::time::timeout(refresh, idle_future).await;
        drop(stop_source);

        match idle.done().await {
            Ok(s) => session = Some(s),
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "failed to end IDLE");
                session = None;
            }
        }

        match waited {
            Ok(Ok(_)) => {
                debug!(account_id = %account_id, folder = %folder, "IDLE notification");
                events.emit(MailEvent::MailboxActivity {
                    account_id: account_id.clone(),
                    folder: folder.clone(),
                });
            }
            Ok(Err(e)) => {
                warn!(account_id = %account_id, error = %e, "IDLE wait error");
                if let Some(s) = session.take() {
                    let _ = logout(s).await;
                }
            }
            // Refresh timeout, just re-enter IDLE.
            Err(_) => debug!(account_id = %account_id, "refreshing IDLE"),
        }
    }

    if let Some(s) = session {
        let _ = logout(s).await;
    }
    if !stop.swap(true, Ordering::SeqCst) {
        open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_initial_response_format() {
        let mut auth = XOAuth2 {
            user: "u@example.com".into(),
            access_token: "tok".into(),
        };
        let resp = async_imap::Authenticator::process(&mut auth, b"");
        assert_eq!(resp, "user=u@example.com\x01auth=Bearer tok\x01\x01");
    }

    #[tokio::test]
    async fn pool_enforces_connection_cap() {
        let mut engine = EngineConfig::default();
        engine.max_imap_connections = 1;
        let (events, _rx) = EventBus::new();
        let pool = ImapPool::new(engine, events);

        pool.reserve_slot().expect("first slot");
        let err = pool.reserve_slot().unwrap_err();
        assert!(matches!(err, MailError::ConnectionLimit(1)));

        pool.open.fetch_sub(1, Ordering::SeqCst);
        pool.reserve_slot().expect("slot freed");
    }

    #[tokio::test]
    async fn operation_retries_then_signals_exhaustion() {
        let mut engine = EngineConfig::default();
        engine.max_reconnect_attempts = 2;
        engine.reconnect_base_delay_ms = 1;
        let (events, rx) = EventBus::new();
        let pool = ImapPool::new(engine, events);

        // Dead connection whose redial target refuses immediately.
        let conn = Arc::new(Mutex::new(ImapConnection {
            session: None,
            selected: None,
            spec: ConnectSpec {
                account_id: "a1".into(),
                config: ImapConfig {
                    host: "127.0.0.1".into(),
                    port: 1,
                    auth: crate::config::AuthMethod::Password { user: "u".into() },
                    connect_timeout_secs: 1,
                },
                credentials: DecryptedCredentials::Password {
                    username: "u".into(),
                    password: "p".into(),
                },
            },
        }));

        let err = pool
            .run_retrying("a1", &conn, |_conn| {
                Box::pin(async { Err::<(), _>(MailError::Network("connection reset".into())) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::ReconnectExhausted(_)));

        let event = rx.recv_async().await.expect("exhaustion event");
        assert!(matches!(
            event,
            MailEvent::ReconnectExhausted { ref account_id, folder: None } if account_id == "a1"
        ));
    }
}
