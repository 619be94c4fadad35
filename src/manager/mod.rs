//! Orchestration layer
//!
//! [`EmailServiceManager`] owns the per-account providers, enforces the
//! sync concurrency cap, runs the background sync timer and the offline
//! queue drain loop, and fans out cross-account reads.

pub mod offline_queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::credentials::CredentialProvider;
use crate::pool::{ImapPool, SmtpPool};
use crate::provider::{GmailProvider, ImapProvider, MailProvider, ProviderFactory};
use crate::store::MessageStore;
use crate::types::{
    Account, AccountStatus, EventBus, FetchOptions, Folder, MailEvent, Message, MessageFlags,
    ProviderKind, SendOptions, SendOutcome, SyncOperation, SyncState, SyncStatus, SyncOptions,
    SyncStats,
};
use crate::{MailError, Result};

use offline_queue::{OfflineQueue, QueuedAction, QueuedOperation};

/// Default factory: IMAP accounts share the connection pools, Gmail
/// accounts get an HTTP client each.
pub struct DefaultProviderFactory {
    imap: Arc<ImapPool>,
    smtp: Arc<SmtpPool>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<dyn MessageStore>,
    events: EventBus,
    engine: EngineConfig,
    gmail_push_topic: Option<String>,
}

#[async_trait::async_trait]
impl ProviderFactory for DefaultProviderFactory {
    async fn create(&self, account: &Account) -> Result<Arc<dyn MailProvider>> {
        match account.provider {
            ProviderKind::Imap => Ok(Arc::new(ImapProvider::new(
                account.clone(),
                self.imap.clone(),
                self.smtp.clone(),
                self.credentials.clone(),
                self.store.clone(),
                self.events.clone(),
            ))),
            ProviderKind::Gmail => Ok(Arc::new(GmailProvider::new(
                account.clone(),
                self.credentials.clone(),
                self.store.clone(),
                self.events.clone(),
                self.engine.clone(),
                self.gmail_push_topic.clone(),
            ))),
        }
    }
}

struct AccountEntry {
    account: Account,
    provider: Arc<dyn MailProvider>,
    status: SyncStatus,
}

/// Decrements the in-flight sync counter on drop, so a panicking or
/// cancelled sync can never leak a permit.
struct SyncPermit {
    counter: Arc<AtomicUsize>,
}

impl SyncPermit {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Result<Self> {
        let prev = counter.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(MailError::ConcurrencyLimit(max));
        }
        Ok(Self {
            counter: counter.clone(),
        })
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct EmailServiceManager {
    engine: EngineConfig,
    factory: Arc<dyn ProviderFactory>,
    store: Arc<dyn MessageStore>,
    /// Internal bus shared with pools and providers; everything on it
    /// is forwarded to the public receiver.
    events: EventBus,
    public: EventBus,
    accounts: RwLock<HashMap<String, AccountEntry>>,
    active_syncs: Arc<AtomicUsize>,
    queue: OfflineQueue,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl EmailServiceManager {
    /// Build a manager with the default provider factory and shared
    /// connection pools. Returns the public event receiver.
    pub fn with_defaults(
        engine: EngineConfig,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn MessageStore>,
        gmail_push_topic: Option<String>,
    ) -> (Arc<Self>, flume::Receiver<MailEvent>) {
        let (bus, internal_rx) = EventBus::new();
        let imap = Arc::new(ImapPool::new(engine.clone(), bus.clone()));
        let smtp = Arc::new(SmtpPool::new(engine.clone()));
        let factory = Arc::new(DefaultProviderFactory {
            imap,
            smtp,
            credentials,
            store: store.clone(),
            events: bus.clone(),
            engine: engine.clone(),
            gmail_push_topic,
        });
        Self::new(engine, factory, store, bus, internal_rx)
    }

    /// Build a manager around an explicit factory. The factory must
    /// emit on `events`; its receiver half is `internal_rx`.
    pub fn new(
        engine: EngineConfig,
        factory: Arc<dyn ProviderFactory>,
        store: Arc<dyn MessageStore>,
        events: EventBus,
        internal_rx: flume::Receiver<MailEvent>,
    ) -> (Arc<Self>, flume::Receiver<MailEvent>) {
        let (public, public_rx) = EventBus::new();
        let queue = OfflineQueue::new(engine.offline_queue_size, engine.offline_queue_max_attempts);
        let manager = Arc::new(Self {
            engine,
            factory,
            store,
            events,
            public,
            accounts: RwLock::new(HashMap::new()),
            active_syncs: Arc::new(AtomicUsize::new(0)),
            queue,
            tasks: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });
        manager.spawn_background(internal_rx);
        (manager, public_rx)
    }

    fn spawn_background(self: &Arc<Self>, internal_rx: flume::Receiver<MailEvent>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // Event forwarder; mailbox activity also triggers a sync.
        let weak: Weak<Self> = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = internal_rx.recv_async().await {
                let Some(mgr) = weak.upgrade() else { break };
                match &event {
                    MailEvent::MailboxActivity { account_id, .. } => {
                        let account_id = account_id.clone();
                        let inner = Weak::clone(&weak);
                        tokio::spawn(async move {
                            if let Some(mgr) = inner.upgrade() {
                                if let Err(e) =
                                    mgr.sync_account(&account_id, SyncOptions::default()).await
                                {
                                    debug!(account_id = %account_id, error = %e,
                                           "activity-triggered sync skipped");
                                }
                            }
                        });
                    }
                    MailEvent::SyncProgress {
                        account_id,
                        folder,
                        progress,
                    } => {
                        mgr.note_progress(account_id, folder.clone(), *progress).await;
                    }
                    _ => {}
                }
                mgr.public.emit(event);
            }
        }));

        // Periodic full sync.
        if self.engine.sync_interval_secs > 0 {
            let weak = Arc::downgrade(self);
            let interval = Duration::from_secs(self.engine.sync_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(mgr) = weak.upgrade() else { break };
                    if mgr.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("background sync tick");
                    mgr.sync_due_accounts(SyncOptions::default()).await;
                }
            }));
        }

        // Offline queue drain.
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.engine.queue_drain_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(mgr) = weak.upgrade() else { break };
                if mgr.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                mgr.drain_queue().await;
            }
        }));
    }

    // ---- account lifecycle ------------------------------------------------

    /// Register an account and bring its provider up. On any failure
    /// nothing is kept: the provider is destroyed and the account is
    /// not stored.
    pub async fn add_account(&self, mut account: Account) -> Result<()> {
        if self.accounts.read().await.contains_key(&account.id) {
            return Err(MailError::InvalidInput(format!(
                "account {} already exists",
                account.id
            )));
        }

        account.status = AccountStatus::Connecting;
        let provider = self.factory.create(&account).await?;
        if let Err(e) = provider.initialize().await {
            error!(account_id = %account.id, error = %e, "account initialization failed");
            provider.destroy().await.ok();
            return Err(e);
        }
        account.status = AccountStatus::Connected;
        self.store.upsert_account(&account).await?;

        // Monitoring is best-effort; a failure degrades to polling.
        if provider.capabilities().push {
            if let Err(e) = provider.start_watch("INBOX").await {
                warn!(account_id = %account.id, error = %e, "mailbox monitoring unavailable");
            }
        }

        let status = SyncStatus::new(&account.id);
        self.accounts.write().await.insert(
            account.id.clone(),
            AccountEntry {
                account: account.clone(),
                provider,
                status,
            },
        );
        info!(account_id = %account.id, email = %account.email, "account added");
        let account_id = account.id.clone();
        self.events.emit(MailEvent::AccountAdded { account });

        // Initial sync is best-effort; failure leaves the account
        // registered and reported through the status events.
        if let Err(e) = self.sync_account(&account_id, SyncOptions::default()).await {
            warn!(account_id = %account_id, error = %e, "initial sync failed");
        }
        Ok(())
    }

    /// Swap an account's configuration. The old provider keeps serving
    /// until the replacement initializes, so a bad update leaves the
    /// account working.
    pub async fn update_account(&self, mut account: Account) -> Result<()> {
        if !self.accounts.read().await.contains_key(&account.id) {
            return Err(MailError::AccountNotFound(account.id.clone()));
        }

        account.status = AccountStatus::Connecting;
        let provider = self.factory.create(&account).await?;
        if let Err(e) = provider.initialize().await {
            provider.destroy().await.ok();
            return Err(e);
        }
        account.status = AccountStatus::Connected;
        self.store.upsert_account(&account).await?;

        if provider.capabilities().push {
            if let Err(e) = provider.start_watch("INBOX").await {
                warn!(account_id = %account.id, error = %e, "mailbox monitoring unavailable");
            }
        }

        let old = {
            let mut accounts = self.accounts.write().await;
            let status = accounts
                .get(&account.id)
                .map(|e| e.status.clone())
                .unwrap_or_else(|| SyncStatus::new(&account.id));
            accounts.insert(
                account.id.clone(),
                AccountEntry {
                    account: account.clone(),
                    provider,
                    status,
                },
            )
        };
        if let Some(old) = old {
            old.provider.destroy().await.ok();
        }
        info!(account_id = %account.id, "account updated");
        self.events.emit(MailEvent::AccountUpdated { account });
        Ok(())
    }

    /// Remove an account. Idempotent: removing an unknown account is a
    /// no-op and returns `false`.
    pub async fn remove_account(&self, account_id: &str) -> Result<bool> {
        let Some(entry) = self.accounts.write().await.remove(account_id) else {
            return Ok(false);
        };
        entry.provider.destroy().await.ok();
        self.store.delete_account(account_id).await?;
        let dropped = self.queue.remove_account(account_id).await;
        if dropped > 0 {
            debug!(account_id, dropped, "discarded queued operations");
        }
        info!(account_id, "account removed");
        self.events.emit(MailEvent::AccountRemoved {
            account_id: account_id.to_string(),
        });
        Ok(true)
    }

    pub async fn get_account(&self, account_id: &str) -> Option<Account> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|e| e.account.clone())
    }

    pub async fn list_accounts(&self) -> Vec<Account> {
        self.accounts
            .read()
            .await
            .values()
            .map(|e| e.account.clone())
            .collect()
    }

    pub async fn get_sync_status(&self, account_id: &str) -> Option<SyncStatus> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|e| e.status.clone())
    }

    async fn provider(&self, account_id: &str) -> Result<Arc<dyn MailProvider>> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|e| e.provider.clone())
            .ok_or_else(|| MailError::AccountNotFound(account_id.to_string()))
    }

    // ---- sync -------------------------------------------------------------

    /// Sync one account. Fails fast with `ConcurrencyLimit` when the
    /// cap is reached; the caller decides whether to retry.
    pub async fn sync_account(&self, account_id: &str, opts: SyncOptions) -> Result<SyncStats> {
        let provider = self.provider(account_id).await?;
        let _permit = SyncPermit::acquire(&self.active_syncs, self.engine.max_concurrent_syncs)?;

        self.transition(account_id, SyncState::Syncing, None, None)
            .await;

        let result = provider.sync(opts).await;
        match &result {
            Ok(stats) => {
                self.transition(account_id, SyncState::Idle, None, Some(*stats))
                    .await;
            }
            Err(e) => {
                self.transition(account_id, SyncState::Error, Some(e.to_string()), None)
                    .await;
                self.events.emit(MailEvent::SyncError {
                    account_id: account_id.to_string(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn transition(
        &self,
        account_id: &str,
        state: SyncState,
        error: Option<String>,
        finished: Option<SyncStats>,
    ) {
        let status = {
            let mut accounts = self.accounts.write().await;
            let Some(entry) = accounts.get_mut(account_id) else {
                return;
            };
            entry.status.state = state;
            match state {
                SyncState::Syncing => {
                    entry.status.current_operation = Some(SyncOperation {
                        kind: "sync".to_string(),
                        folder: None,
                        progress: 0,
                        started_at: chrono::Utc::now(),
                    });
                    entry.status.last_error = None;
                }
                SyncState::Idle => {
                    entry.status.current_operation = None;
                    entry.status.last_sync = Some(chrono::Utc::now());
                    if let Some(stats) = finished {
                        let total = &mut entry.status.stats;
                        total.total_messages = stats.total_messages;
                        total.new_messages += stats.new_messages;
                        total.updated_messages += stats.updated_messages;
                        total.deleted_messages += stats.deleted_messages;
                        total.sync_errors += stats.sync_errors;
                    }
                }
                SyncState::Error => {
                    entry.status.current_operation = None;
                    entry.status.last_error = error;
                    entry.status.stats.sync_errors += 1;
                }
            }
            entry.status.clone()
        };
        self.events.emit(MailEvent::SyncStatus { status });
    }

    /// Record per-folder progress reported by a running sync.
    async fn note_progress(&self, account_id: &str, folder: Option<String>, progress: u8) {
        let mut accounts = self.accounts.write().await;
        let Some(entry) = accounts.get_mut(account_id) else {
            return;
        };
        match &mut entry.status.current_operation {
            Some(op) => {
                op.folder = folder;
                op.progress = progress;
            }
            None => {
                entry.status.current_operation = Some(SyncOperation {
                    kind: "sync".to_string(),
                    folder,
                    progress,
                    started_at: chrono::Utc::now(),
                });
            }
        }
    }

    /// Sync every account, batched so at most the configured number of
    /// syncs run at once. Returns per-account results.
    pub async fn sync_all_accounts(
        &self,
        opts: SyncOptions,
    ) -> Vec<(String, Result<SyncStats>)> {
        let ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        self.sync_ids(ids, opts).await
    }

    /// Background pass: sync the accounts whose per-account
    /// configuration says so, meaning sync is enabled and the account's
    /// interval (or the engine-wide one) has elapsed since its last
    /// sync.
    pub async fn sync_due_accounts(&self, opts: SyncOptions) -> Vec<(String, Result<SyncStats>)> {
        let now = chrono::Utc::now();
        let ids: Vec<String> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|e| e.account.sync.enabled)
            .filter(|e| {
                let interval = e
                    .account
                    .sync
                    .interval_secs
                    .unwrap_or(self.engine.sync_interval_secs);
                e.status
                    .last_sync
                    .map_or(true, |t| (now - t).num_seconds().max(0) as u64 >= interval)
            })
            .map(|e| e.account.id.clone())
            .collect();
        self.sync_ids(ids, opts).await
    }

    async fn sync_ids(&self, ids: Vec<String>, opts: SyncOptions) -> Vec<(String, Result<SyncStats>)> {
        let mut results = Vec::with_capacity(ids.len());
        for batch in ids.chunks(self.engine.max_concurrent_syncs.max(1)) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|id| async move { (id.clone(), self.sync_account(id, opts).await) }),
            )
            .await;
            results.extend(outcomes);
        }
        results
    }

    // ---- reads ------------------------------------------------------------

    pub async fn get_folders(&self, account_id: &str) -> Result<Vec<Folder>> {
        self.provider(account_id).await?.get_folders().await
    }

    pub async fn get_messages(
        &self,
        account_id: &str,
        folder: &str,
        opts: FetchOptions,
    ) -> Result<Vec<Message>> {
        self.provider(account_id).await?.get_messages(folder, opts).await
    }

    /// Inbox across all accounts, newest first. Each provider is asked
    /// for its share of `limit`; a failing provider is skipped so one
    /// broken account cannot empty the unified view.
    pub async fn get_unified_messages(&self, limit: usize) -> Vec<Message> {
        let providers: Vec<Arc<dyn MailProvider>> = self
            .accounts
            .read()
            .await
            .values()
            .map(|e| e.provider.clone())
            .collect();
        if providers.is_empty() || limit == 0 {
            return Vec::new();
        }
        let per_account = limit.div_ceil(providers.len());
        let opts = FetchOptions {
            limit: Some(per_account),
            since: None,
        };

        let fetches = join_all(
            providers
                .iter()
                .map(|p| async move { (p.account_id().to_string(), p.get_messages("INBOX", opts).await) }),
        )
        .await;

        let mut merged = Vec::new();
        for (account_id, outcome) in fetches {
            match outcome {
                Ok(mut messages) => merged.append(&mut messages),
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "unified fetch degraded");
                    self.events.emit(MailEvent::ProviderError {
                        account_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        merged.sort_by(|a, b| b.date.cmp(&a.date));
        merged.truncate(limit);
        merged
    }

    /// Search every account in parallel, merging newest first. Like
    /// the unified inbox, each provider gets an even share of `limit`.
    pub async fn search_all(&self, query: &str, limit: usize) -> Vec<Message> {
        let providers: Vec<Arc<dyn MailProvider>> = self
            .accounts
            .read()
            .await
            .values()
            .map(|e| e.provider.clone())
            .collect();
        if providers.is_empty() || limit == 0 {
            return Vec::new();
        }
        let per_account = limit.div_ceil(providers.len());
        let opts = FetchOptions {
            limit: Some(per_account),
            since: None,
        };
        let fetches = join_all(
            providers
                .iter()
                .map(|p| async move { (p.account_id().to_string(), p.search(query, opts).await) }),
        )
        .await;

        let mut merged = Vec::new();
        for (account_id, outcome) in fetches {
            match outcome {
                Ok(mut messages) => merged.append(&mut messages),
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "search degraded");
                    self.events.emit(MailEvent::ProviderError {
                        account_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        merged.sort_by(|a, b| b.date.cmp(&a.date));
        merged.truncate(limit);
        merged
    }

    /// Search one account when `account_id` is given, otherwise fan
    /// out across all of them.
    pub async fn search_messages(
        &self,
        query: &str,
        account_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        match account_id {
            Some(id) => {
                let opts = FetchOptions {
                    limit: Some(limit),
                    since: None,
                };
                self.provider(id).await?.search(query, opts).await
            }
            None => Ok(self.search_all(query, limit).await),
        }
    }

    // ---- monitoring -------------------------------------------------------

    /// Begin push/IDLE monitoring of a folder on one account.
    pub async fn start_idle(&self, account_id: &str, folder: &str) -> Result<()> {
        self.provider(account_id).await?.start_watch(folder).await
    }

    pub async fn stop_idle(&self, account_id: &str, folder: &str) -> Result<()> {
        self.provider(account_id).await?.stop_watch(folder).await
    }

    // ---- mutations (offline-aware) ----------------------------------------

    async fn apply(&self, account_id: &str, action: &QueuedAction) -> Result<()> {
        let provider = self.provider(account_id).await?;
        match action {
            QueuedAction::Send { options } => {
                provider.send_message(options.clone()).await.map(|_| ())
            }
            QueuedAction::MarkRead { message_id, read } => {
                provider.mark_read(message_id, *read).await?;
                self.patch_flags(account_id, message_id, |f| f.is_read = *read)
                    .await;
                Ok(())
            }
            QueuedAction::MarkStarred {
                message_id,
                starred,
            } => {
                provider.mark_starred(message_id, *starred).await?;
                self.patch_flags(account_id, message_id, |f| f.is_starred = *starred)
                    .await;
                Ok(())
            }
            QueuedAction::Move { message_id, folder } => {
                provider.move_message(message_id, folder).await
            }
            QueuedAction::Delete { message_id } => provider.delete_message(message_id).await,
        }
    }

    /// Update the cached copy of a message after a flag mutation and
    /// announce the new state.
    async fn patch_flags<F>(&self, account_id: &str, message_id: &str, patch: F)
    where
        F: FnOnce(&mut MessageFlags),
    {
        let Ok(Some(mut message)) = self.store.get_message(account_id, message_id).await else {
            return;
        };
        patch(&mut message.flags);
        if let Err(e) = self.store.upsert_message(&message).await {
            warn!(account_id, message_id, error = %e, "failed to cache flag update");
            return;
        }
        self.events.emit(MailEvent::MessageUpdated {
            account_id: account_id.to_string(),
            message,
        });
    }

    /// Run a mutation now; on a network-class failure, park it in the
    /// offline queue and still surface the error to the caller.
    async fn run_or_queue(&self, account_id: &str, action: QueuedAction) -> Result<()> {
        match self.apply(account_id, &action).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_network() => {
                self.queue
                    .push(QueuedOperation::new(account_id, action))
                    .await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mark_read(&self, account_id: &str, message_id: &str, read: bool) -> Result<()> {
        self.run_or_queue(
            account_id,
            QueuedAction::MarkRead {
                message_id: message_id.to_string(),
                read,
            },
        )
        .await
    }

    pub async fn mark_starred(
        &self,
        account_id: &str,
        message_id: &str,
        starred: bool,
    ) -> Result<()> {
        self.run_or_queue(
            account_id,
            QueuedAction::MarkStarred {
                message_id: message_id.to_string(),
                starred,
            },
        )
        .await
    }

    pub async fn move_message(
        &self,
        account_id: &str,
        message_id: &str,
        folder: &str,
    ) -> Result<()> {
        self.run_or_queue(
            account_id,
            QueuedAction::Move {
                message_id: message_id.to_string(),
                folder: folder.to_string(),
            },
        )
        .await
    }

    pub async fn delete_message(&self, account_id: &str, message_id: &str) -> Result<()> {
        self.run_or_queue(
            account_id,
            QueuedAction::Delete {
                message_id: message_id.to_string(),
            },
        )
        .await
    }

    pub async fn send_message(
        &self,
        account_id: &str,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let provider = self.provider(account_id).await?;
        match provider.send_message(options.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_network() => {
                self.queue
                    .push(QueuedOperation::new(
                        account_id,
                        QueuedAction::Send { options },
                    ))
                    .await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn queued_operations(&self) -> usize {
        self.queue.len().await
    }

    /// Replay everything in the offline queue. Operations for removed
    /// accounts are abandoned; network failures are requeued until
    /// their attempt budget runs out.
    pub async fn drain_queue(&self) {
        if self.queue.is_empty().await {
            return;
        }
        let ops = self.queue.take_all().await;
        let total = ops.len();
        let mut flushed = 0usize;
        let mut abandoned = 0usize;

        for op in ops {
            if self.provider(&op.account_id).await.is_err() {
                abandoned += 1;
                continue;
            }
            match self.apply(&op.account_id, &op.action).await {
                Ok(()) => flushed += 1,
                Err(e) if e.is_network() => {
                    if !self.queue.requeue(op).await {
                        abandoned += 1;
                    }
                }
                Err(e) => {
                    warn!(op_id = %op.id, error = %e, "queued operation failed permanently");
                    abandoned += 1;
                }
            }
        }
        info!(total, flushed, abandoned, "offline queue drained");
        self.events.emit(MailEvent::QueueDrained { flushed, abandoned });
    }

    /// Stop background tasks and tear down every provider.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let entries: Vec<Arc<dyn MailProvider>> = {
            let mut accounts = self.accounts.write().await;
            accounts.drain().map(|(_, e)| e.provider).collect()
        };
        join_all(entries.iter().map(|p| async move {
            p.destroy().await.ok();
        }))
        .await;
        info!("manager shut down");
    }
}
