//! Manager behavior against a scripted in-process provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::Mutex;

use mailsync::manager::offline_queue::{OfflineQueue, QueuedAction, QueuedOperation};
use mailsync::provider::{Capabilities, MailProvider, ProviderFactory, ProviderState};
use mailsync::{
    Account, AccountCredentials, AccountStatus, AccountSyncConfig, EmailServiceManager,
    EngineConfig, EventBus, FetchOptions, Folder, MailError, MailEvent, MemoryStore, Message,
    MessageFlags, Priority, ProviderKind, SendOptions, SendOutcome, SyncOptions, SyncState,
    SyncStats,
};

fn account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        display_name: None,
        provider: ProviderKind::Imap,
        status: AccountStatus::Disconnected,
        credentials: AccountCredentials {
            encrypted: "blob".into(),
            expires_at: None,
        },
        imap: None,
        smtp: None,
        sync: Default::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn message(account_id: &str, n: u32, epoch_secs: i64) -> Message {
    Message {
        id: format!("{account_id}-{n}"),
        account_id: account_id.to_string(),
        thread_id: format!("t-{n}"),
        subject: format!("message {n}"),
        from: None,
        to: vec![],
        cc: vec![],
        bcc: vec![],
        reply_to: vec![],
        body_text: Some("body".into()),
        body_html: None,
        flags: MessageFlags::default(),
        priority: Priority::Normal,
        folder: "INBOX".into(),
        labels: vec![],
        attachments: vec![],
        headers: vec![],
        date: Utc.timestamp_opt(epoch_secs, 0).unwrap(),
    }
}

/// Scripted provider: configurable messages, failure switches, and
/// call counters.
#[derive(Default)]
struct MockBehavior {
    inbox: Vec<Message>,
    fail_init: bool,
    fail_reads: bool,
    network_down: AtomicBool,
    sync_delay: Option<Duration>,
    sync_calls: AtomicUsize,
    send_calls: AtomicUsize,
    marked_read: Mutex<Vec<String>>,
    search_limits: Mutex<Vec<Option<usize>>>,
}

struct MockProvider {
    account_id: String,
    behavior: Arc<MockBehavior>,
}

#[async_trait]
impl MailProvider for MockProvider {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn state(&self) -> ProviderState {
        ProviderState::Ready
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn initialize(&self) -> mailsync::Result<()> {
        if self.behavior.fail_init {
            return Err(MailError::Auth("bad credentials".into()));
        }
        Ok(())
    }

    async fn sync(&self, _opts: SyncOptions) -> mailsync::Result<SyncStats> {
        self.behavior.sync_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.behavior.sync_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SyncStats {
            total_messages: self.behavior.inbox.len() as u64,
            new_messages: self.behavior.inbox.len() as u64,
            ..Default::default()
        })
    }

    async fn get_folders(&self) -> mailsync::Result<Vec<Folder>> {
        Ok(vec![])
    }

    async fn get_messages(
        &self,
        _folder: &str,
        opts: FetchOptions,
    ) -> mailsync::Result<Vec<Message>> {
        if self.behavior.fail_reads {
            return Err(MailError::Network("connection reset".into()));
        }
        let mut out = self.behavior.inbox.clone();
        out.sort_by(|a, b| b.date.cmp(&a.date));
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn get_message(&self, message_id: &str) -> mailsync::Result<Message> {
        self.behavior
            .inbox
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| MailError::MessageNotFound(message_id.to_string()))
    }

    async fn search(&self, query: &str, opts: FetchOptions) -> mailsync::Result<Vec<Message>> {
        self.behavior.search_limits.lock().await.push(opts.limit);
        Ok(self
            .behavior
            .inbox
            .iter()
            .filter(|m| m.subject.contains(query))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, message_id: &str, _read: bool) -> mailsync::Result<()> {
        if self.behavior.network_down.load(Ordering::SeqCst) {
            return Err(MailError::Network("etimedout".into()));
        }
        self.behavior
            .marked_read
            .lock()
            .await
            .push(message_id.to_string());
        Ok(())
    }

    async fn mark_starred(&self, _message_id: &str, _starred: bool) -> mailsync::Result<()> {
        Ok(())
    }

    async fn move_message(&self, _message_id: &str, _folder: &str) -> mailsync::Result<()> {
        Ok(())
    }

    async fn delete_message(&self, _message_id: &str) -> mailsync::Result<()> {
        Ok(())
    }

    async fn send_message(&self, _opts: SendOptions) -> mailsync::Result<SendOutcome> {
        self.behavior.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.network_down.load(Ordering::SeqCst) {
            return Err(MailError::Network("connection refused".into()));
        }
        Ok(SendOutcome {
            message_id: "<sent@test>".into(),
            accepted: vec![],
            rejected: vec![],
            response: "250 OK".into(),
        })
    }

    async fn start_watch(&self, _folder: &str) -> mailsync::Result<()> {
        Ok(())
    }

    async fn stop_watch(&self, _folder: &str) -> mailsync::Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> mailsync::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    behaviors: Mutex<HashMap<String, Arc<MockBehavior>>>,
}

impl MockFactory {
    async fn script(&self, account_id: &str, behavior: MockBehavior) -> Arc<MockBehavior> {
        let behavior = Arc::new(behavior);
        self.behaviors
            .lock()
            .await
            .insert(account_id.to_string(), behavior.clone());
        behavior
    }
}

#[async_trait]
impl ProviderFactory for MockFactory {
    async fn create(&self, account: &Account) -> mailsync::Result<Arc<dyn MailProvider>> {
        let behavior = self
            .behaviors
            .lock()
            .await
            .get(&account.id)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(MockProvider {
            account_id: account.id.clone(),
            behavior,
        }))
    }
}

fn test_engine() -> EngineConfig {
    EngineConfig {
        sync_interval_secs: 0,
        queue_drain_interval_secs: 3600,
        ..EngineConfig::default()
    }
}

fn build_manager_with_bus(
    engine: EngineConfig,
) -> (
    Arc<EmailServiceManager>,
    Arc<MockFactory>,
    flume::Receiver<MailEvent>,
    EventBus,
) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let factory = Arc::new(MockFactory::default());
    let store = Arc::new(MemoryStore::new());
    let (bus, internal_rx) = EventBus::new();
    let (manager, rx) =
        EmailServiceManager::new(engine, factory.clone(), store, bus.clone(), internal_rx);
    (manager, factory, rx, bus)
}

fn build_manager(
    engine: EngineConfig,
) -> (
    Arc<EmailServiceManager>,
    Arc<MockFactory>,
    flume::Receiver<MailEvent>,
) {
    let (manager, factory, rx, _bus) = build_manager_with_bus(engine);
    (manager, factory, rx)
}

#[tokio::test]
async fn add_account_rolls_back_on_init_failure() {
    let (manager, factory, _rx) = build_manager(test_engine());
    factory
        .script(
            "bad",
            MockBehavior {
                fail_init: true,
                ..Default::default()
            },
        )
        .await;

    let err = manager.add_account(account("bad")).await.unwrap_err();
    assert!(matches!(err, MailError::Auth(_)));
    assert!(manager.get_account("bad").await.is_none());
    assert!(manager.list_accounts().await.is_empty());
}

#[tokio::test]
async fn duplicate_account_is_rejected() {
    let (manager, factory, _rx) = build_manager(test_engine());
    factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();
    let err = manager.add_account(account("a1")).await.unwrap_err();
    assert!(matches!(err, MailError::InvalidInput(_)));
}

#[tokio::test]
async fn concurrency_cap_rejects_excess_syncs() {
    let engine = EngineConfig {
        max_concurrent_syncs: 1,
        ..test_engine()
    };
    let (manager, factory, _rx) = build_manager(engine);
    for id in ["a1", "a2"] {
        factory
            .script(
                id,
                MockBehavior {
                    sync_delay: Some(Duration::from_millis(500)),
                    ..Default::default()
                },
            )
            .await;
        manager.add_account(account(id)).await.unwrap();
    }

    let m1 = manager.clone();
    let first = tokio::spawn(async move { m1.sync_account("a1", SyncOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = manager
        .sync_account("a2", SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MailError::ConcurrencyLimit(1)));

    first.await.unwrap().unwrap();
    // Permit released: the second account can sync now.
    manager.sync_account("a2", SyncOptions::default()).await.unwrap();
}

#[tokio::test]
async fn unified_inbox_merges_sorted_and_skips_failing_provider() {
    let (manager, factory, _rx) = build_manager(test_engine());

    factory
        .script(
            "a1",
            MockBehavior {
                inbox: (0..8).map(|n| message("a1", n, 1000 + n as i64 * 10)).collect(),
                ..Default::default()
            },
        )
        .await;
    factory
        .script(
            "a2",
            MockBehavior {
                inbox: (0..8).map(|n| message("a2", n, 1005 + n as i64 * 10)).collect(),
                ..Default::default()
            },
        )
        .await;
    factory
        .script(
            "broken",
            MockBehavior {
                fail_reads: true,
                ..Default::default()
            },
        )
        .await;

    for id in ["a1", "a2", "broken"] {
        manager.add_account(account(id)).await.unwrap();
    }

    // 10 split across three providers is 4 each; the broken one
    // contributes nothing, so the two healthy accounts yield 8.
    let unified = manager.get_unified_messages(10).await;
    assert_eq!(unified.len(), 8);
    assert!(unified.len() <= 10);
    assert!(unified.windows(2).all(|w| w[0].date >= w[1].date));
    assert!(unified.iter().all(|m| m.account_id != "broken"));
    assert_eq!(unified.iter().filter(|m| m.account_id == "a1").count(), 4);
    assert_eq!(unified.iter().filter(|m| m.account_id == "a2").count(), 4);
}

#[tokio::test]
async fn failed_send_is_parked_in_offline_queue() {
    let (manager, factory, _rx) = build_manager(test_engine());
    let behavior = factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    behavior.network_down.store(true, Ordering::SeqCst);
    let err = manager
        .send_message("a1", SendOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_network());
    assert_eq!(manager.queued_operations().await, 1);

    // Network back: drain replays the send.
    behavior.network_down.store(false, Ordering::SeqCst);
    manager.drain_queue().await;
    assert_eq!(manager.queued_operations().await, 0);
    assert_eq!(behavior.send_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn queued_mutation_replays_in_order_and_respects_attempts() {
    let engine = EngineConfig {
        offline_queue_max_attempts: 2,
        ..test_engine()
    };
    let (manager, factory, _rx) = build_manager(engine);
    let behavior = factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    behavior.network_down.store(true, Ordering::SeqCst);
    manager.mark_read("a1", "a1-1", true).await.unwrap_err();
    manager.mark_read("a1", "a1-2", true).await.unwrap_err();
    assert_eq!(manager.queued_operations().await, 2);

    // First drain still offline: attempts tick up but nothing flushes.
    manager.drain_queue().await;
    assert_eq!(manager.queued_operations().await, 2);

    // Second drain still offline: attempt budget (2) is exhausted.
    manager.drain_queue().await;
    assert_eq!(manager.queued_operations().await, 0);
    assert!(behavior.marked_read.lock().await.is_empty());
}

#[tokio::test]
async fn drain_flushes_in_fifo_order() {
    let (manager, factory, _rx) = build_manager(test_engine());
    let behavior = factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    behavior.network_down.store(true, Ordering::SeqCst);
    manager.mark_read("a1", "first", true).await.unwrap_err();
    manager.mark_read("a1", "second", true).await.unwrap_err();

    behavior.network_down.store(false, Ordering::SeqCst);
    manager.drain_queue().await;

    let order = behavior.marked_read.lock().await.clone();
    assert_eq!(order, vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn queue_drops_operations_for_removed_accounts() {
    let (manager, factory, _rx) = build_manager(test_engine());
    let behavior = factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    behavior.network_down.store(true, Ordering::SeqCst);
    manager.mark_read("a1", "m", true).await.unwrap_err();
    assert_eq!(manager.queued_operations().await, 1);

    manager.remove_account("a1").await.unwrap();
    assert_eq!(manager.queued_operations().await, 0);
}

#[tokio::test]
async fn remove_account_is_idempotent() {
    let (manager, factory, _rx) = build_manager(test_engine());
    factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    assert!(manager.remove_account("a1").await.unwrap());
    assert!(!manager.remove_account("a1").await.unwrap());
    assert!(manager.get_account("a1").await.is_none());
}

#[tokio::test]
async fn sync_updates_status_and_emits_events() {
    let (manager, factory, rx) = build_manager(test_engine());
    factory
        .script(
            "a1",
            MockBehavior {
                inbox: vec![message("a1", 1, 1000)],
                ..Default::default()
            },
        )
        .await;
    manager.add_account(account("a1")).await.unwrap();

    let stats = manager
        .sync_account("a1", SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.new_messages, 1);

    let status = manager.get_sync_status("a1").await.unwrap();
    assert_eq!(status.state, SyncState::Idle);
    assert!(status.last_sync.is_some());
    // add_account already ran one sync pass, so the cumulative stats
    // count the message twice.
    assert_eq!(status.stats.new_messages, 2);

    // AccountAdded, then syncing + idle status transitions.
    let mut saw_syncing = false;
    let mut saw_idle = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_secs(1), rx.recv_async()).await
    {
        if let MailEvent::SyncStatus { status } = event {
            match status.state {
                SyncState::Syncing => saw_syncing = true,
                SyncState::Idle => saw_idle = true,
                SyncState::Error => {}
            }
        }
        if saw_syncing && saw_idle {
            break;
        }
    }
    assert!(saw_syncing && saw_idle);
}

#[tokio::test]
async fn search_merges_across_accounts() {
    let (manager, factory, _rx) = build_manager(test_engine());
    factory
        .script(
            "a1",
            MockBehavior {
                inbox: vec![message("a1", 1, 2000)],
                ..Default::default()
            },
        )
        .await;
    factory
        .script(
            "a2",
            MockBehavior {
                inbox: vec![message("a2", 2, 3000)],
                ..Default::default()
            },
        )
        .await;
    manager.add_account(account("a1")).await.unwrap();
    manager.add_account(account("a2")).await.unwrap();

    let hits = manager.search_all("message", 10).await;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].account_id, "a2");

    let targeted = manager
        .search_messages("message", Some("a1"), 10)
        .await
        .unwrap();
    assert_eq!(targeted.len(), 1);
    assert_eq!(targeted[0].account_id, "a1");
}

#[tokio::test]
async fn fan_out_search_splits_limit_evenly() {
    let (manager, factory, _rx) = build_manager(test_engine());
    let b1 = factory
        .script(
            "a1",
            MockBehavior {
                inbox: vec![message("a1", 1, 2000)],
                ..Default::default()
            },
        )
        .await;
    let b2 = factory
        .script(
            "a2",
            MockBehavior {
                inbox: vec![message("a2", 2, 3000)],
                ..Default::default()
            },
        )
        .await;
    manager.add_account(account("a1")).await.unwrap();
    manager.add_account(account("a2")).await.unwrap();

    manager.search_messages("message", None, 10).await.unwrap();
    assert_eq!(b1.search_limits.lock().await.as_slice(), &[Some(5)]);
    assert_eq!(b2.search_limits.lock().await.as_slice(), &[Some(5)]);

    // A targeted search keeps the full limit.
    manager
        .search_messages("message", Some("a1"), 10)
        .await
        .unwrap();
    assert_eq!(
        b1.search_limits.lock().await.as_slice(),
        &[Some(5), Some(10)]
    );
}

#[tokio::test]
async fn sync_progress_reports_current_folder() {
    let (manager, factory, rx, bus) = build_manager_with_bus(test_engine());
    factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    bus.emit(MailEvent::SyncProgress {
        account_id: "a1".into(),
        folder: Some("Archive".into()),
        progress: 40,
    });
    // Status is updated before the event is forwarded, so seeing it on
    // the public stream means the bookkeeping already happened.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv_async())
            .await
            .expect("progress event")
            .unwrap();
        if matches!(event, MailEvent::SyncProgress { .. }) {
            break;
        }
    }

    let status = manager.get_sync_status("a1").await.unwrap();
    let op = status.current_operation.expect("operation in flight");
    assert_eq!(op.folder.as_deref(), Some("Archive"));
    assert_eq!(op.progress, 40);
}

#[tokio::test]
async fn background_pass_honors_per_account_sync_config() {
    let (manager, factory, _rx) = build_manager(test_engine());
    let eager = factory.script("eager", MockBehavior::default()).await;
    let disabled = factory.script("disabled", MockBehavior::default()).await;
    let rested = factory.script("rested", MockBehavior::default()).await;

    let mut a = account("eager");
    a.sync.interval_secs = Some(0);
    manager.add_account(a).await.unwrap();

    let mut a = account("disabled");
    a.sync = AccountSyncConfig {
        enabled: false,
        interval_secs: Some(0),
    };
    manager.add_account(a).await.unwrap();

    let mut a = account("rested");
    a.sync.interval_secs = Some(3600);
    manager.add_account(a).await.unwrap();

    // Each add ran one initial sync.
    assert_eq!(eager.sync_calls.load(Ordering::SeqCst), 1);
    assert_eq!(disabled.sync_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rested.sync_calls.load(Ordering::SeqCst), 1);

    manager.sync_due_accounts(SyncOptions::default()).await;

    // Only the zero-interval enabled account was due again.
    assert_eq!(eager.sync_calls.load(Ordering::SeqCst), 2);
    assert_eq!(disabled.sync_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rested.sync_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn update_account_keeps_old_provider_on_failure() {
    let (manager, factory, _rx) = build_manager(test_engine());
    factory.script("a1", MockBehavior::default()).await;
    manager.add_account(account("a1")).await.unwrap();

    factory
        .script(
            "a1",
            MockBehavior {
                fail_init: true,
                ..Default::default()
            },
        )
        .await;
    let err = manager.update_account(account("a1")).await.unwrap_err();
    assert!(matches!(err, MailError::Auth(_)));

    // The original provider still serves the account.
    assert!(manager.get_account("a1").await.is_some());
    manager.sync_account("a1", SyncOptions::default()).await.unwrap();
}

#[tokio::test]
async fn offline_queue_ring_semantics_standalone() {
    let queue = OfflineQueue::new(2, 3);
    for n in 0..3 {
        queue
            .push(QueuedOperation::new(
                "a1",
                QueuedAction::Delete {
                    message_id: format!("m{n}"),
                },
            ))
            .await;
    }
    let items = queue.take_all().await;
    assert_eq!(items.len(), 2);
    match &items[0].action {
        QueuedAction::Delete { message_id } => assert_eq!(message_id, "m1"),
        other => panic!("unexpected action: {other:?}"),
    }
}
