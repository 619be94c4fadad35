//! Typed event bus
//!
//! Every observable change the engine makes is published here as a
//! closed enum; consumers subscribe to a flume receiver rather than
//! matching on string topics.

use serde::{Deserialize, Serialize};

use super::{Account, Message, SyncStatus};

/// Engine events, in emission order per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MailEvent {
    AccountAdded { account: Account },
    AccountUpdated { account: Account },
    AccountRemoved { account_id: String },
    /// New messages arrived, either from a sync pass or a push/IDLE
    /// notification.
    NewMail {
        account_id: String,
        folder: String,
        messages: Vec<Message>,
    },
    /// The server signalled activity in a monitored mailbox (IDLE
    /// notification or push). Carries no messages; a sync pass follows.
    MailboxActivity { account_id: String, folder: String },
    /// Progress of a running sync pass. `folder` names the mailbox
    /// currently being synced where the provider has folders.
    SyncProgress {
        account_id: String,
        folder: Option<String>,
        progress: u8,
    },
    MessageUpdated { account_id: String, message: Message },
    MessageDeleted { account_id: String, message_id: String },
    SyncStatus { status: SyncStatus },
    SyncError { account_id: String, error: String },
    ProviderError { account_id: String, error: String },
    IdleError { account_id: String, folder: String, error: String },
    /// Reconnect attempts are exhausted, for a monitored folder or,
    /// with no folder, for the account's operational connection. The
    /// account falls back to interval syncs until the next manual sync
    /// or restart.
    ReconnectExhausted {
        account_id: String,
        folder: Option<String>,
    },
    QueueDrained { flushed: usize, abandoned: usize },
}

/// Broadcast fan-out over flume. Senders never block; a lagging or
/// dropped subscriber cannot stall the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: flume::Sender<MailEvent>,
}

impl EventBus {
    pub fn new() -> (Self, flume::Receiver<MailEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Publish an event. Errors (no receivers left) are ignored; the
    /// engine keeps working headless.
    pub fn emit(&self, event: MailEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscriber_does_not_panic() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(MailEvent::AccountRemoved {
            account_id: "a1".into(),
        });
    }

    #[test]
    fn events_are_delivered_in_order() {
        let (bus, rx) = EventBus::new();
        bus.emit(MailEvent::AccountRemoved {
            account_id: "first".into(),
        });
        bus.emit(MailEvent::AccountRemoved {
            account_id: "second".into(),
        });
        match rx.recv().unwrap() {
            MailEvent::AccountRemoved { account_id } => assert_eq!(account_id, "first"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().unwrap() {
            MailEvent::AccountRemoved { account_id } => assert_eq!(account_id, "second"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
