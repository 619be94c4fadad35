//! Offline mutation queue
//!
//! Mutations that fail with a network-class error are parked here and
//! replayed by the manager's drain loop. The queue is a bounded ring:
//! when full, the oldest entry is evicted so recent user intent wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::SendOptions;

/// The mutation to replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedAction {
    Send { options: SendOptions },
    MarkRead { message_id: String, read: bool },
    MarkStarred { message_id: String, starred: bool },
    Move { message_id: String, folder: String },
    Delete { message_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub account_id: String,
    pub action: QueuedAction,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn new(account_id: impl Into<String>, action: QueuedAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            action,
            attempts: 0,
            queued_at: Utc::now(),
        }
    }
}

pub struct OfflineQueue {
    items: Mutex<std::collections::VecDeque<QueuedOperation>>,
    capacity: usize,
    max_attempts: u32,
}

impl OfflineQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            items: Mutex::new(std::collections::VecDeque::with_capacity(capacity.min(64))),
            capacity,
            max_attempts,
        }
    }

    /// Enqueue, evicting the oldest entry when at capacity.
    pub async fn push(&self, op: QueuedOperation) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            if let Some(evicted) = items.pop_front() {
                warn!(op_id = %evicted.id, account_id = %evicted.account_id,
                      "offline queue full, evicting oldest operation");
            }
        }
        debug!(op_id = %op.id, account_id = %op.account_id, "operation queued offline");
        items.push_back(op);
    }

    /// Take every queued operation for replay. Failed ones come back
    /// via [`requeue`](Self::requeue).
    pub async fn take_all(&self) -> Vec<QueuedOperation> {
        self.items.lock().await.drain(..).collect()
    }

    /// Requeue a failed replay. Returns false when the operation has
    /// used up its attempts and is dropped instead.
    pub async fn requeue(&self, mut op: QueuedOperation) -> bool {
        op.attempts += 1;
        if op.attempts >= self.max_attempts {
            warn!(op_id = %op.id, account_id = %op.account_id, attempts = op.attempts,
                  "dropping operation after repeated failures");
            return false;
        }
        self.push(op).await;
        true
    }

    /// Drop everything queued for a removed account.
    pub async fn remove_account(&self, account_id: &str) -> usize {
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|op| op.account_id != account_id);
        before - items.len()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(account: &str) -> QueuedOperation {
        QueuedOperation::new(
            account,
            QueuedAction::MarkRead {
                message_id: "m1".into(),
                read: true,
            },
        )
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let queue = OfflineQueue::new(2, 3);
        let first = op("a");
        let first_id = first.id.clone();
        queue.push(first).await;
        queue.push(op("a")).await;
        queue.push(op("a")).await;

        let items = queue.take_all().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|o| o.id != first_id));
    }

    #[tokio::test]
    async fn requeue_drops_after_max_attempts() {
        let queue = OfflineQueue::new(10, 3);
        let mut item = op("a");
        assert!(queue.requeue(item.clone()).await);
        item.attempts = 2;
        assert!(!queue.requeue(item).await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn remove_account_filters_queue() {
        let queue = OfflineQueue::new(10, 3);
        queue.push(op("a")).await;
        queue.push(op("b")).await;
        queue.push(op("a")).await;
        assert_eq!(queue.remove_account("a").await, 2);
        assert_eq!(queue.len().await, 1);
    }
}
