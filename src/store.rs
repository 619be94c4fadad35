//! Message persistence seam
//!
//! The engine writes synced messages through [`MessageStore`]; the host
//! supplies a database-backed implementation. [`MemoryStore`] is the
//! in-process default used by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{Account, FetchOptions, Message};
use crate::Result;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace a message by id.
    async fn upsert_message(&self, message: &Message) -> Result<()>;

    async fn upsert_account(&self, account: &Account) -> Result<()>;

    /// Remove the account and all of its messages.
    async fn delete_account(&self, account_id: &str) -> Result<()>;

    async fn delete_message(&self, account_id: &str, message_id: &str) -> Result<()>;

    /// Single message by id, if known.
    async fn get_message(&self, account_id: &str, message_id: &str) -> Result<Option<Message>>;

    /// Messages for one account, newest first.
    async fn get_messages(&self, account_id: &str, opts: FetchOptions) -> Result<Vec<Message>>;
}

/// HashMap-backed store.
#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn upsert_message(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        let bucket = messages.entry(message.account_id.clone()).or_default();
        match bucket.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => bucket.push(message.clone()),
        }
        Ok(())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn delete_account(&self, account_id: &str) -> Result<()> {
        self.accounts.write().await.remove(account_id);
        self.messages.write().await.remove(account_id);
        Ok(())
    }

    async fn delete_message(&self, account_id: &str, message_id: &str) -> Result<()> {
        if let Some(bucket) = self.messages.write().await.get_mut(account_id) {
            bucket.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn get_message(&self, account_id: &str, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .get(account_id)
            .and_then(|b| b.iter().find(|m| m.id == message_id))
            .cloned())
    }

    async fn get_messages(&self, account_id: &str, opts: FetchOptions) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut out: Vec<Message> = messages
            .get(account_id)
            .map(|b| b.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|m| opts.since.map_or(true, |since| m.date >= since))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date.cmp(&a.date));
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
