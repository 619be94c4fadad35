//! Gmail API provider
//!
//! Talks to the Gmail REST API v1 over reqwest. Labels are normalized
//! to folders, label ids to flags, and sends go through the raw
//! message endpoint so Gmail threads and stores them natively.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compose;
use crate::config::EngineConfig;
use crate::credentials::CredentialProvider;
use crate::provider::normalize::parse_address_list;
use crate::provider::{Capabilities, MailProvider, ProviderState};
use crate::store::MessageStore;
use crate::types::{
    Account, Address, Attachment, EventBus, FetchOptions, Folder, FolderType, MailEvent, Message,
    MessageFlags, Priority, SendOptions, SendOutcome, SyncOptions, SyncStats,
};
use crate::{MailError, Result};

const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_LIST_LIMIT: usize = 100;
/// Paces API calls under Gmail's per-user quota.
const API_RATE_LIMIT: usize = 10;
/// How often the watch task checks for history movement.
const WATCH_POLL_SECS: u64 = 60;

// ---- wire types -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Deserialize)]
struct ListLabelsResponse {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type", default)]
    label_type: Option<String>,
    #[serde(rename = "messagesTotal", default)]
    messages_total: Option<u32>,
    #[serde(rename = "messagesUnread", default)]
    messages_unread: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    #[serde(rename = "internalDate", default)]
    internal_date: Option<String>,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<PayloadHeader>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct PayloadHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "attachmentId", default)]
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(rename = "historyId")]
    history_id: String,
    /// Epoch milliseconds.
    expiration: String,
}

// ---- provider -------------------------------------------------------------

pub struct GmailProvider {
    account: Account,
    state: std::sync::RwLock<ProviderState>,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<dyn MessageStore>,
    events: EventBus,
    engine: EngineConfig,
    rate: crate::rate_limit::RateWindow,
    /// Pub/Sub topic for `users.watch`; push is unavailable without it.
    push_topic: Option<String>,
    watchers: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl GmailProvider {
    pub fn new(
        account: Account,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn MessageStore>,
        events: EventBus,
        engine: EngineConfig,
        push_topic: Option<String>,
    ) -> Self {
        Self {
            account,
            state: std::sync::RwLock::new(ProviderState::Created),
            http: reqwest::Client::new(),
            credentials,
            store,
            events,
            engine,
            rate: crate::rate_limit::RateWindow::new(API_RATE_LIMIT, Duration::from_secs(1)),
            push_topic,
            watchers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn set_state(&self, state: ProviderState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ProviderState::Ready => Ok(()),
            ProviderState::Destroyed => Err(MailError::Destroyed(self.account.id.clone())),
            _ => Err(MailError::NotInitialized(self.account.id.clone())),
        }
    }

    async fn token(&self) -> Result<String> {
        self.credentials.get_valid_access_token(&self.account).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.rate.acquire().await;
        let token = self.token().await?;
        let resp = tokio::time::timeout(
            self.engine.operation_timeout(),
            self.http.get(url).bearer_auth(&token).send(),
        )
        .await
        .map_err(|_| MailError::Timeout(self.engine.operation_timeout_secs))??;
        decode_response(resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        self.rate.acquire().await;
        let token = self.token().await?;
        let resp = tokio::time::timeout(
            self.engine.operation_timeout(),
            self.http.post(url).bearer_auth(&token).json(&body).send(),
        )
        .await
        .map_err(|_| MailError::Timeout(self.engine.operation_timeout_secs))??;
        decode_response(resp).await
    }

    async fn profile(&self) -> Result<Profile> {
        self.get_json(&format!("{BASE_URL}/users/me/profile")).await
    }

    async fn fetch_full(&self, id: &str) -> Result<GmailMessage> {
        self.get_json(&format!("{BASE_URL}/users/me/messages/{id}?format=full"))
            .await
    }

    async fn list_ids(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let url = format!(
            "{BASE_URL}/users/me/messages?maxResults={limit}&q={}",
            urlencode(query)
        );
        let resp: ListMessagesResponse = self.get_json(&url).await?;
        Ok(resp.messages.into_iter().map(|m| m.id).collect())
    }

    async fn modify_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()> {
        let url = format!("{BASE_URL}/users/me/messages/{id}/modify");
        let _: GmailMessage = self
            .post_json(
                &url,
                json!({ "addLabelIds": add, "removeLabelIds": remove }),
            )
            .await?;
        Ok(())
    }

    /// Query string for one of our folder names.
    fn folder_query(folder: &str) -> String {
        match folder.to_uppercase().as_str() {
            "INBOX" => "in:inbox".to_string(),
            "SENT" => "in:sent".to_string(),
            "DRAFT" | "DRAFTS" => "in:drafts".to_string(),
            "TRASH" => "in:trash".to_string(),
            "SPAM" => "in:spam".to_string(),
            "ARCHIVE" => "-in:inbox -in:trash -in:spam".to_string(),
            other => format!("label:{}", other.to_lowercase()),
        }
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn account_id(&self) -> &str {
        &self.account.id
    }

    fn state(&self) -> ProviderState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: self.push_topic.is_some(),
            labels: true,
            incremental_sync: true,
            rate_limit: API_RATE_LIMIT as u32,
            rate_window_secs: 1,
        }
    }

    async fn initialize(&self) -> Result<()> {
        match self.state() {
            ProviderState::Ready => return Ok(()),
            ProviderState::Destroyed => return Err(MailError::Destroyed(self.account.id.clone())),
            _ => {}
        }
        self.set_state(ProviderState::Initializing);
        match self.profile().await {
            Ok(profile) => {
                info!(account_id = %self.account.id, email = %profile.email_address,
                      "Gmail provider ready");
                self.set_state(ProviderState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(ProviderState::Error);
                Err(e)
            }
        }
    }

    async fn sync(&self, opts: SyncOptions) -> Result<SyncStats> {
        self.ensure_ready()?;
        let mut stats = SyncStats::default();

        let mut query = String::new();
        if !opts.full_sync {
            query.push_str("-in:spam -in:trash");
        }
        if let Some(since) = opts.since {
            if !query.is_empty() {
                query.push(' ');
            }
            query.push_str(&format!("after:{}", since.timestamp()));
        }

        let ids = self
            .list_ids(&query, opts.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await?;
        debug!(account_id = %self.account.id, count = ids.len(), "listing complete");

        let total = ids.len().max(1);
        let mut fresh = Vec::new();
        for (done, id) in ids.into_iter().enumerate() {
            self.events.emit(MailEvent::SyncProgress {
                account_id: self.account.id.clone(),
                folder: None,
                progress: ((done * 100) / total) as u8,
            });
            // One bad message must not abort the whole pass.
            let full = match self.fetch_full(&id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(account_id = %self.account.id, message_id = %id, error = %e,
                          "message fetch failed");
                    stats.sync_errors += 1;
                    continue;
                }
            };
            let message = normalize_gmail(&self.account.id, full);
            let existed = self
                .store
                .get_message(&self.account.id, &message.id)
                .await?
                .is_some();
            self.store.upsert_message(&message).await?;
            stats.total_messages += 1;
            if existed {
                stats.updated_messages += 1;
            } else {
                stats.new_messages += 1;
                fresh.push(message);
            }
        }
        if !fresh.is_empty() {
            self.events.emit(MailEvent::NewMail {
                account_id: self.account.id.clone(),
                folder: "INBOX".to_string(),
                messages: fresh,
            });
        }
        self.events.emit(MailEvent::SyncProgress {
            account_id: self.account.id.clone(),
            folder: None,
            progress: 100,
        });
        Ok(stats)
    }

    async fn get_folders(&self) -> Result<Vec<Folder>> {
        self.ensure_ready()?;
        let resp: ListLabelsResponse = self
            .get_json(&format!("{BASE_URL}/users/me/labels"))
            .await?;
        Ok(resp
            .labels
            .into_iter()
            .filter(|l| {
                // Category tabs and internal labels are not folders.
                !l.id.starts_with("CATEGORY_") && l.id != "UNREAD" && l.id != "STARRED"
            })
            .map(|l| Folder {
                folder_type: label_to_folder_type(&l.id, l.label_type.as_deref()),
                id: l.id,
                account_id: self.account.id.clone(),
                name: l.name,
                message_count: l.messages_total,
                unread_count: l.messages_unread,
                selectable: true,
            })
            .collect())
    }

    async fn get_messages(&self, folder: &str, opts: FetchOptions) -> Result<Vec<Message>> {
        self.ensure_ready()?;
        let mut query = Self::folder_query(folder);
        if let Some(since) = opts.since {
            query.push_str(&format!(" after:{}", since.timestamp()));
        }
        let ids = self
            .list_ids(&query, opts.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(normalize_gmail(&self.account.id, self.fetch_full(&id).await?));
        }
        Ok(out)
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.ensure_ready()?;
        Ok(normalize_gmail(
            &self.account.id,
            self.fetch_full(message_id).await?,
        ))
    }

    async fn search(&self, query: &str, opts: FetchOptions) -> Result<Vec<Message>> {
        self.ensure_ready()?;
        let ids = self
            .list_ids(query, opts.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(normalize_gmail(&self.account.id, self.fetch_full(&id).await?));
        }
        Ok(out)
    }

    async fn mark_read(&self, message_id: &str, read: bool) -> Result<()> {
        self.ensure_ready()?;
        if read {
            self.modify_labels(message_id, &[], &["UNREAD"]).await
        } else {
            self.modify_labels(message_id, &["UNREAD"], &[]).await
        }
    }

    async fn mark_starred(&self, message_id: &str, starred: bool) -> Result<()> {
        self.ensure_ready()?;
        if starred {
            self.modify_labels(message_id, &["STARRED"], &[]).await
        } else {
            self.modify_labels(message_id, &[], &["STARRED"]).await
        }
    }

    async fn move_message(&self, message_id: &str, folder: &str) -> Result<()> {
        self.ensure_ready()?;
        let target = folder_to_label(folder);
        let current = self.fetch_full(message_id).await?;
        let remove: Vec<&str> = current
            .label_ids
            .iter()
            .filter(|l| is_placement_label(l))
            .map(String::as_str)
            .collect();
        let add: Vec<&str> = if target == "ARCHIVE" {
            Vec::new()
        } else {
            vec![target.as_str()]
        };
        self.modify_labels(message_id, &add, &remove).await
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.ensure_ready()?;
        let current = self.fetch_full(message_id).await?;
        if current.label_ids.iter().any(|l| l == "TRASH") {
            // Second delete is permanent.
            self.rate.acquire().await;
            let token = self.token().await?;
            let url = format!("{BASE_URL}/users/me/messages/{message_id}");
            let resp = self.http.delete(&url).bearer_auth(&token).send().await?;
            if !resp.status().is_success() {
                return Err(http_error(resp).await);
            }
        } else {
            let url = format!("{BASE_URL}/users/me/messages/{message_id}/trash");
            let _: GmailMessage = self.post_json(&url, json!({})).await?;
        }
        self.store
            .delete_message(&self.account.id, message_id)
            .await?;
        self.events.emit(MailEvent::MessageDeleted {
            account_id: self.account.id.clone(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    async fn send_message(&self, opts: SendOptions) -> Result<SendOutcome> {
        self.ensure_ready()?;
        let from = Address {
            name: self.account.display_name.clone(),
            address: self.account.email.clone(),
        };
        let message_id = format!("<{}@mail.gmail.com>", uuid::Uuid::new_v4());
        let mime = compose::build_mime(&self.http, &from, &opts, &message_id).await?;
        let raw = URL_SAFE_NO_PAD.encode(mime.formatted());

        let resp: SendResponse = self
            .post_json(
                &format!("{BASE_URL}/users/me/messages/send"),
                json!({ "raw": raw }),
            )
            .await?;
        debug!(account_id = %self.account.id, gmail_id = %resp.id, "message sent");
        Ok(SendOutcome {
            message_id,
            accepted: opts
                .to
                .iter()
                .chain(&opts.cc)
                .chain(&opts.bcc)
                .map(|a| a.address.clone())
                .collect(),
            rejected: Vec::new(),
            response: resp.id,
        })
    }

    /// Register a `users.watch` subscription and poll the profile
    /// history id, emitting `MailboxActivity` when it moves. The watch
    /// is re-registered before its expiry.
    async fn start_watch(&self, folder: &str) -> Result<()> {
        self.ensure_ready()?;
        let Some(topic) = self.push_topic.clone() else {
            return Err(MailError::NotSupported(
                "Gmail push requires a configured Pub/Sub topic".into(),
            ));
        };

        self.stop_watch(folder).await?;

        let watch: WatchResponse = self
            .post_json(
                &format!("{BASE_URL}/users/me/watch"),
                json!({ "topicName": &topic, "labelIds": ["INBOX"] }),
            )
            .await?;
        let mut last_history: u64 = watch.history_id.parse().unwrap_or(0);
        let mut expiration_ms: i64 = watch.expiration.parse().unwrap_or(0);
        info!(account_id = %self.account.id, history_id = last_history, "Gmail watch registered");

        let account_id = self.account.id.clone();
        let folder_name = folder.to_string();
        let events = self.events.clone();
        let http = self.http.clone();
        let credentials = self.credentials.clone();
        let account = self.account.clone();

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(WATCH_POLL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let token = match credentials.get_valid_access_token(&account).await {
                    Ok(t) => t,
                    Err(e) => {
                        events.emit(MailEvent::IdleError {
                            account_id: account_id.clone(),
                            folder: folder_name.clone(),
                            error: e.to_string(),
                        });
                        continue;
                    }
                };

                // Re-register when within ten minutes of expiry.
                let now_ms = Utc::now().timestamp_millis();
                if expiration_ms > 0 && now_ms > expiration_ms - 10 * 60 * 1000 {
                    let renewed = http
                        .post(format!("{BASE_URL}/users/me/watch"))
                        .bearer_auth(&token)
                        .json(&json!({ "topicName": &topic, "labelIds": ["INBOX"] }))
                        .send()
                        .await;
                    match renewed {
                        Ok(resp) if resp.status().is_success() => {
                            if let Ok(w) = resp.json::<WatchResponse>().await {
                                expiration_ms = w.expiration.parse().unwrap_or(0);
                                debug!(account_id = %account_id, "Gmail watch renewed");
                            }
                        }
                        Ok(resp) => warn!(account_id = %account_id, status = %resp.status(),
                                           "Gmail watch renewal failed"),
                        Err(e) => warn!(account_id = %account_id, error = %e,
                                         "Gmail watch renewal failed"),
                    }
                }

                let profile = http
                    .get(format!("{BASE_URL}/users/me/profile"))
                    .bearer_auth(&token)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status);
                match profile {
                    Ok(resp) => {
                        if let Ok(p) = resp.json::<Profile>().await {
                            let current: u64 = p.history_id.parse().unwrap_or(last_history);
                            if current > last_history {
                                last_history = current;
                                events.emit(MailEvent::MailboxActivity {
                                    account_id: account_id.clone(),
                                    folder: folder_name.clone(),
                                });
                            }
                        }
                    }
                    Err(e) => debug!(account_id = %account_id, error = %e,
                                      "history poll failed"),
                }
            }
        });

        self.watchers.lock().await.insert(folder.to_string(), task);
        Ok(())
    }

    async fn stop_watch(&self, folder: &str) -> Result<()> {
        if let Some(task) = self.watchers.lock().await.remove(folder) {
            task.abort();
            debug!(account_id = %self.account.id, folder, "Gmail watch stopped");
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut watchers = self.watchers.lock().await;
        for (_, task) in watchers.drain() {
            task.abort();
        }
        self.set_state(ProviderState::Destroyed);
        info!(account_id = %self.account.id, "Gmail provider destroyed");
        Ok(())
    }
}

// ---- normalization --------------------------------------------------------

async fn decode_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(http_error(resp).await);
    }
    Ok(resp.json::<T>().await?)
}

async fn http_error(resp: reqwest::Response) -> MailError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => MailError::Auth(format!("Gmail API {status}: {body}")),
        404 => MailError::MessageNotFound(body),
        429 | 500..=599 => MailError::Network(format!("Gmail API {status}: {body}")),
        _ => MailError::Protocol(format!("Gmail API {status}: {body}")),
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            ' ' => out.push('+'),
            other => {
                let mut buf = [0u8; 4];
                for b in other.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    out
}

fn is_placement_label(label: &str) -> bool {
    matches!(label, "INBOX" | "SENT" | "DRAFT" | "TRASH" | "SPAM")
        || !label
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_')
}

fn folder_to_label(folder: &str) -> String {
    match folder.to_uppercase().as_str() {
        "INBOX" => "INBOX".into(),
        "SENT" => "SENT".into(),
        "DRAFT" | "DRAFTS" => "DRAFT".into(),
        "TRASH" => "TRASH".into(),
        "SPAM" | "JUNK" => "SPAM".into(),
        "ARCHIVE" => "ARCHIVE".into(),
        _ => folder.to_string(),
    }
}

fn label_to_folder_type(id: &str, label_type: Option<&str>) -> FolderType {
    match id {
        "INBOX" => FolderType::Inbox,
        "SENT" => FolderType::Sent,
        "DRAFT" => FolderType::Drafts,
        "TRASH" => FolderType::Trash,
        "SPAM" => FolderType::Spam,
        _ if label_type == Some("system") => FolderType::System,
        _ => FolderType::Custom,
    }
}

/// Primary folder for a message, from its label set.
fn placement_folder(label_ids: &[String]) -> String {
    for system in ["INBOX", "SENT", "DRAFT", "TRASH", "SPAM"] {
        if label_ids.iter().any(|l| l == system) {
            return system.to_string();
        }
    }
    label_ids
        .iter()
        .find(|l| !l.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
        .cloned()
        .unwrap_or_else(|| "ARCHIVE".to_string())
}

fn normalize_gmail(account_id: &str, msg: GmailMessage) -> Message {
    let header = |name: &str| -> Option<String> {
        msg.payload.as_ref().and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
        })
    };

    let labels = &msg.label_ids;
    let has = |l: &str| labels.iter().any(|id| id == l);

    let flags = MessageFlags {
        is_read: !has("UNREAD"),
        is_starred: has("STARRED"),
        is_important: has("IMPORTANT"),
        is_draft: has("DRAFT"),
        is_sent: has("SENT"),
        is_trashed: has("TRASH"),
        is_spam: has("SPAM"),
        has_attachments: false,
    };

    let date = msg
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let (body_text, body_html, attachments) = msg
        .payload
        .as_ref()
        .map(extract_payload)
        .unwrap_or((None, None, Vec::new()));

    let priority = header("X-Priority")
        .or_else(|| header("Importance"))
        .map(|v| Priority::parse_header(&v))
        .unwrap_or_default();

    let kept_headers: Vec<(String, String)> = msg
        .payload
        .as_ref()
        .map(|p| {
            p.headers
                .iter()
                .filter(|h| {
                    h.name.eq_ignore_ascii_case("Message-ID")
                        || h.name.eq_ignore_ascii_case("References")
                        || h.name.eq_ignore_ascii_case("In-Reply-To")
                        || h.name.eq_ignore_ascii_case("List-Id")
                })
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let has_attachments = !attachments.is_empty();
    Message {
        id: msg.id,
        account_id: account_id.to_string(),
        thread_id: msg.thread_id,
        subject: header("Subject").unwrap_or_default(),
        from: header("From").map(|v| Address::parse(&v)),
        to: header("To").map(|v| parse_address_list(&v)).unwrap_or_default(),
        cc: header("Cc").map(|v| parse_address_list(&v)).unwrap_or_default(),
        bcc: header("Bcc").map(|v| parse_address_list(&v)).unwrap_or_default(),
        reply_to: header("Reply-To")
            .map(|v| parse_address_list(&v))
            .unwrap_or_default(),
        body_text,
        body_html,
        flags: MessageFlags {
            has_attachments,
            ..flags
        },
        priority,
        folder: placement_folder(labels),
        labels: labels.clone(),
        attachments,
        headers: kept_headers,
        date,
    }
}

/// Walk the payload tree for bodies and attachment metadata.
fn extract_payload(payload: &MessagePayload) -> (Option<String>, Option<String>, Vec<Attachment>) {
    let mut text = None;
    let mut html = None;
    let mut attachments = Vec::new();
    walk_payload(payload, &mut text, &mut html, &mut attachments);
    (text, html, attachments)
}

fn walk_payload(
    part: &MessagePayload,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
) {
    if let Some(filename) = part.filename.as_deref().filter(|f| !f.is_empty()) {
        attachments.push(Attachment {
            id: part
                .body
                .as_ref()
                .and_then(|b| b.attachment_id.clone())
                .unwrap_or_else(|| filename.to_string()),
            filename: filename.to_string(),
            mime_type: part
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: part.body.as_ref().and_then(|b| b.size).unwrap_or(0),
        });
        return;
    }

    let decoded = part
        .body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .and_then(decode_body);
    match part.mime_type.as_deref() {
        Some("text/plain") if text.is_none() => *text = decoded,
        Some("text/html") if html.is_none() => *html = decoded,
        _ => {}
    }
    for sub in &part.parts {
        walk_payload(sub, text, html, attachments);
    }
}

/// Gmail body data is URL-safe base64.
fn decode_body(data: &str) -> Option<String> {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_with_labels(labels: &[&str]) -> GmailMessage {
        GmailMessage {
            id: "m1".into(),
            thread_id: "t1".into(),
            label_ids: labels.iter().map(|s| s.to_string()).collect(),
            internal_date: Some("1700000000000".into()),
            payload: None,
        }
    }

    #[test]
    fn unread_label_inverts_is_read() {
        let read = normalize_gmail("a", msg_with_labels(&["INBOX"]));
        assert!(read.flags.is_read);
        let unread = normalize_gmail("a", msg_with_labels(&["INBOX", "UNREAD"]));
        assert!(!unread.flags.is_read);
    }

    #[test]
    fn placement_prefers_system_labels() {
        assert_eq!(placement_folder(&["Receipts".into(), "INBOX".into()]), "INBOX");
        assert_eq!(placement_folder(&["Receipts".into()]), "Receipts");
        assert_eq!(placement_folder(&["STARRED".into()]), "ARCHIVE");
        assert_eq!(placement_folder(&[]), "ARCHIVE");
    }

    #[test]
    fn label_classification() {
        assert_eq!(label_to_folder_type("INBOX", Some("system")), FolderType::Inbox);
        assert_eq!(label_to_folder_type("TRASH", Some("system")), FolderType::Trash);
        assert_eq!(label_to_folder_type("Label_7", Some("user")), FolderType::Custom);
        assert_eq!(
            label_to_folder_type("CHAT", Some("system")),
            FolderType::System
        );
    }

    #[test]
    fn body_decoding_handles_urlsafe_base64() {
        let encoded = URL_SAFE_NO_PAD.encode("hello <world>");
        assert_eq!(decode_body(&encoded).as_deref(), Some("hello <world>"));
    }

    #[test]
    fn query_encoding() {
        assert_eq!(urlencode("in:inbox after:170"), "in%3Ainbox+after%3A170");
    }

    #[test]
    fn attachment_parts_are_collected() {
        let payload = MessagePayload {
            mime_type: Some("multipart/mixed".into()),
            filename: None,
            headers: vec![],
            body: None,
            parts: vec![
                MessagePayload {
                    mime_type: Some("text/plain".into()),
                    filename: Some(String::new()),
                    headers: vec![],
                    body: Some(PartBody {
                        data: Some(URL_SAFE_NO_PAD.encode("body")),
                        size: None,
                        attachment_id: None,
                    }),
                    parts: vec![],
                },
                MessagePayload {
                    mime_type: Some("application/pdf".into()),
                    filename: Some("doc.pdf".into()),
                    headers: vec![],
                    body: Some(PartBody {
                        data: None,
                        size: Some(1234),
                        attachment_id: Some("att-1".into()),
                    }),
                    parts: vec![],
                },
            ],
        };
        let (text, html, attachments) = extract_payload(&payload);
        assert_eq!(text.as_deref(), Some("body"));
        assert!(html.is_none());
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].id, "att-1");
        assert_eq!(attachments[0].size, 1234);
    }
}
