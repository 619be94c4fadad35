//! Generic IMAP/SMTP provider
//!
//! Mailbox reads and flag writes go through the shared IMAP pool;
//! sends go through the SMTP pool. Messages are normalized by fetching
//! the full RFC 822 body and parsing it with mailparse, so header
//! decoding, body extraction, and attachment discovery all share one
//! code path.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Flag;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialProvider, DecryptedCredentials};
use crate::pool::{ImapConnection, ImapPool, SmtpPool};
use crate::provider::normalize::{parse_address_list, synthesize_thread_id};
use crate::provider::{Capabilities, MailProvider, ProviderState};
use crate::rate_limit::RateWindow;
use crate::store::MessageStore;
use crate::types::{
    Account, Address, Attachment, EventBus, FetchOptions, Folder, FolderType, MailEvent, Message,
    MessageFlags, Priority, SendOptions, SendOutcome, SyncOptions, SyncStats,
};
use crate::{MailError, Result};

const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";
const DEFAULT_FOLDER_FETCH: usize = 100;
/// Remote-call budget advertised in the capability descriptor and
/// enforced before every pooled-connection operation.
const IMAP_RATE_LIMIT: u32 = 30;
const IMAP_RATE_WINDOW_SECS: u64 = 1;

pub struct ImapProvider {
    account: Account,
    state: std::sync::RwLock<ProviderState>,
    imap: Arc<ImapPool>,
    smtp: Arc<SmtpPool>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<dyn MessageStore>,
    events: EventBus,
    rate: RateWindow,
}

impl ImapProvider {
    pub fn new(
        account: Account,
        imap: Arc<ImapPool>,
        smtp: Arc<SmtpPool>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn MessageStore>,
        events: EventBus,
    ) -> Self {
        Self {
            account,
            state: std::sync::RwLock::new(ProviderState::Created),
            imap,
            smtp,
            credentials,
            store,
            events,
            rate: RateWindow::new(
                IMAP_RATE_LIMIT as usize,
                Duration::from_secs(IMAP_RATE_WINDOW_SECS),
            ),
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

    /// Fresh credentials for dialing: OAuth tokens are refreshed
    /// through the credential provider on every call.
    async fn fresh_credentials(&self) -> Result<DecryptedCredentials> {
        let creds = self.credentials.decrypt_credentials(&self.account).await?;
        match creds {
            DecryptedCredentials::OAuth2 { username, .. } => {
                let token = self
                    .credentials
                    .get_valid_access_token(&self.account)
                    .await?;
                Ok(DecryptedCredentials::OAuth2 {
                    username,
                    access_token: token,
                })
            }
            other => Ok(other),
        }
    }

    /// The account's pooled connection. Paced by the provider rate
    /// window; every remote operation funnels through here.
    async fn connection(&self) -> Result<Arc<tokio::sync::Mutex<ImapConnection>>> {
        self.rate.acquire().await;
        let creds = self.fresh_credentials().await?;
        self.imap
            .acquire(&self.account.id, self.account.imap_config()?, creds)
            .await
    }

    async fn list_folders_inner(&self) -> Result<Vec<Folder>> {
        let conn = self.connection().await?;
        let account_id = self.account.id.clone();
        self.imap
            .run_retrying(&self.account.id, &conn, move |conn| {
                let account_id = account_id.clone();
                Box::pin(async move {
                    let session = conn.session()?;
                    let names: Vec<async_imap::types::Name> = session
                        .list(None, Some("*"))
                        .await
                        .map_err(|e| MailError::classify("LIST", &e.to_string()))?
                        .try_collect()
                        .await
                        .map_err(|e| MailError::Protocol(format!("LIST stream failed: {e}")))?;

                    let folders = names
                        .iter()
                        .map(|name| {
                            let raw = name.name().to_string();
                            let selectable = !name
                                .attributes()
                                .iter()
                                .any(|a| matches!(a, async_imap::types::NameAttribute::NoSelect));
                            Folder {
                                id: raw.clone(),
                                account_id: account_id.clone(),
                                folder_type: if selectable {
                                    FolderType::classify(&raw)
                                } else {
                                    FolderType::System
                                },
                                name: raw,
                                message_count: None,
                                unread_count: None,
                                selectable,
                            }
                        })
                        .collect();
                    Ok(folders)
                })
            })
            .await
    }

    /// Fetch and normalize messages from one already-listed folder.
    async fn fetch_folder(&self, folder: &str, opts: FetchOptions) -> Result<Vec<Message>> {
        let conn = self.connection().await?;
        let account_id = self.account.id.clone();
        let folder = folder.to_string();
        self.imap
            .run_retrying(&self.account.id, &conn, move |conn| {
                let account_id = account_id.clone();
                let folder = folder.clone();
                Box::pin(async move {
                    let mailbox = conn.select(&folder).await?;
                    let exists = mailbox.exists;
                    if exists == 0 {
                        return Ok(Vec::new());
                    }

                    let limit = opts.limit.unwrap_or(DEFAULT_FOLDER_FETCH) as u32;
                    let session = conn.session()?;

                    let fetches: Vec<async_imap::types::Fetch> = if let Some(since) = opts.since {
                        // SEARCH SINCE has day granularity; exact filtering
                        // happens after parsing.
                        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
                        let uids = session
                            .uid_search(&query)
                            .await
                            .map_err(|e| MailError::classify("SEARCH", &e.to_string()))?;
                        if uids.is_empty() {
                            return Ok(Vec::new());
                        }
                        let mut uids: Vec<u32> = uids.into_iter().collect();
                        uids.sort_unstable();
                        let keep = uids.len().saturating_sub(limit as usize);
                        let set = uids[keep..]
                            .iter()
                            .map(|u| u.to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        session
                            .uid_fetch(&set, FETCH_QUERY)
                            .await
                            .map_err(|e| MailError::classify("FETCH", &e.to_string()))?
                            .try_collect()
                            .await
                            .map_err(|e| MailError::Protocol(format!("FETCH stream failed: {e}")))?
                    } else {
                        let start = exists.saturating_sub(limit).max(1);
                        let range = format!("{start}:{exists}");
                        session
                            .fetch(&range, FETCH_QUERY)
                            .await
                            .map_err(|e| MailError::classify("FETCH", &e.to_string()))?
                            .try_collect()
                            .await
                            .map_err(|e| MailError::Protocol(format!("FETCH stream failed: {e}")))?
                    };

                    let mut out = Vec::with_capacity(fetches.len());
                    for fetch in &fetches {
                        match normalize_fetch(&account_id, &folder, fetch) {
                            Some(msg) => {
                                if opts.since.map_or(true, |since| msg.date >= since) {
                                    out.push(msg);
                                }
                            }
                            None => debug!(folder = %folder, "skipping unparsable FETCH item"),
                        }
                    }
                    Ok(out)
                })
            })
            .await
    }

    /// Locate a synced message by id so we know its folder and UID.
    async fn locate(&self, message_id: &str) -> Result<(String, u32)> {
        let known = self
            .store
            .get_message(&self.account.id, message_id)
            .await?
            .ok_or_else(|| MailError::MessageNotFound(message_id.to_string()))?;
        let uid = message_id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| {
                MailError::InvalidInput(format!("malformed message id {message_id}"))
            })?;
        Ok((known.folder, uid))
    }

    async fn store_flag(&self, message_id: &str, flag: &str, set: bool) -> Result<()> {
        let (folder, uid) = self.locate(message_id).await?;
        let conn = self.connection().await?;
        let flag = flag.to_string();
        self.imap
            .run_retrying(&self.account.id, &conn, move |conn| {
                let folder = folder.clone();
                let flag = flag.clone();
                Box::pin(async move {
                    conn.select(&folder).await?;
                    let session = conn.session()?;
                    let op = if set { "+FLAGS" } else { "-FLAGS" };
                    let updates: Vec<async_imap::types::Fetch> = session
                        .uid_store(uid.to_string(), format!("{op} ({flag})"))
                        .await
                        .map_err(|e| MailError::classify("STORE", &e.to_string()))?
                        .try_collect()
                        .await
                        .map_err(|e| MailError::Protocol(format!("STORE stream failed: {e}")))?;
                    drop(updates);
                    Ok(())
                })
            })
            .await
    }

    /// Move with UID MOVE, falling back to COPY plus delete-and-expunge
    /// for servers without the MOVE extension.
    async fn move_by_uid(&self, folder: &str, uid: u32, destination: &str) -> Result<()> {
        let conn = self.connection().await?;
        let folder = folder.to_string();
        let destination = destination.to_string();
        self.imap
            .run_retrying(&self.account.id, &conn, move |conn| {
                let folder = folder.clone();
                let destination = destination.clone();
                Box::pin(async move {
                    conn.select(&folder).await?;
                    let session = conn.session()?;
                    match session.uid_mv(uid.to_string(), &destination).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            let err = MailError::classify("MOVE", &e.to_string());
                            if err.is_network() {
                                return Err(err);
                            }
                            debug!(error = %err, "UID MOVE unsupported, copying instead");
                            copy_then_purge(conn, uid, &destination).await
                        }
                    }
                })
            })
            .await
    }

    /// Best-effort copy of a just-sent message into the Sent mailbox so
    /// it shows up on other clients.
    async fn append_sent(&self, mime: &[u8]) -> Result<()> {
        let folders = self.list_folders_inner().await?;
        let Some(sent) = find_special(&folders, FolderType::Sent) else {
            debug!(account_id = %self.account.id, "no Sent mailbox, skipping save");
            return Ok(());
        };
        let conn = self.connection().await?;
        let mime = mime.to_vec();
        self.imap
            .run_retrying(&self.account.id, &conn, move |conn| {
                let sent = sent.clone();
                let mime = mime.clone();
                Box::pin(async move {
                    let session = conn.session()?;
                    session
                        .append(&sent, Some("(\\Seen)"), None, &mime)
                        .await
                        .map_err(|e| MailError::classify("APPEND", &e.to_string()))
                })
            })
            .await
    }

    async fn trash_folder(&self) -> Result<Option<String>> {
        let folders = self.list_folders_inner().await?;
        Ok(find_special(&folders, FolderType::Trash))
    }
}

/// First selectable folder of the given type.
fn find_special(folders: &[Folder], kind: FolderType) -> Option<String> {
    folders
        .iter()
        .find(|f| f.folder_type == kind && f.selectable)
        .map(|f| f.name.clone())
}

/// COPY fallback used when the server rejects UID MOVE.
async fn copy_then_purge(conn: &mut ImapConnection, uid: u32, destination: &str) -> Result<()> {
    let session = conn.session()?;
    session
        .uid_copy(uid.to_string(), destination)
        .await
        .map_err(|e| MailError::classify("COPY", &e.to_string()))?;
    let updates: Vec<async_imap::types::Fetch> = session
        .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
        .await
        .map_err(|e| MailError::classify("STORE", &e.to_string()))?
        .try_collect()
        .await
        .map_err(|e| MailError::Protocol(format!("STORE stream failed: {e}")))?;
    drop(updates);
    let expunged: Vec<u32> = session
        .expunge()
        .await
        .map_err(|e| MailError::classify("EXPUNGE", &e.to_string()))?
        .try_collect()
        .await
        .map_err(|e| MailError::Protocol(format!("EXPUNGE stream failed: {e}")))?;
    drop(expunged);
    Ok(())
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn account_id(&self) -> &str {
        &self.account.id
    }

    fn state(&self) -> ProviderState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: true,
            labels: false,
            incremental_sync: false,
            rate_limit: IMAP_RATE_LIMIT,
            rate_window_secs: IMAP_RATE_WINDOW_SECS,
        }
    }

    async fn initialize(&self) -> Result<()> {
        match self.state() {
            ProviderState::Ready => return Ok(()),
            ProviderState::Destroyed => return Err(MailError::Destroyed(self.account.id.clone())),
            _ => {}
        }
        self.set_state(ProviderState::Initializing);

        let result: Result<()> = async {
            let creds = self.fresh_credentials().await?;
            self.imap
                .acquire(&self.account.id, self.account.imap_config()?, creds.clone())
                .await?;
            self.smtp
                .acquire(&self.account.id, self.account.smtp_config()?, creds)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(ProviderState::Ready);
                info!(account_id = %self.account.id, "IMAP provider ready");
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

        let folders = self.list_folders_inner().await?;
        let eligible: Vec<&Folder> = folders
            .iter()
            .filter(|f| f.selectable)
            .filter(|f| {
                opts.full_sync || !matches!(f.folder_type, FolderType::Trash | FolderType::Spam)
            })
            .collect();
        let total = eligible.len().max(1);

        // Folders are synced sequentially over the shared connection;
        // a failing folder is logged and skipped, not fatal.
        for (done, folder) in eligible.iter().enumerate() {
            self.events.emit(MailEvent::SyncProgress {
                account_id: self.account.id.clone(),
                folder: Some(folder.name.clone()),
                progress: ((done * 100) / total) as u8,
            });

            let fetch_opts = FetchOptions {
                limit: opts.limit,
                since: opts.since,
            };
            let messages = match self.fetch_folder(&folder.name, fetch_opts).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(account_id = %self.account.id, folder = %folder.name, error = %e,
                          "folder sync failed");
                    stats.sync_errors += 1;
                    continue;
                }
            };

            let mut fresh = Vec::new();
            for message in messages {
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
                    folder: folder.name.clone(),
                    messages: fresh,
                });
            }
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
        self.list_folders_inner().await
    }

    async fn get_messages(&self, folder: &str, opts: FetchOptions) -> Result<Vec<Message>> {
        self.ensure_ready()?;
        self.fetch_folder(folder, opts).await
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        self.ensure_ready()?;
        let (folder, uid) = self.locate(message_id).await?;
        let conn = self.connection().await?;
        let account_id = self.account.id.clone();
        let message_id = message_id.to_string();
        self.imap
            .run_retrying(&self.account.id, &conn, move |conn| {
                let account_id = account_id.clone();
                let folder = folder.clone();
                let message_id = message_id.clone();
                Box::pin(async move {
                    conn.select(&folder).await?;
                    let session = conn.session()?;
                    let fetches: Vec<async_imap::types::Fetch> = session
                        .uid_fetch(uid.to_string(), FETCH_QUERY)
                        .await
                        .map_err(|e| MailError::classify("FETCH", &e.to_string()))?
                        .try_collect()
                        .await
                        .map_err(|e| MailError::Protocol(format!("FETCH stream failed: {e}")))?;
                    fetches
                        .first()
                        .and_then(|f| normalize_fetch(&account_id, &folder, f))
                        .ok_or_else(|| MailError::MessageNotFound(message_id.clone()))
                })
            })
            .await
    }

    async fn search(&self, query: &str, opts: FetchOptions) -> Result<Vec<Message>> {
        self.ensure_ready()?;
        let keys = translate_search(query);
        let limit = opts.limit.unwrap_or(DEFAULT_FOLDER_FETCH);

        let folders = self.list_folders_inner().await?;
        let mut results: Vec<Message> = Vec::new();

        for folder in folders {
            if !folder.selectable
                || matches!(folder.folder_type, FolderType::Trash | FolderType::Spam)
            {
                continue;
            }
            if results.len() >= limit {
                break;
            }
            let conn = self.connection().await?;
            let keys = keys.clone();
            let name = folder.name.clone();
            let account_id = self.account.id.clone();
            let found = self
                .imap
                .run_retrying(&self.account.id, &conn, move |conn| {
                    let keys = keys.clone();
                    let name = name.clone();
                    let account_id = account_id.clone();
                    Box::pin(async move {
                        conn.select(&name).await?;
                        let session = conn.session()?;
                        let uids = session
                            .uid_search(&keys)
                            .await
                            .map_err(|e| MailError::classify("SEARCH", &e.to_string()))?;
                        if uids.is_empty() {
                            return Ok(Vec::new());
                        }
                        let mut uids: Vec<u32> = uids.into_iter().collect();
                        uids.sort_unstable();
                        let keep = uids.len().saturating_sub(limit);
                        let set = uids[keep..]
                            .iter()
                            .map(|u| u.to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        let fetches: Vec<async_imap::types::Fetch> = session
                            .uid_fetch(&set, FETCH_QUERY)
                            .await
                            .map_err(|e| MailError::classify("FETCH", &e.to_string()))?
                            .try_collect()
                            .await
                            .map_err(|e| MailError::Protocol(format!("FETCH stream failed: {e}")))?;
                        Ok(fetches
                            .iter()
                            .filter_map(|f| normalize_fetch(&account_id, &name, f))
                            .collect::<Vec<_>>())
                    })
                })
                .await;
            match found {
                Ok(mut messages) => results.append(&mut messages),
                Err(e) => {
                    warn!(folder = %folder.name, error = %e, "search failed in folder")
                }
            }
        }
        results.sort_by(|a, b| b.date.cmp(&a.date));
        results.truncate(limit);
        Ok(results)
    }

    async fn mark_read(&self, message_id: &str, read: bool) -> Result<()> {
        self.ensure_ready()?;
        self.store_flag(message_id, "\\Seen", read).await
    }

    async fn mark_starred(&self, message_id: &str, starred: bool) -> Result<()> {
        self.ensure_ready()?;
        self.store_flag(message_id, "\\Flagged", starred).await
    }

    async fn move_message(&self, message_id: &str, folder: &str) -> Result<()> {
        self.ensure_ready()?;
        let (current, uid) = self.locate(message_id).await?;
        if current == folder {
            return Ok(());
        }
        self.move_by_uid(&current, uid, folder).await?;
        self.store
            .delete_message(&self.account.id, message_id)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.ensure_ready()?;
        let (current, uid) = self.locate(message_id).await?;
        let trash = self.trash_folder().await?;

        match trash {
            Some(trash) if current != trash => {
                self.move_by_uid(&current, uid, &trash).await?;
            }
            // Already in trash, or the server has no trash folder:
            // delete for good.
            _ => {
                let conn = self.connection().await?;
                let current = current.clone();
                self.imap
                    .run_retrying(&self.account.id, &conn, move |conn| {
                        let current = current.clone();
                        Box::pin(async move {
                            conn.select(&current).await?;
                            let session = conn.session()?;
                            let updates: Vec<async_imap::types::Fetch> = session
                                .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
                                .await
                                .map_err(|e| MailError::classify("STORE", &e.to_string()))?
                                .try_collect()
                                .await
                                .map_err(|e| {
                                    MailError::Protocol(format!("STORE stream failed: {e}"))
                                })?;
                            drop(updates);
                            let expunged: Vec<u32> = session
                                .expunge()
                                .await
                                .map_err(|e| MailError::classify("EXPUNGE", &e.to_string()))?
                                .try_collect()
                                .await
                                .map_err(|e| {
                                    MailError::Protocol(format!("EXPUNGE stream failed: {e}"))
                                })?;
                            drop(expunged);
                            Ok(())
                        })
                    })
                    .await?;
            }
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
        let (outcome, mime) = self.smtp.send(&self.account.id, &from, &opts).await?;
        // Saving the copy must not fail an already-delivered send.
        if let Err(e) = self.append_sent(&mime).await {
            warn!(account_id = %self.account.id, error = %e, "failed to save sent message");
        }
        Ok(outcome)
    }

    async fn start_watch(&self, folder: &str) -> Result<()> {
        self.ensure_ready()?;
        let creds = self.fresh_credentials().await?;
        self.imap
            .start_idle(&self.account.id, folder, self.account.imap_config()?, creds)
            .await
    }

    async fn stop_watch(&self, folder: &str) -> Result<()> {
        self.imap.stop_idle(&self.account.id, folder).await;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.imap.remove(&self.account.id).await;
        self.smtp.remove(&self.account.id).await;
        self.set_state(ProviderState::Destroyed);
        info!(account_id = %self.account.id, "IMAP provider destroyed");
        Ok(())
    }
}

/// Turn a free-form query into IMAP SEARCH keys. `from:`, `to:` and
/// `subject:` prefixes map to their keys; everything else becomes TEXT.
fn translate_search(query: &str) -> String {
    let mut keys = Vec::new();
    let mut free = Vec::new();
    for token in query.split_whitespace() {
        if let Some(v) = token.strip_prefix("from:") {
            keys.push(format!("FROM \"{v}\""));
        } else if let Some(v) = token.strip_prefix("to:") {
            keys.push(format!("TO \"{v}\""));
        } else if let Some(v) = token.strip_prefix("subject:") {
            keys.push(format!("SUBJECT \"{v}\""));
        } else {
            free.push(token);
        }
    }
    if !free.is_empty() {
        keys.push(format!("TEXT \"{}\"", free.join(" ")));
    }
    if keys.is_empty() {
        "ALL".to_string()
    } else {
        keys.join(" ")
    }
}

/// Build a normalized [`Message`] from one FETCH response.
fn normalize_fetch(account_id: &str, folder: &str, fetch: &async_imap::types::Fetch) -> Option<Message> {
    let uid = fetch.uid?;
    let body = fetch.body()?;
    let parsed = mailparse::parse_mail(body).ok()?;

    let headers = &parsed.headers;
    let header = |name: &str| -> Option<String> {
        headers
            .iter()
            .find(|h| h.get_key_ref().eq_ignore_ascii_case(name))
            .map(|h| h.get_value())
    };

    let subject = header("Subject").unwrap_or_default();
    let message_id_hdr = header("Message-ID");
    let references = header("References");
    let in_reply_to = header("In-Reply-To");

    let thread_id = synthesize_thread_id(
        references.as_deref(),
        in_reply_to.as_deref(),
        message_id_hdr.as_deref(),
        &subject,
    );

    let flags: Vec<Flag> = fetch.flags().collect();
    let has = |needle: &Flag| flags.iter().any(|f| f == needle);
    let folder_type = FolderType::classify(folder);

    let (body_text, body_html, attachments) = extract_bodies(&parsed, uid);

    let msg_flags = MessageFlags {
        is_read: has(&Flag::Seen),
        is_starred: has(&Flag::Flagged),
        is_important: false,
        is_draft: has(&Flag::Draft) || folder_type == FolderType::Drafts,
        is_sent: folder_type == FolderType::Sent,
        is_trashed: folder_type == FolderType::Trash,
        is_spam: folder_type == FolderType::Spam,
        has_attachments: !attachments.is_empty(),
    };

    let date = fetch
        .internal_date()
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| {
            header("Date")
                .and_then(|d| mailparse::dateparse(&d).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        })
        .unwrap_or_else(Utc::now);

    let priority = header("X-Priority")
        .or_else(|| header("Importance"))
        .map(|v| Priority::parse_header(&v))
        .unwrap_or_default();

    let kept_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|h| {
            let k = h.get_key_ref();
            k.eq_ignore_ascii_case("Message-ID")
                || k.eq_ignore_ascii_case("References")
                || k.eq_ignore_ascii_case("In-Reply-To")
                || k.eq_ignore_ascii_case("List-Id")
        })
        .map(|h| (h.get_key(), h.get_value()))
        .collect();

    Some(Message {
        id: Message::imap_id(account_id, uid),
        account_id: account_id.to_string(),
        thread_id,
        subject,
        from: header("From").map(|v| Address::parse(&v)),
        to: header("To").map(|v| parse_address_list(&v)).unwrap_or_default(),
        cc: header("Cc").map(|v| parse_address_list(&v)).unwrap_or_default(),
        bcc: header("Bcc").map(|v| parse_address_list(&v)).unwrap_or_default(),
        reply_to: header("Reply-To")
            .map(|v| parse_address_list(&v))
            .unwrap_or_default(),
        body_text,
        body_html,
        flags: msg_flags,
        priority,
        folder: folder.to_string(),
        labels: Vec::new(),
        attachments,
        headers: kept_headers,
        date,
    })
}

/// Walk the MIME tree collecting text, HTML, and attachment parts.
fn extract_bodies(
    mail: &mailparse::ParsedMail<'_>,
    uid: u32,
) -> (Option<String>, Option<String>, Vec<Attachment>) {
    let mut text = None;
    let mut html = None;
    let mut attachments = Vec::new();
    walk_parts(mail, uid, &mut text, &mut html, &mut attachments);
    (text, html, attachments)
}

fn walk_parts(
    part: &mailparse::ParsedMail<'_>,
    uid: u32,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
) {
    let disposition = part.get_content_disposition();
    let is_attachment = disposition.disposition == mailparse::DispositionType::Attachment
        || disposition.params.contains_key("filename");

    if is_attachment {
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .unwrap_or_else(|| format!("attachment-{}", attachments.len() + 1));
        let size = part.get_body_raw().map(|b| b.len() as u64).unwrap_or(0);
        attachments.push(Attachment {
            id: format!("{uid}-{}", attachments.len() + 1),
            filename,
            mime_type: part.ctype.mimetype.clone(),
            size,
        });
        return;
    }

    if part.subparts.is_empty() {
        match part.ctype.mimetype.as_str() {
            "text/plain" if text.is_none() => *text = part.get_body().ok(),
            "text/html" if html.is_none() => *html = part.get_body().ok(),
            _ => {}
        }
        return;
    }
    for sub in &part.subparts {
        walk_parts(sub, uid, text, html, attachments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::credentials::StaticCredentials;
    use crate::store::MemoryStore;
    use crate::types::ProviderKind;

    fn folder(name: &str, kind: FolderType, selectable: bool) -> Folder {
        Folder {
            id: name.to_string(),
            account_id: "a1".into(),
            name: name.to_string(),
            folder_type: kind,
            message_count: None,
            unread_count: None,
            selectable,
        }
    }

    #[test]
    fn special_folder_pick_skips_unselectable() {
        let folders = vec![
            folder("INBOX", FolderType::Inbox, true),
            folder("[Gmail]", FolderType::System, false),
            folder("[Gmail]/Sent Mail", FolderType::Sent, true),
            folder("[Gmail]/Trash", FolderType::Trash, true),
        ];
        assert_eq!(
            find_special(&folders, FolderType::Sent).as_deref(),
            Some("[Gmail]/Sent Mail")
        );
        assert_eq!(
            find_special(&folders, FolderType::Trash).as_deref(),
            Some("[Gmail]/Trash")
        );
        assert!(find_special(&folders[..2], FolderType::Sent).is_none());
    }

    #[tokio::test]
    async fn advertises_remote_call_budget() {
        let (events, _rx) = EventBus::new();
        let account = Account {
            id: "a1".into(),
            email: "user@example.com".into(),
            display_name: None,
            provider: ProviderKind::Imap,
            status: crate::types::AccountStatus::Disconnected,
            credentials: crate::types::AccountCredentials {
                encrypted: String::new(),
                expires_at: None,
            },
            imap: None,
            smtp: None,
            sync: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let provider = ImapProvider::new(
            account,
            Arc::new(ImapPool::new(EngineConfig::default(), events.clone())),
            Arc::new(SmtpPool::new(EngineConfig::default())),
            Arc::new(StaticCredentials::new().with_password("a1", "user@example.com", "pw")),
            Arc::new(MemoryStore::new()),
            events,
        );
        let caps = provider.capabilities();
        assert!(caps.rate_limit > 0);
        assert!(caps.rate_window_secs > 0);
        assert_eq!(provider.state(), ProviderState::Created);
    }

    #[test]
    fn search_translation() {
        assert_eq!(
            translate_search("from:alice@x.com subject:report quarterly numbers"),
            "FROM \"alice@x.com\" SUBJECT \"report\" TEXT \"quarterly numbers\""
        );
        assert_eq!(translate_search(""), "ALL");
        assert_eq!(translate_search("hello"), "TEXT \"hello\"");
    }

    #[test]
    fn mime_walk_extracts_bodies_and_attachments() {
        let raw = concat!(
            "From: a@x.com\r\n",
            "Subject: test\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "hello\r\n",
            "--outer\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"doc.pdf\"\r\n",
            "\r\n",
            "%PDF-fake\r\n",
            "--outer--\r\n",
        );
        let parsed = mailparse::parse_mail(raw.as_bytes()).unwrap();
        let (text, html, attachments) = extract_bodies(&parsed, 7);
        assert_eq!(text.as_deref().map(str::trim), Some("hello"));
        assert!(html.is_none());
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "doc.pdf");
        assert_eq!(attachments[0].id, "7-1");
        assert_eq!(attachments[0].mime_type, "application/pdf");
    }
}
