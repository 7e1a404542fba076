//! Conversation persistence: one JSON document per conversation.
//!
//! Read-modify-write is serialized per conversation id. Different conversations
//! never contend on the same lock.

use crate::cache::now_epoch_s;
use askpipe_core::{
    ConversationStore, ConversationSummary, Error, Result, StageEvent, StageKind, StatusEntry,
    StatusRecord, Turn,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Status history entries kept per conversation.
pub const STATUS_HISTORY_LIMIT: usize = 20;

const PREVIEW_CHARS: usize = 100;

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Conversation ids become file names, so only a conservative alphabet is accepted.
pub fn validate_conversation_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Store(format!("invalid conversation id: {id:?}")))
    }
}

/// Fold one stage event into a status record.
///
/// A `thinking` event on an idle (or missing) record starts a new run. History keeps
/// the newest [`STATUS_HISTORY_LIMIT`] entries.
pub fn apply_status(prev: Option<StatusRecord>, event: &StageEvent, now: u64) -> StatusRecord {
    let mut rec = match prev {
        Some(r) if r.is_active || event.kind != StageKind::Thinking => r,
        Some(mut r) => {
            r.step = 0;
            r.error = None;
            r.started_at_epoch_s = now;
            r
        }
        None => StatusRecord {
            status: event.kind,
            step: 0,
            is_active: true,
            error: None,
            started_at_epoch_s: now,
            updated_at_epoch_s: now,
            history: Vec::new(),
        },
    };
    rec.step += 1;
    rec.status = event.kind;
    rec.is_active = !event.kind.is_terminal();
    rec.updated_at_epoch_s = now;
    if event.kind == StageKind::Error {
        rec.error = Some(
            event
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        );
    }
    rec.history.push(StatusEntry {
        status: event.kind,
        step: rec.step,
        payload: event.payload.clone(),
        at_epoch_s: now,
    });
    if rec.history.len() > STATUS_HISTORY_LIMIT {
        let excess = rec.history.len() - STATUS_HISTORY_LIMIT;
        rec.history.drain(..excess);
    }
    rec
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationDoc {
    schema_version: u32,
    conversation_id: String,
    created_at_epoch_s: u64,
    updated_at_ms: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    turns: Vec<Turn>,
    #[serde(default)]
    status: Option<StatusRecord>,
}

impl ConversationDoc {
    fn new(conversation_id: &str) -> Self {
        Self {
            schema_version: 1,
            conversation_id: conversation_id.to_string(),
            created_at_epoch_s: now_epoch_s(),
            updated_at_ms: now_epoch_ms(),
            title: None,
            turns: Vec::new(),
            status: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at_ms = now_epoch_ms().max(self.updated_at_ms);
    }

    fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            title: self.title.clone(),
            turn_count: self.turns.len(),
            updated_at_epoch_s: self.updated_at_ms / 1000,
            last_message_preview: self
                .turns
                .last()
                .map(|t| t.content.chars().take(PREVIEW_CHARS).collect())
                .unwrap_or_default(),
        }
    }
}

fn newest_first(mut docs: Vec<ConversationDoc>, limit: usize) -> Vec<ConversationSummary> {
    docs.sort_by(|a, b| {
        b.updated_at_ms
            .cmp(&a.updated_at_ms)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
    docs.iter().take(limit).map(ConversationDoc::summary).collect()
}

/// File-backed store: `root/<conversation_id>.json`, replaced atomically on each write.
#[derive(Debug)]
pub struct FsConversationStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FsConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("askpipe")
            .join("conversations")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Drop `id`'s lock entry once no caller holds or awaits it.
    fn release_lock(&self, id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    async fn read_doc(&self, id: &str) -> Result<Option<ConversationDoc>> {
        let p = self.path_for(id);
        let bytes = match tokio::fs::read(&p).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Store(format!("read {}: {e}", p.display()))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Store(format!("corrupt conversation {id}: {e}")))
    }

    async fn write_doc(&self, doc: &ConversationDoc) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::Store(format!("mkdir {}: {e}", self.root.display())))?;
        let p = self.path_for(&doc.conversation_id);
        let tmp = p.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| Error::Store(e.to_string()))?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::Store(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &p)
            .await
            .map_err(|e| Error::Store(format!("rename {}: {e}", p.display())))?;
        Ok(())
    }

    /// Load, mutate and write back one conversation under its lock.
    async fn update<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ConversationDoc) + Send,
    {
        validate_conversation_id(id)?;
        let lock = self.lock_for(id);
        let res = {
            let _guard = lock.lock().await;
            match self.read_doc(id).await {
                Ok(doc) => {
                    let mut doc = doc.unwrap_or_else(|| ConversationDoc::new(id));
                    f(&mut doc);
                    doc.touch();
                    self.write_doc(&doc).await
                }
                Err(e) => Err(e),
            }
        };
        self.release_lock(id, lock);
        res
    }

    async fn get(&self, id: &str) -> Result<Option<ConversationDoc>> {
        validate_conversation_id(id)?;
        let lock = self.lock_for(id);
        let res = {
            let _guard = lock.lock().await;
            self.read_doc(id).await
        };
        self.release_lock(id, lock);
        res
    }
}

#[async_trait::async_trait]
impl ConversationStore for FsConversationStore {
    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<()> {
        self.update(conversation_id, move |d| d.turns.push(turn)).await
    }

    async fn load(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        Ok(self
            .get(conversation_id)
            .await?
            .map(|d| d.turns)
            .unwrap_or_default())
    }

    async fn title(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self.get(conversation_id).await?.and_then(|d| d.title))
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let title = title.to_string();
        self.update(conversation_id, move |d| d.title = Some(title))
            .await
    }

    async fn record_status(&self, event: &StageEvent) -> Result<()> {
        let now = now_epoch_s();
        self.update(&event.conversation_id, |d| {
            d.status = Some(apply_status(d.status.take(), event, now));
        })
        .await
    }

    async fn status(&self, conversation_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.get(conversation_id).await?.and_then(|d| d.status))
    }

    async fn list(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let mut rd = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Store(format!("list {}: {e}", self.root.display()))),
        };
        let mut docs = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| Error::Store(e.to_string()))?
        {
            let p = entry.path();
            if p.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&p).await {
                Ok(bytes) => match serde_json::from_slice::<ConversationDoc>(&bytes) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "skipping corrupt conversation"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "skipping unreadable conversation"),
            }
        }
        Ok(newest_first(docs, limit))
    }
}

/// In-process store with the same semantics as [`FsConversationStore`].
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    docs: Mutex<HashMap<String, ConversationDoc>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_docs<T>(&self, f: impl FnOnce(&mut HashMap<String, ConversationDoc>) -> T) -> T {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut docs)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut ConversationDoc)) -> Result<()> {
        validate_conversation_id(id)?;
        self.with_docs(|docs| {
            let doc = docs
                .entry(id.to_string())
                .or_insert_with(|| ConversationDoc::new(id));
            f(doc);
            doc.touch();
        });
        Ok(())
    }

    fn get(&self, id: &str) -> Option<ConversationDoc> {
        self.with_docs(|docs| docs.get(id).cloned())
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<()> {
        self.update(conversation_id, |d| d.turns.push(turn))
    }

    async fn load(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        Ok(self.get(conversation_id).map(|d| d.turns).unwrap_or_default())
    }

    async fn title(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self.get(conversation_id).and_then(|d| d.title))
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.update(conversation_id, |d| d.title = Some(title.to_string()))
    }

    async fn record_status(&self, event: &StageEvent) -> Result<()> {
        let now = now_epoch_s();
        self.update(&event.conversation_id, |d| {
            d.status = Some(apply_status(d.status.take(), event, now));
        })
    }

    async fn status(&self, conversation_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.get(conversation_id).and_then(|d| d.status))
    }

    async fn list(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let docs = self.with_docs(|docs| docs.values().cloned().collect());
        Ok(newest_first(docs, limit))
    }
}
