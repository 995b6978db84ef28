//! File-based event backend using JSONL.
//!
//! Layout under the base directory:
//!
//! ```text
//! traces/<trace_id>/events.jsonl
//! conversations/<conversation_id>.json
//! ```
//!
//! One line per event keeps the log greppable and trivially appendable.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::core::event_log::{check_record_update, EventBackend};
use crate::domain::{Conversation, Event};

/// JSONL event backend rooted at a directory
pub struct JsonlBackend {
    base_dir: PathBuf,
}

impl JsonlBackend {
    /// Open (and create if needed) a backend rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for dir in [base_dir.join("traces"), base_dir.join("conversations")] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to a trace's events file
    pub fn events_path(&self, trace_id: Uuid) -> PathBuf {
        self.base_dir
            .join("traces")
            .join(trace_id.to_string())
            .join("events.jsonl")
    }

    fn conversation_path(&self, conversation_id: Uuid) -> PathBuf {
        self.base_dir
            .join("conversations")
            .join(format!("{}.json", conversation_id))
    }

    async fn read_conversation(path: &Path) -> Result<Conversation> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read conversation: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse conversation: {}", path.display()))
    }
}

#[async_trait]
impl EventBackend for JsonlBackend {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn persist(&self, event: &Event) -> Result<()> {
        let path = self.events_path(event.trace_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create trace directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    async fn events_for_trace(&self, trace_id: Uuid) -> Result<Vec<Event>> {
        let path = self.events_path(trace_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<bool> {
        let path = self.conversation_path(conversation.conversation_id);
        let tmp = path.with_extension(format!("{}.tmp", conversation.trace_id));
        let json =
            serde_json::to_string_pretty(conversation).context("Failed to serialize conversation")?;

        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write conversation: {}", tmp.display()))?;

        // Linking fails if the record exists, so two starts cannot both claim an id
        let linked = fs::hard_link(&tmp, &path).await;
        fs::remove_file(&tmp)
            .await
            .with_context(|| format!("Failed to remove {}", tmp.display()))?;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to store conversation: {}", path.display())),
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let path = self.conversation_path(conversation.conversation_id);
        if path.exists() {
            check_record_update(&Self::read_conversation(&path).await?, conversation)?;
        }

        let tmp = path.with_extension("json.tmp");
        let json =
            serde_json::to_string_pretty(conversation).context("Failed to serialize conversation")?;

        // Write then rename so readers never observe a half-written record
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write conversation: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to store conversation: {}", path.display()))?;

        Ok(())
    }

    async fn load_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let path = self.conversation_path(conversation_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_conversation(&path).await.map(Some)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let dir = self.base_dir.join("conversations");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut conversations = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            conversations.push(Self::read_conversation(&path).await?);
        }

        conversations.sort_by_key(|c| c.started_at);
        Ok(conversations)
    }
}
