//! SQLite event backend.
//!
//! `events` is keyed by `(trace_id, sequence_number)`; `conversations`
//! holds one summary row per conversation. rusqlite is synchronous, so
//! every call runs on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use uuid::Uuid;

use crate::core::event_log::EventBackend;
use crate::domain::{Conversation, Event};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS events (
        event_id TEXT PRIMARY KEY,
        trace_id TEXT NOT NULL,
        sequence_number INTEGER NOT NULL,
        conversation_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        body_json TEXT NOT NULL,
        UNIQUE(trace_id, sequence_number)
    );

    CREATE INDEX IF NOT EXISTS idx_events_conversation ON events(conversation_id);

    CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        trace_id TEXT NOT NULL UNIQUE,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        status TEXT NOT NULL
    );
";

/// SQLite-backed event store
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (and migrate) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize event schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .context("SQLite task panicked")?
    }
}

fn row_body(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

type ConversationRow = (String, String, String, String, Option<String>, String);

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_conversation(
    (conversation_id, tenant_id, trace_id, started_at, ended_at, status): ConversationRow,
) -> Result<Conversation> {
    let parse_time = |s: &str| -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("Invalid timestamp: {}", s))?
            .with_timezone(&Utc))
    };

    Ok(Conversation {
        conversation_id: Uuid::parse_str(&conversation_id)?,
        tenant_id,
        trace_id: Uuid::parse_str(&trace_id)?,
        started_at: parse_time(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_time).transpose()?,
        status: serde_json::from_value(serde_json::Value::String(status))
            .context("Invalid conversation status")?,
    })
}

fn conversation_params(conversation: &Conversation) -> [Box<dyn ToSql>; 6] {
    [
        Box::new(conversation.conversation_id.to_string()),
        Box::new(conversation.tenant_id.clone()),
        Box::new(conversation.trace_id.to_string()),
        Box::new(conversation.started_at.to_rfc3339()),
        Box::new(conversation.ended_at.map(|t| t.to_rfc3339())),
        Box::new(conversation.status.as_str()),
    ]
}

const CONVERSATION_COLUMNS: &str =
    "conversation_id, tenant_id, trace_id, started_at, ended_at, status";

#[async_trait]
impl EventBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn persist(&self, event: &Event) -> Result<()> {
        let event = event.clone();
        self.with_conn(move |conn| {
            let body = serde_json::to_string(&event).context("Failed to serialize event")?;
            conn.execute(
                "INSERT INTO events (event_id, trace_id, sequence_number, conversation_id, \
                 tenant_id, event_type, timestamp, body_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id.to_string(),
                    event.trace_id.to_string(),
                    event.sequence_number as i64,
                    event.conversation_id.to_string(),
                    event.tenant_id,
                    event.event_type.as_str(),
                    event.timestamp.to_rfc3339(),
                    body,
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to insert event {} of trace {}",
                    event.sequence_number, event.trace_id
                )
            })?;
            Ok(())
        })
        .await
    }

    async fn events_for_trace(&self, trace_id: Uuid) -> Result<Vec<Event>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body_json FROM events WHERE trace_id = ?1 ORDER BY sequence_number ASC",
            )?;
            let bodies = stmt
                .query_map([trace_id.to_string()], row_body)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            bodies
                .iter()
                .map(|body| serde_json::from_str(body).context("Failed to parse stored event"))
                .collect()
        })
        .await
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<bool> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations (conversation_id, tenant_id, trace_id, started_at, ended_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(conversation_id) DO NOTHING",
                params_from_iter(conversation_params(&conversation)),
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| {
            // The update only applies to an open record of the same trace
            let written = conn.execute(
                "INSERT INTO conversations (conversation_id, tenant_id, trace_id, started_at, ended_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(conversation_id) DO UPDATE SET ended_at = excluded.ended_at, status = excluded.status \
                 WHERE conversations.trace_id = excluded.trace_id AND conversations.status = 'in_progress'",
                params_from_iter(conversation_params(&conversation)),
            )?;
            if written == 0 {
                bail!(
                    "conversation {} is closed or belongs to another trace",
                    conversation.conversation_id
                );
            }
            Ok(())
        })
        .await
    }

    async fn load_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations WHERE conversation_id = ?1",
                        CONVERSATION_COLUMNS
                    ),
                    [conversation_id.to_string()],
                    row_to_conversation,
                )
                .optional()?;
            row.map(parse_conversation).transpose()
        })
        .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations ORDER BY started_at ASC",
                CONVERSATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], row_to_conversation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(parse_conversation).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConversationStatus, EventType, EVENT_VERSION};

    fn event(conversation: &Conversation, sequence_number: u64) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: EventType::ObjectiveStarted,
            event_version: EVENT_VERSION,
            trace_id: conversation.trace_id,
            sequence_number,
            tenant_id: conversation.tenant_id.clone(),
            conversation_id: conversation.conversation_id,
            timestamp: Utc::now(),
            payload: serde_json::json!({"objective_id": "a"}),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let backend = SqliteBackend::in_memory().unwrap();
        let conversation = Conversation::start(Uuid::new_v4(), "acme");

        backend.persist(&event(&conversation, 1)).await.unwrap();
        assert!(backend.persist(&event(&conversation, 1)).await.is_err());
        backend.persist(&event(&conversation, 2)).await.unwrap();

        let events = backend.events_for_trace(conversation.trace_id).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_conversation_upsert() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut conversation = Conversation::start(Uuid::new_v4(), "acme");
        assert!(backend.create_conversation(&conversation).await.unwrap());

        conversation
            .finish(ConversationStatus::Aborted, Utc::now())
            .unwrap();
        backend.save_conversation(&conversation).await.unwrap();

        let loaded = backend
            .load_conversation(conversation.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ConversationStatus::Aborted);
        assert!(loaded.ended_at.is_some());
        assert_eq!(backend.list_conversations().await.unwrap(), vec![loaded]);
    }

    #[tokio::test]
    async fn test_closed_conversation_is_never_reopened() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut first = Conversation::start(Uuid::new_v4(), "acme");
        assert!(backend.create_conversation(&first).await.unwrap());
        first.finish(ConversationStatus::Completed, Utc::now()).unwrap();
        backend.save_conversation(&first).await.unwrap();

        // A new trace under the same id is refused by both writes
        let second = Conversation::start(first.conversation_id, "acme");
        assert!(!backend.create_conversation(&second).await.unwrap());
        assert!(backend.save_conversation(&second).await.is_err());

        let mut reopened = first.clone();
        reopened.status = ConversationStatus::InProgress;
        reopened.ended_at = None;
        assert!(backend.save_conversation(&reopened).await.is_err());

        let stored = backend
            .load_conversation(first.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.trace_id, first.trace_id);
        assert_eq!(stored.status, ConversationStatus::Completed);
    }
}
