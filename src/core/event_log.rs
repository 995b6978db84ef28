//! Append-only, per-trace ordered event log.
//!
//! Appends are redacted and handed to a single writer task over an
//! unbounded FIFO channel, so the engine never waits on storage and events
//! of one trace reach the backend in exactly the order they were appended.
//! Storage itself sits behind the `EventBackend` trait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use super::redact::PiiRedactor;
use crate::domain::{Conversation, Event, EventType, EVENT_VERSION};

/// Value of `metadata.event_source` on every engine event
pub const EVENT_SOURCE: &str = "orchestration_engine";

/// Storage behind the event log
#[async_trait]
pub trait EventBackend: Send + Sync {
    /// Backend name for logs and `settings` output
    fn name(&self) -> &str;

    /// Persist one event. `(trace_id, sequence_number)` is unique.
    async fn persist(&self, event: &Event) -> anyhow::Result<()>;

    /// All events of a trace, ordered by sequence number
    async fn events_for_trace(&self, trace_id: Uuid) -> anyhow::Result<Vec<Event>>;

    /// Insert a new conversation summary record. Returns `false` without
    /// writing anything if the conversation id is already taken.
    async fn create_conversation(&self, conversation: &Conversation) -> anyhow::Result<bool>;

    /// Update a conversation summary record (inserting it if absent).
    /// Must fail if the stored record belongs to another trace or has
    /// already reached a terminal status; see `check_record_update`.
    async fn save_conversation(&self, conversation: &Conversation) -> anyhow::Result<()>;

    async fn load_conversation(&self, conversation_id: Uuid) -> anyhow::Result<Option<Conversation>>;

    /// Every conversation summary, oldest first
    async fn list_conversations(&self) -> anyhow::Result<Vec<Conversation>>;
}

/// Reject updates that would rebind a conversation to another trace or
/// rewrite a terminal status
pub fn check_record_update(stored: &Conversation, update: &Conversation) -> anyhow::Result<()> {
    if stored.trace_id != update.trace_id {
        anyhow::bail!(
            "conversation {} belongs to trace {}, not {}",
            stored.conversation_id,
            stored.trace_id,
            update.trace_id
        );
    }
    if stored.status.is_terminal() {
        anyhow::bail!(
            "conversation {} already ended as {}",
            stored.conversation_id,
            stored.status
        );
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log writer has shut down")]
    Closed,

    #[error("unknown conversation {0}")]
    UnknownConversation(Uuid),

    #[error("conversation {0} already exists")]
    ConversationExists(Uuid),

    #[error("trace {0} is closed")]
    TraceClosed(Uuid),

    #[error("invalid redaction pattern: {0}")]
    Redaction(#[from] regex::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

enum WriteCommand {
    Event(Event),
    Conversation(Conversation),
    Flush(oneshot::Sender<()>),
}

/// Handle to the event log. Cheap to clone; all clones feed the same writer.
#[derive(Clone)]
pub struct EventLog {
    backend: Arc<dyn EventBackend>,
    sender: mpsc::UnboundedSender<WriteCommand>,
    redactor: Arc<PiiRedactor>,
}

impl EventLog {
    /// Create the log and spawn its writer task (requires a tokio runtime)
    pub fn new(backend: Arc<dyn EventBackend>) -> Result<Self, EventLogError> {
        let redactor = Arc::new(PiiRedactor::new()?);
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(backend.clone(), receiver));

        Ok(Self {
            backend,
            sender,
            redactor,
        })
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn redactor(&self) -> &PiiRedactor {
        &self.redactor
    }

    /// Open the append handle for a conversation's trace.
    ///
    /// Only one `TraceWriter` may exist per trace; it is the sole source of
    /// sequence numbers for that trace.
    pub fn open_trace(&self, conversation: &Conversation) -> TraceWriter {
        TraceWriter {
            conversation_id: conversation.conversation_id,
            tenant_id: conversation.tenant_id.clone(),
            trace_id: conversation.trace_id,
            state: Arc::new(Mutex::new(TraceState {
                next_sequence: 1,
                closed: false,
            })),
            sender: self.sender.clone(),
            redactor: self.redactor.clone(),
        }
    }

    /// Create the summary record of a new conversation.
    ///
    /// Written straight to the backend rather than queued, so a taken id is
    /// reported before any event of the new trace exists.
    pub async fn register_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), EventLogError> {
        if self.backend.create_conversation(conversation).await? {
            Ok(())
        } else {
            Err(EventLogError::ConversationExists(conversation.conversation_id))
        }
    }

    /// Queue a conversation summary write
    pub fn record_conversation(&self, conversation: &Conversation) -> Result<(), EventLogError> {
        self.sender
            .send(WriteCommand::Conversation(conversation.clone()))
            .map_err(|_| EventLogError::Closed)
    }

    /// Wait until everything queued so far has been handed to the backend
    pub async fn flush(&self) -> Result<(), EventLogError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriteCommand::Flush(tx))
            .map_err(|_| EventLogError::Closed)?;
        rx.await.map_err(|_| EventLogError::Closed)
    }

    /// All events of a conversation in sequence order
    pub async fn replay(&self, conversation_id: Uuid) -> Result<Vec<Event>, EventLogError> {
        let conversation = self
            .conversation(conversation_id)
            .await?
            .ok_or(EventLogError::UnknownConversation(conversation_id))?;
        self.replay_trace(conversation.trace_id).await
    }

    /// All events of a trace in sequence order
    pub async fn replay_trace(&self, trace_id: Uuid) -> Result<Vec<Event>, EventLogError> {
        self.flush().await?;
        let mut events = self.backend.events_for_trace(trace_id).await?;
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    pub async fn conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, EventLogError> {
        self.flush().await?;
        Ok(self.backend.load_conversation(conversation_id).await?)
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, EventLogError> {
        self.flush().await?;
        Ok(self.backend.list_conversations().await?)
    }
}

async fn run_writer(
    backend: Arc<dyn EventBackend>,
    mut receiver: mpsc::UnboundedReceiver<WriteCommand>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriteCommand::Event(event) => {
                if let Err(e) = backend.persist(&event).await {
                    error!(
                        trace_id = %event.trace_id,
                        sequence_number = event.sequence_number,
                        event_type = %event.event_type,
                        error = %e,
                        "Failed to persist event"
                    );
                }
            }
            WriteCommand::Conversation(conversation) => {
                if let Err(e) = backend.save_conversation(&conversation).await {
                    error!(
                        conversation_id = %conversation.conversation_id,
                        error = %e,
                        "Failed to persist conversation record"
                    );
                }
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(backend = backend.name(), "Event log writer stopped");
}

struct TraceState {
    next_sequence: u64,
    /// Set once `CONVERSATION_ENDED` is appended
    closed: bool,
}

/// Append handle for one trace
#[derive(Clone)]
pub struct TraceWriter {
    conversation_id: Uuid,
    tenant_id: String,
    trace_id: Uuid,
    state: Arc<Mutex<TraceState>>,
    sender: mpsc::UnboundedSender<WriteCommand>,
    redactor: Arc<PiiRedactor>,
}

impl TraceWriter {
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Sequence number of the last appended event (0 before the first)
    pub fn last_sequence(&self) -> u64 {
        self.lock_state().next_sequence - 1
    }

    /// Whether the terminal event has been appended
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Redact, number and queue an event. Returns the event as it will be stored.
    ///
    /// Fails with `TraceClosed` once `CONVERSATION_ENDED` has been appended.
    pub fn append(
        &self,
        event_type: EventType,
        payload: Value,
        metadata: Map<String, Value>,
    ) -> Result<Event, EventLogError> {
        let payload = self.redactor.redact_payload(&payload);
        let mut metadata = self.redactor.redact_map(&metadata);
        metadata
            .entry("event_source")
            .or_insert_with(|| Value::String(EVENT_SOURCE.to_string()));

        // Numbering and queueing happen under one lock so queue order always
        // matches sequence order
        let mut state = self.lock_state();
        if state.closed {
            return Err(EventLogError::TraceClosed(self.trace_id));
        }

        let event = Event {
            event_id: Uuid::new_v4(),
            event_type,
            event_version: EVENT_VERSION,
            trace_id: self.trace_id,
            sequence_number: state.next_sequence,
            tenant_id: self.tenant_id.clone(),
            conversation_id: self.conversation_id,
            timestamp: Utc::now(),
            payload,
            metadata,
        };

        self.sender
            .send(WriteCommand::Event(event.clone()))
            .map_err(|_| EventLogError::Closed)?;
        state.next_sequence += 1;
        state.closed = event_type == EventType::ConversationEnded;

        Ok(event)
    }
}
