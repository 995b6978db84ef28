//! Event types for the event-sourced engine.
//!
//! Every lifecycle change of a conversation is recorded as an immutable
//! event. Observers rebuild conversation state by replaying them in
//! `sequence_number` order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Current schema version of every event body
pub const EVENT_VERSION: u32 = 1;

/// A single event in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub event_id: Uuid,

    pub event_type: EventType,

    pub event_version: u32,

    /// Correlation id shared by all events of one conversation
    pub trace_id: Uuid,

    /// Strictly increasing within `trace_id`, starting at 1
    pub sequence_number: u64,

    pub tenant_id: String,

    pub conversation_id: Uuid,

    pub timestamp: DateTime<Utc>,

    /// Event body, PII-redacted before it leaves the engine
    pub payload: Value,

    /// Structural metadata (retry counts, durations, breaker state)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Event {
    /// Objective this event refers to, if any
    pub fn objective_id(&self) -> Option<&str> {
        self.payload.get("objective_id").and_then(Value::as_str)
    }

    /// `retry_count` recorded in metadata, if any
    pub fn retry_count(&self) -> Option<u64> {
        self.metadata.get("retry_count").and_then(Value::as_u64)
    }

    /// Embedded error summary, if any
    pub fn error(&self) -> Option<ErrorSummary> {
        self.payload
            .get("error")
            .and_then(|e| serde_json::from_value(e.clone()).ok())
    }
}

/// Lifecycle events emitted by the orchestration engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// First event of every conversation
    ConversationStarted,

    /// An objective became current
    ObjectiveStarted,

    /// One attempt at the current objective failed
    ObjectiveAttemptFailed,

    /// The objective captured its value
    ObjectiveCompleted,

    /// A non-required objective exhausted its attempts
    ObjectiveSkipped,

    /// A required objective exhausted its attempts
    ObjectiveFailed,

    /// Last event of every conversation
    ConversationEnded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationStarted => "CONVERSATION_STARTED",
            Self::ObjectiveStarted => "OBJECTIVE_STARTED",
            Self::ObjectiveAttemptFailed => "OBJECTIVE_ATTEMPT_FAILED",
            Self::ObjectiveCompleted => "OBJECTIVE_COMPLETED",
            Self::ObjectiveSkipped => "OBJECTIVE_SKIPPED",
            Self::ObjectiveFailed => "OBJECTIVE_FAILED",
            Self::ConversationEnded => "CONVERSATION_ENDED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error summary embedded in failure events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub code: String,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_id: Option<String>,
}

impl ErrorSummary {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            objective_id: None,
        }
    }

    pub fn for_objective(mut self, objective_id: impl Into<String>) -> Self {
        self.objective_id = Some(objective_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(payload: Value) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            event_type: EventType::ObjectiveFailed,
            event_version: EVENT_VERSION,
            trace_id: Uuid::new_v4(),
            sequence_number: 4,
            tenant_id: "acme".to_string(),
            conversation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::ObjectiveAttemptFailed).unwrap();
        assert_eq!(json, "\"OBJECTIVE_ATTEMPT_FAILED\"");
        assert_eq!(EventType::ConversationEnded.to_string(), "CONVERSATION_ENDED");
    }

    #[test]
    fn test_event_accessors() {
        let event = sample_event(serde_json::json!({
            "objective_id": "email",
            "error": {"code": "TIMEOUT", "message": "timed out"}
        }));

        assert_eq!(event.objective_id(), Some("email"));
        assert_eq!(event.error().unwrap().code, "TIMEOUT");
        assert_eq!(event.retry_count(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = sample_event(serde_json::json!({"objective_id": "a"}));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
