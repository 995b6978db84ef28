//! Conversation records and state reconstruction from events.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::events::{ErrorSummary, Event, EventType};

/// Summary record persisted alongside the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: Uuid,

    pub tenant_id: String,

    /// Assigned once at start, never reused
    pub trace_id: Uuid,

    pub started_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    pub status: ConversationStatus,
}

/// Attempted to move a conversation out of a terminal status
#[derive(Debug, Clone, Error)]
#[error("conversation {conversation_id} already ended as {status}")]
pub struct TerminalStatusError {
    pub conversation_id: Uuid,
    pub status: ConversationStatus,
}

impl Conversation {
    /// Start a conversation with a fresh trace id
    pub fn start(conversation_id: Uuid, tenant_id: impl Into<String>) -> Self {
        Self {
            conversation_id,
            tenant_id: tenant_id.into(),
            trace_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            status: ConversationStatus::InProgress,
        }
    }

    /// Move to a terminal status. Terminal statuses are write-once.
    pub fn finish(
        &mut self,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), TerminalStatusError> {
        if self.status.is_terminal() {
            return Err(TerminalStatusError {
                conversation_id: self.conversation_id,
                status: self.status,
            });
        }
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(at);
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl ConversationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of a single objective as seen through the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

/// Observer-side view of a conversation, rebuilt purely from its events
#[derive(Debug, Clone, Serialize)]
pub struct ConversationState {
    pub conversation_id: Uuid,

    pub tenant_id: String,

    pub trace_id: Uuid,

    pub status: ConversationStatus,

    pub started_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Objective currently in flight (if the conversation is still running)
    pub current_objective: Option<String>,

    pub objective_statuses: HashMap<String, ObjectiveStatus>,

    /// Values captured by completed objectives (already redacted)
    pub captured: HashMap<String, Value>,

    /// Failed attempts per objective
    pub failed_attempts: HashMap<String, u32>,

    /// Error carried by the final event, if any
    pub error: Option<ErrorSummary>,

    /// Highest sequence number applied
    pub last_sequence: u64,
}

impl ConversationState {
    /// Reconstruct conversation state from its ordered events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut state = Self {
            conversation_id: first.conversation_id,
            tenant_id: first.tenant_id.clone(),
            trace_id: first.trace_id,
            status: ConversationStatus::InProgress,
            started_at: first.timestamp,
            ended_at: None,
            current_objective: None,
            objective_statuses: HashMap::new(),
            captured: HashMap::new(),
            failed_attempts: HashMap::new(),
            error: None,
            last_sequence: 0,
        };

        for event in events {
            state.apply_event(event);
        }

        Some(state)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &Event) {
        self.last_sequence = self.last_sequence.max(event.sequence_number);
        let objective_id = event.objective_id().map(str::to_string);

        match event.event_type {
            EventType::ConversationStarted => {
                self.status = ConversationStatus::InProgress;
                self.started_at = event.timestamp;
            }
            EventType::ObjectiveStarted => {
                if let Some(id) = objective_id {
                    self.objective_statuses
                        .insert(id.clone(), ObjectiveStatus::Running);
                    self.current_objective = Some(id);
                }
            }
            EventType::ObjectiveAttemptFailed => {
                if let Some(id) = objective_id {
                    *self.failed_attempts.entry(id).or_insert(0) += 1;
                }
            }
            EventType::ObjectiveCompleted => {
                if let Some(id) = objective_id {
                    if let Some(data) = event.payload.get("data") {
                        self.captured.insert(id.clone(), data.clone());
                    }
                    self.objective_statuses.insert(id, ObjectiveStatus::Completed);
                }
                self.current_objective = None;
            }
            EventType::ObjectiveSkipped => {
                if let Some(id) = objective_id {
                    self.objective_statuses.insert(id, ObjectiveStatus::Skipped);
                }
                self.current_objective = None;
            }
            EventType::ObjectiveFailed => {
                if let Some(id) = objective_id {
                    self.objective_statuses.insert(id, ObjectiveStatus::Failed);
                }
                self.current_objective = None;
            }
            EventType::ConversationEnded => {
                self.status = event
                    .payload
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(ConversationStatus::parse)
                    .unwrap_or(ConversationStatus::Failed);
                self.ended_at = Some(event.timestamp);
                self.error = event.error();
                self.current_objective = None;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn objective_status(&self, objective_id: &str) -> Option<ObjectiveStatus> {
        self.objective_statuses.get(objective_id).copied()
    }
}
