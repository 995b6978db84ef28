//! Domain types for the convo engine.
//!
//! This module contains the core data structures:
//! - Objective: declared units of work and the graph they form
//! - TenantConfiguration: a tenant's declarative plan
//! - Events: immutable records of conversation lifecycle changes
//! - Conversation: summary record and replay-derived state

pub mod conversation;
pub mod events;
pub mod objective;
pub mod tenant;

// Re-export commonly used types
pub use conversation::{
    Conversation, ConversationState, ConversationStatus, ObjectiveStatus, TerminalStatusError,
};
pub use events::{ErrorSummary, Event, EventType, EVENT_VERSION};
pub use objective::{
    EscalationStrategy, Objective, ObjectiveGraph, ObjectiveType, Transition, TERMINAL,
};
pub use tenant::{TenantConfiguration, SUPPORTED_SCHEMA_VERSION};
