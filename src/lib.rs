//! convo - Event-sourced conversation orchestration engine
//!
//! Loads a tenant's declarative conversation plan (a graph of capture
//! "objectives"), walks it against a remote primitive execution service,
//! and records every lifecycle change in an append-only event log.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable, per-trace ordered events
//! - Conversation state is derived by replaying events
//! - Event payloads are PII-redacted before they are persisted
//!
//! # Modules
//!
//! - `adapters`: Primitive execution service integrations (HTTP)
//! - `core`: Graph validation, circuit breaking, event log, engine
//! - `domain`: Data structures (Objective, Event, Conversation)
//! - `storage`: Event backends and configuration store
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Validate and store a tenant configuration
//! convo validate plan.yaml
//! convo config save plan.yaml
//!
//! # Run a conversation against the configured primitive service
//! convo run acme
//!
//! # Inspect it
//! convo events <conversation-id>
//! convo status <conversation-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{
    ConfigGraphService, EventLog, OrchestrationEngine, PrimitiveExecutionClient, StartConversation,
    StartError,
};
pub use domain::{Conversation, ConversationState, ConversationStatus, Event, EventType};
