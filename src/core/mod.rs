//! Core orchestration logic.
//!
//! This module contains:
//! - ConfigGraphService: configuration validation and graph building
//! - PrimitiveExecutionClient: circuit-breaking remote calls
//! - EventLog: ordered, redacted event persistence
//! - OrchestrationEngine: the conversation walk

pub mod circuit_breaker;
pub mod config_graph;
pub mod errors;
pub mod event_log;
pub mod orchestrator;
pub mod policy;
pub mod primitive_client;
pub mod redact;

// Re-export commonly used types
pub use circuit_breaker::{
    breaker_key, BreakerPermit, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState,
    CircuitState,
};
pub use config_graph::{
    parse_document, read_document, ConfigError, ConfigGraphService, ErrorCode, ErrorKind,
    FieldError, ValidationReport,
};
pub use errors::ExecutionError;
pub use event_log::{EventBackend, EventLog, EventLogError, TraceWriter};
pub use orchestrator::{
    ConversationHandle, EngineSettings, OrchestrationEngine, StartConversation, StartError,
};
pub use policy::{EngineLimits, LimitTracker, LimitViolation, RetryPolicy};
pub use primitive_client::{PrimitiveExecutionClient, PrimitiveResult, ResultError, ResultMetadata};
pub use redact::PiiRedactor;
