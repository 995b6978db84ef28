//! Runtime error taxonomy for primitive execution.
//!
//! Configuration-time errors (validation, reference, cycle) live in
//! `config_graph`; everything here can only happen while a conversation
//! is running and is always resolved by the engine's retry and
//! required/escalation policy.

use serde_json::Value;
use thiserror::Error;

/// Code for a call that exceeded its timeout
pub const CODE_TIMEOUT: &str = "TIMEOUT";
/// Code for a provider that could not be reached
pub const CODE_TRANSPORT_UNAVAILABLE: &str = "TRANSPORT_UNAVAILABLE";
/// Code for a call rejected by an open breaker
pub const CODE_CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
/// Code for a remote failure that carried no code of its own
pub const CODE_PRIMITIVE_ERROR: &str = "PRIMITIVE_ERROR";
/// Code for a required objective that ran out of attempts
pub const CODE_RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";
/// Code for failures inside the engine itself
pub const CODE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Code for conversations stopped by an external abort
pub const CODE_ABORTED: &str = "ABORTED";

/// A failed primitive call
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The call did not complete within its timeout
    #[error("primitive call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The provider could not be reached
    #[error("primitive service unavailable: {message}")]
    TransportUnavailable { message: String },

    /// Rejected locally without calling the provider
    #[error("circuit breaker open for {key} (retry in {retry_in_ms}ms)")]
    CircuitOpen { key: String, retry_in_ms: u64 },

    /// The provider answered with a domain-level failure
    #[error("primitive failed [{code}]: {message}")]
    Primitive {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl ExecutionError {
    pub fn primitive(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Primitive {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Timeout { .. } => CODE_TIMEOUT,
            Self::TransportUnavailable { .. } => CODE_TRANSPORT_UNAVAILABLE,
            Self::CircuitOpen { .. } => CODE_CIRCUIT_OPEN,
            Self::Primitive { code, .. } => code,
        }
    }

    /// Transport-level failures (as opposed to the remote declining the request)
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::TransportUnavailable { .. })
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Primitive { details, .. } => details.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ExecutionError::Timeout { seconds: 5 }.code(), "TIMEOUT");
        assert_eq!(
            ExecutionError::TransportUnavailable {
                message: "refused".into()
            }
            .code(),
            "TRANSPORT_UNAVAILABLE"
        );
        assert_eq!(
            ExecutionError::primitive("NO_INPUT", "caller silent").code(),
            "NO_INPUT"
        );
        assert!(ExecutionError::Timeout { seconds: 1 }.is_transport());
        assert!(!ExecutionError::primitive("X", "y").is_transport());
    }
}
