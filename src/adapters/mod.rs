//! Adapter interfaces for external systems.
//!
//! The primitive execution service is the remote speech pipeline that
//! actually captures values from the caller. The engine only sees it
//! through the `PrimitiveService` trait.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::errors::ExecutionError;
use crate::domain::ObjectiveType;

pub use http::HttpPrimitiveService;

/// One call to the primitive execution service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveRequest {
    #[serde(rename = "type")]
    pub primitive_type: ObjectiveType,

    #[serde(default)]
    pub params: Map<String, Value>,

    pub conversation_id: Uuid,

    /// Propagated as request correlation metadata
    pub trace_id: Uuid,

    pub purpose: String,

    pub timeout_seconds: u64,

    /// 0 for the first attempt
    #[serde(default)]
    pub retry_count: u32,
}

/// Error body returned by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Response body returned by the remote service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Provider metadata; some providers report `confidence` here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl PrimitiveResponse {
    /// Successful capture with data
    pub fn captured(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    /// Explicit remote failure
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(RemoteError {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
            ..Default::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Confidence from the top level, else from provider metadata
    pub fn confidence(&self) -> Option<f64> {
        self.confidence.or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get("confidence"))
                .and_then(Value::as_f64)
        })
    }

    /// Turn an explicit `success: false` into an error
    pub fn into_result(self) -> Result<PrimitiveResponse, ExecutionError> {
        if self.success {
            return Ok(self);
        }
        Err(match self.error {
            Some(error) => ExecutionError::Primitive {
                code: error.code,
                message: error.message,
                details: error.details,
            },
            None => ExecutionError::primitive(
                crate::core::errors::CODE_PRIMITIVE_ERROR,
                "primitive reported failure without an error body",
            ),
        })
    }
}

/// Trait for primitive execution providers
#[async_trait]
pub trait PrimitiveService: Send + Sync {
    /// Provider name (part of the circuit breaker key)
    fn name(&self) -> &str;

    /// Execute one primitive within `timeout`
    async fn execute(
        &self,
        request: &PrimitiveRequest,
        timeout: Duration,
    ) -> Result<PrimitiveResponse, ExecutionError>;

    /// Health check
    async fn health_check(&self) -> anyhow::Result<()>;
}
