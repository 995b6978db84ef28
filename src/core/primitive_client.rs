//! Resilient client for the primitive execution service.
//!
//! Every call goes through the circuit breaker for its provider/type key
//! and is bounded by the per-call timeout. Failures never escape as
//! errors: the caller always gets a structured `PrimitiveResult`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::circuit_breaker::{breaker_key, CircuitBreakerRegistry, CircuitState};
use super::errors::ExecutionError;
use crate::adapters::{PrimitiveRequest, PrimitiveService};

/// Error part of a `PrimitiveResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    pub code: String,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&ExecutionError> for ResultError {
    fn from(err: &ExecutionError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: err.details().cloned(),
        }
    }
}

/// Call metadata attached to every `PrimitiveResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub duration_ms: u64,

    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Breaker state after the call settled
    pub state: CircuitState,
}

/// Structured outcome of one primitive call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl PrimitiveResult {
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    pub fn duration_ms(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |m| m.duration_ms)
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.metadata.as_ref().map(|m| m.state)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.metadata.as_ref().and_then(|m| m.confidence)
    }
}

/// Circuit-breaking, timeout-bounded wrapper around a `PrimitiveService`
#[derive(Clone)]
pub struct PrimitiveExecutionClient {
    service: Arc<dyn PrimitiveService>,
    breakers: CircuitBreakerRegistry,
}

impl PrimitiveExecutionClient {
    /// The registry is passed in so several clients (and tests) can share
    /// or isolate breaker state explicitly.
    pub fn new(service: Arc<dyn PrimitiveService>, breakers: CircuitBreakerRegistry) -> Self {
        Self { service, breakers }
    }

    pub fn provider(&self) -> &str {
        self.service.name()
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Execute one primitive call
    #[instrument(
        skip(self, request),
        fields(
            primitive = %request.primitive_type,
            conversation_id = %request.conversation_id,
            trace_id = %request.trace_id,
            retry_count = request.retry_count,
        )
    )]
    pub async fn execute(&self, request: PrimitiveRequest) -> PrimitiveResult {
        let key = breaker_key(self.service.name(), request.primitive_type);
        let started = Instant::now();
        let retry_count = request.retry_count;

        let permit = match self.breakers.acquire(&key) {
            Ok(permit) => permit,
            Err(err) => {
                debug!(%key, "Call rejected by open circuit");
                return failure(&err, started, retry_count, self.breakers.state(&key));
            }
        };

        let timeout = Duration::from_secs(request.timeout_seconds);
        let outcome = match tokio::time::timeout(timeout, self.service.execute(&request, timeout)).await
        {
            Ok(result) => result.and_then(|response| response.into_result()),
            Err(_) => Err(ExecutionError::Timeout {
                seconds: request.timeout_seconds,
            }),
        };

        match outcome {
            Ok(response) => {
                let confidence = response.confidence();
                let state = permit.record_success();
                PrimitiveResult {
                    success: true,
                    data: response.data,
                    error: None,
                    metadata: Some(ResultMetadata {
                        duration_ms: started.elapsed().as_millis() as u64,
                        retry_count,
                        confidence,
                        state,
                    }),
                }
            }
            Err(err) => {
                let state = permit.record_failure();
                warn!(%key, code = err.code(), error = %err, "Primitive call failed");
                failure(&err, started, retry_count, state)
            }
        }
    }
}

fn failure(
    err: &ExecutionError,
    started: Instant,
    retry_count: u32,
    state: CircuitState,
) -> PrimitiveResult {
    PrimitiveResult {
        success: false,
        data: None,
        error: Some(ResultError::from(err)),
        metadata: Some(ResultMetadata {
            duration_ms: started.elapsed().as_millis() as u64,
            retry_count,
            confidence: None,
            state,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PrimitiveResponse;
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use crate::domain::ObjectiveType;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct SlowService;

    #[async_trait]
    impl PrimitiveService for SlowService {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(
            &self,
            _request: &PrimitiveRequest,
            _timeout: Duration,
        ) -> Result<PrimitiveResponse, ExecutionError> {
            // Ignores the timeout it was given
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PrimitiveResponse::captured(serde_json::json!("late")))
        }

        async fn health_check(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn request(timeout_seconds: u64) -> PrimitiveRequest {
        PrimitiveRequest {
            primitive_type: ObjectiveType::CaptureDate,
            params: Default::default(),
            conversation_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            purpose: "appointment".to_string(),
            timeout_seconds,
            retry_count: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_enforces_timeout() {
        let client = PrimitiveExecutionClient::new(
            Arc::new(SlowService),
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
        );

        let result = client.execute(request(1)).await;
        assert!(!result.success);
        assert_eq!(result.error_code(), Some("TIMEOUT"));
        assert_eq!(result.metadata.unwrap().retry_count, 2);
        assert_eq!(
            client.breakers().snapshot("slow/capture_date").failure_count,
            1
        );
    }
}
