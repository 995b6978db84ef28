//! HTTP adapter for the remote primitive execution service.
//!
//! Calls `POST {base_url}/v1/primitives/execute` with the request as JSON
//! and the trace id in the `x-trace-id` header.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{PrimitiveRequest, PrimitiveResponse, PrimitiveService, RemoteError};
use crate::core::errors::ExecutionError;

/// Header carrying the conversation trace id
pub const TRACE_HEADER: &str = "x-trace-id";

/// Primitive service reached over HTTP
pub struct HttpPrimitiveService {
    /// Provider name used for breaker keys
    provider: String,
    /// Base URL without trailing slash
    base_url: String,
    /// HTTP client
    client: reqwest::Client,
}

impl HttpPrimitiveService {
    /// Create a new HTTP primitive service client
    pub fn new(provider: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            provider: provider.into(),
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn map_send_error(err: reqwest::Error, timeout: Duration) -> ExecutionError {
        if err.is_timeout() {
            ExecutionError::Timeout {
                seconds: timeout.as_secs(),
            }
        } else if err.is_connect() || err.is_request() {
            ExecutionError::TransportUnavailable {
                message: err.to_string(),
            }
        } else {
            ExecutionError::primitive("REMOTE_ERROR", err.to_string())
        }
    }
}

#[async_trait]
impl PrimitiveService for HttpPrimitiveService {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn execute(
        &self,
        request: &PrimitiveRequest,
        timeout: Duration,
    ) -> Result<PrimitiveResponse, ExecutionError> {
        let url = self.api_url("v1/primitives/execute");

        let response = self
            .client
            .post(&url)
            .header(TRACE_HEADER, request.trace_id.to_string())
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, timeout))?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY {
            return Err(ExecutionError::TransportUnavailable {
                message: format!("primitive service returned {}", status),
            });
        }
        if status == StatusCode::GATEWAY_TIMEOUT {
            return Err(ExecutionError::Timeout {
                seconds: timeout.as_secs(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Self::map_send_error(e, timeout))?;

        let parsed = serde_json::from_str::<PrimitiveResponse>(&body);

        if !status.is_success() {
            // Error statuses usually still carry the structured failure body
            return match parsed {
                Ok(parsed) if !parsed.success => Ok(with_http_status(parsed, status)),
                _ => Err(ExecutionError::Primitive {
                    code: "REMOTE_ERROR".to_string(),
                    message: format!("primitive service returned {}", status),
                    details: Some(json!({ "status": status.as_u16() })),
                }),
            };
        }

        parsed.map_err(|e| ExecutionError::Primitive {
            code: "INVALID_RESPONSE".to_string(),
            message: format!("could not decode primitive response: {}", e),
            details: None,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let url = self.api_url("health");
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("Failed to reach primitive service at {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Primitive service health check failed: {}", response.status());
        }

        Ok(())
    }
}

/// Record the HTTP status of an error response in the remote error's `details`
fn with_http_status(mut response: PrimitiveResponse, status: StatusCode) -> PrimitiveResponse {
    let code = Value::from(status.as_u16());
    let error = response.error.get_or_insert_with(|| RemoteError {
        code: "REMOTE_ERROR".to_string(),
        message: format!("primitive service returned {}", status),
        details: None,
    });

    error.details = Some(match error.details.take() {
        Some(Value::Object(mut details)) => {
            details.insert("status".to_string(), code);
            Value::Object(details)
        }
        Some(other) => json!({ "status": code, "detail": other }),
        None => json!({ "status": code }),
    });
    response
}
