//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convo::adapters::{PrimitiveRequest, PrimitiveResponse, PrimitiveService};
use convo::core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, EngineSettings, EventLog, ExecutionError,
    OrchestrationEngine, PrimitiveExecutionClient, RetryPolicy,
};
use convo::domain::TenantConfiguration;
use convo::storage::MemoryBackend;
use serde_json::{json, Value};

type Responder =
    dyn Fn(&PrimitiveRequest, usize) -> Result<PrimitiveResponse, ExecutionError> + Send + Sync;

/// Primitive service driven by a closure; records every request it sees
pub struct StubService {
    name: String,
    responder: Box<Responder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<PrimitiveRequest>>,
}

impl StubService {
    /// `responder` receives the request and the zero-based call number
    pub fn new(
        name: &str,
        responder: impl Fn(&PrimitiveRequest, usize) -> Result<PrimitiveResponse, ExecutionError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            responder: Box::new(responder),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Captures `{"value": "<type>"}` for every call
    pub fn succeeding(name: &str) -> Self {
        Self::new(name, |request, _| {
            Ok(PrimitiveResponse::captured(json!({ "value": request.primitive_type.as_str() }))
                .with_confidence(0.9))
        })
    }

    /// Every call fails at the transport level
    pub fn unreachable(name: &str) -> Self {
        Self::new(name, |_, _| {
            Err(ExecutionError::TransportUnavailable {
                message: "connection refused".to_string(),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PrimitiveRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PrimitiveService for StubService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &PrimitiveRequest,
        _timeout: Duration,
    ) -> Result<PrimitiveResponse, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(request, call)
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Engine settings with no backoff so retries run instantly
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy::immediate(),
        ..Default::default()
    }
}

/// Engine over an in-memory event log
pub fn engine_with(
    service: Arc<StubService>,
    breaker: CircuitBreakerConfig,
    settings: EngineSettings,
) -> (OrchestrationEngine, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let event_log = EventLog::new(backend.clone()).unwrap();
    let client = PrimitiveExecutionClient::new(service, CircuitBreakerRegistry::new(breaker));
    (OrchestrationEngine::new(client, event_log, settings), backend)
}

/// Raw tenant document with the given objectives
pub fn tenant_doc(objectives: Value) -> Value {
    json!({
        "tenant_id": "acme",
        "tenant_name": "Acme Dental",
        "locale": "en-GB",
        "schema_version": "1.0",
        "objectives": objectives,
    })
}

/// Parse a tenant document, panicking on invalid input
pub fn tenant(objectives: Value) -> TenantConfiguration {
    convo::ConfigGraphService::new()
        .load(&tenant_doc(objectives))
        .unwrap()
}
