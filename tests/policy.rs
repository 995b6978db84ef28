//! Retry and Limit Policy Integration Tests
//!
//! Tests for settings parsing, backoff between attempts and per-call timeouts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{engine_with, fast_settings, tenant, StubService};
use convo::adapters::{PrimitiveRequest, PrimitiveResponse};
use convo::core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, EngineSettings, ExecutionError,
    PrimitiveExecutionClient, RetryPolicy,
};
use convo::domain::{ConversationStatus, ObjectiveType};
use convo::StartConversation;
use serde_json::{json, Map};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[test]
fn test_settings_yaml_parsing() {
    let yaml = r#"
default_timeout_seconds: 12
retry:
  initial_delay_ms: 250
  backoff_multiplier: 1.5
limits:
  max_objectives: 40
"#;

    let settings: EngineSettings = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(settings.default_timeout_seconds, 12);
    assert_eq!(settings.retry.initial_delay_ms, 250);
    assert_eq!(settings.retry.max_delay_ms, 10000);
    assert_eq!(settings.retry.backoff_multiplier, 1.5);
    assert_eq!(settings.limits.max_objectives, 40);
    assert_eq!(settings.limits.conversation_timeout_seconds, 1800);
}

#[tokio::test]
async fn test_objective_timeout_override_reaches_service() {
    let service = Arc::new(StubService::succeeding("speech"));
    let (engine, _backend) = engine_with(service.clone(), CircuitBreakerConfig::default(), fast_settings());

    let config = tenant(json!([
        {"id": "slow", "type": "capture_address", "purpose": "delivery", "timeout_seconds": 45, "on_success": "fast"},
        {"id": "fast", "type": "capture_yes_no", "purpose": "confirm"},
    ]));
    let conversation = engine
        .run_conversation(StartConversation::new(config), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Completed);

    let timeouts: Vec<_> = service
        .requests()
        .iter()
        .map(|r| (r.purpose.clone(), r.timeout_seconds))
        .collect();
    assert_eq!(
        timeouts,
        vec![
            ("delivery".to_string(), 45),
            ("confirm".to_string(), engine.settings().default_timeout_seconds),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_applied_between_attempts() {
    let service = Arc::new(StubService::new("speech", |_, call| {
        if call < 2 {
            Err(ExecutionError::TransportUnavailable {
                message: "connection refused".to_string(),
            })
        } else {
            Ok(PrimitiveResponse::captured(json!({"value": "yes"})))
        }
    }));
    let settings = EngineSettings {
        retry: RetryPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    };
    let (engine, _backend) = engine_with(service.clone(), CircuitBreakerConfig::default(), settings);

    let started = Instant::now();
    let conversation = engine
        .run_conversation(
            StartConversation::new(tenant(json!([
                {"id": "ok", "type": "capture_yes_no", "purpose": "confirm"},
            ]))),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(conversation.status, ConversationStatus::Completed);
    assert_eq!(service.call_count(), 3);
    // 1s after the first failure, 2s after the second
    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert!(started.elapsed() < Duration::from_millis(4000));
}

#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_enforced() {
    let service = Arc::new(StubService::succeeding("speech").with_delay(Duration::from_secs(60)));
    let client = PrimitiveExecutionClient::new(service.clone(), CircuitBreakerRegistry::default());

    let result = client
        .execute(PrimitiveRequest {
            primitive_type: ObjectiveType::CaptureAddress,
            params: Map::new(),
            conversation_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            purpose: "delivery".to_string(),
            timeout_seconds: 2,
            retry_count: 0,
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some("TIMEOUT"));
    assert_eq!(service.call_count(), 1);
    assert_eq!(
        client.breakers().snapshot("speech/capture_address").failure_count,
        1
    );
}
