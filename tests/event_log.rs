//! Event Log Integration Tests
//!
//! Tests for event format, per-trace ordering, PII redaction at rest, and
//! replay from the JSONL and SQLite backends.

mod common;

use std::sync::Arc;

use common::{fast_settings, tenant, StubService};
use convo::adapters::PrimitiveResponse;
use convo::core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, EventBackend, EventLog, OrchestrationEngine,
    PrimitiveExecutionClient,
};
use convo::domain::{Conversation, ConversationStatus, Event, EventType};
use convo::storage::{JsonlBackend, MemoryBackend, SqliteBackend};
use convo::StartConversation;
use serde_json::{json, Map};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn pii_service() -> Arc<StubService> {
    Arc::new(StubService::new("speech", |request, _| {
        let value = match request.primitive_type.as_str() {
            "capture_email" => "it's jo.bloggs@example.co.uk",
            "capture_phone" => "call me on 07700 900123",
            _ => "SW1A 1AA",
        };
        Ok(PrimitiveResponse::captured(json!({ "value": value })))
    }))
}

fn pii_graph() -> serde_json::Value {
    json!([
        {"id": "email", "type": "capture_email", "purpose": "receipt", "on_success": "phone"},
        {"id": "phone", "type": "capture_phone", "purpose": "callback", "on_success": "postcode"},
        {"id": "postcode", "type": "capture_postcode", "purpose": "locate", "on_success": "end"},
    ])
}

fn engine_on(backend: Arc<dyn EventBackend>, service: Arc<StubService>) -> OrchestrationEngine {
    let event_log = EventLog::new(backend).unwrap();
    let client = PrimitiveExecutionClient::new(
        service,
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
    );
    OrchestrationEngine::new(client, event_log, fast_settings())
}

fn assert_gapless(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence_number, i as u64 + 1, "gap in trace {}", event.trace_id);
    }
}

#[tokio::test]
async fn test_event_serialization_format() {
    let log = EventLog::new(Arc::new(MemoryBackend::new())).unwrap();
    let conversation = Conversation::start(Uuid::new_v4(), "acme");
    let writer = log.open_trace(&conversation);

    let event = writer
        .append(
            EventType::ObjectiveStarted,
            json!({"objective_id": "email", "objective_type": "capture_email"}),
            Map::new(),
        )
        .unwrap();

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["event_type"], "OBJECTIVE_STARTED");
    assert_eq!(value["event_version"], 1);
    assert_eq!(value["sequence_number"], 1);
    assert_eq!(value["tenant_id"], "acme");
    assert_eq!(value["trace_id"], conversation.trace_id.to_string());
    assert_eq!(value["metadata"]["event_source"], "orchestration_engine");

    // Timestamps are ISO 8601
    assert!(value["timestamp"].as_str().unwrap().contains('T'));

    let parsed: Event = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, event);
}

#[tokio::test]
async fn test_concurrent_appends_keep_trace_order() {
    let backend = Arc::new(MemoryBackend::new());
    let log = EventLog::new(backend.clone()).unwrap();

    let mut conversations = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let conversation = Conversation::start(Uuid::new_v4(), "acme");
        log.record_conversation(&conversation).unwrap();
        let writer = log.open_trace(&conversation);

        // Several handles to the same trace appending at once
        for worker in 0..3 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    writer
                        .append(
                            EventType::ObjectiveAttemptFailed,
                            json!({"objective_id": format!("w{}", worker), "attempt": i}),
                            Map::new(),
                        )
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        conversations.push(conversation);
    }
    for task in tasks {
        task.await.unwrap();
    }

    for conversation in &conversations {
        let events = log.replay(conversation.conversation_id).await.unwrap();
        assert_eq!(events.len(), 30);
        assert_gapless(&events);
    }

    // Persistence order within each trace matches sequence order
    let all = backend.all_events();
    for conversation in &conversations {
        let sequence: Vec<_> = all
            .iter()
            .filter(|e| e.trace_id == conversation.trace_id)
            .map(|e| e.sequence_number)
            .collect();
        assert!(sequence.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn test_jsonl_backend_redacts_pii_at_rest() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(JsonlBackend::open(temp.path()).await.unwrap());
    let engine = engine_on(backend.clone(), pii_service());

    let conversation = engine
        .run_conversation(StartConversation::new(tenant(pii_graph())), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Completed);
    engine.event_log().flush().await.unwrap();

    let raw = tokio::fs::read_to_string(backend.events_path(conversation.trace_id))
        .await
        .unwrap();
    assert_eq!(raw.lines().count(), 8);
    assert!(!raw.contains("jo.bloggs"));
    assert!(!raw.contains("07700"));
    assert!(!raw.contains("SW1A"));
    assert!(raw.contains("[EMAIL_REDACTED]"));
    assert!(raw.contains("[PHONE_REDACTED]"));
    assert!(raw.contains("[POSTCODE_REDACTED]"));
    // Identifiers survive redaction
    assert!(raw.contains(&conversation.trace_id.to_string()));
}

#[tokio::test]
async fn test_jsonl_replay_after_reopen() {
    let temp = TempDir::new().unwrap();
    let conversation_id;
    {
        let backend = Arc::new(JsonlBackend::open(temp.path()).await.unwrap());
        let engine = engine_on(backend, Arc::new(StubService::succeeding("speech")));
        let conversation = engine
            .run_conversation(StartConversation::new(tenant(pii_graph())), CancellationToken::new())
            .await
            .unwrap();
        engine.event_log().flush().await.unwrap();
        conversation_id = conversation.conversation_id;
    }

    let log = EventLog::new(Arc::new(JsonlBackend::open(temp.path()).await.unwrap())).unwrap();
    let events = log.replay(conversation_id).await.unwrap();
    assert_eq!(events.len(), 8);
    assert_gapless(&events);
    assert_eq!(events[0].event_type, EventType::ConversationStarted);
    assert_eq!(events[7].event_type, EventType::ConversationEnded);

    let stored = log.conversation(conversation_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ConversationStatus::Completed);
    assert_eq!(log.list_conversations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sqlite_backend_replay() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("events.db");
    let conversation_id;
    {
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());
        let engine = engine_on(backend, pii_service());
        let conversation = engine
            .run_conversation(StartConversation::new(tenant(pii_graph())), CancellationToken::new())
            .await
            .unwrap();
        engine.event_log().flush().await.unwrap();
        conversation_id = conversation.conversation_id;
    }

    let log = EventLog::new(Arc::new(SqliteBackend::open(&path).unwrap())).unwrap();
    let events = log.replay(conversation_id).await.unwrap();
    assert_eq!(events.len(), 8);
    assert_gapless(&events);

    let email = events
        .iter()
        .find(|e| e.event_type == EventType::ObjectiveCompleted)
        .unwrap();
    assert_eq!(email.payload["data"]["value"], "it's [EMAIL_REDACTED]");
}

#[tokio::test]
async fn test_concurrent_conversations_share_one_log() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(JsonlBackend::open(temp.path()).await.unwrap());
    let engine = Arc::new(engine_on(backend, Arc::new(StubService::succeeding("speech"))));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let request = StartConversation::new(tenant(pii_graph()));
        handles.push(engine.spawn_conversation(request).await.unwrap());
    }

    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.join().await);
    }

    for conversation in &finished {
        assert_eq!(conversation.status, ConversationStatus::Completed);
        let events = engine.event_log().replay(conversation.conversation_id).await.unwrap();
        assert_eq!(events.len(), 8);
        assert_gapless(&events);
        assert!(events.iter().all(|e| e.conversation_id == conversation.conversation_id));
    }
    assert_eq!(engine.event_log().list_conversations().await.unwrap().len(), 8);
}
