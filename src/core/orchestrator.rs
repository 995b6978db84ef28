//! Orchestration engine: walks a tenant's objective graph.
//!
//! One conversation is one sequential walk. Each objective is executed
//! through the primitive client with retries, and every lifecycle change is
//! appended to the event log. The engine keeps no durable state of its own;
//! everything an observer needs is in the event stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::PrimitiveRequest;
use crate::domain::{
    Conversation, ConversationStatus, ErrorSummary, EventType, Objective, TenantConfiguration,
};

use super::config_graph::{ConfigError, ConfigGraphService};
use super::errors::{CODE_ABORTED, CODE_INTERNAL_ERROR, CODE_PRIMITIVE_ERROR, CODE_RETRY_EXHAUSTED};
use super::event_log::{EventLog, EventLogError, TraceWriter};
use super::policy::{EngineLimits, LimitTracker, LimitViolation, RetryPolicy};
use super::primitive_client::{PrimitiveExecutionClient, PrimitiveResult};

/// Tunables for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Per-call timeout when an objective does not set its own
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub limits: EngineLimits,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            retry: RetryPolicy::default(),
            limits: EngineLimits::default(),
        }
    }
}

/// Request to start a conversation
#[derive(Debug, Clone)]
pub struct StartConversation {
    pub tenant_id: String,

    /// Generated when absent
    pub conversation_id: Option<Uuid>,

    pub config: TenantConfiguration,
}

impl StartConversation {
    pub fn new(config: TenantConfiguration) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            conversation_id: None,
            config,
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }
}

/// Reasons a conversation could not be started. Nothing is written for it.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("conversation {0} already exists")]
    ConversationExists(Uuid),

    #[error("event log unavailable: {0}")]
    Log(EventLogError),
}

impl From<EventLogError> for StartError {
    fn from(e: EventLogError) -> Self {
        match e {
            EventLogError::ConversationExists(id) => Self::ConversationExists(id),
            other => Self::Log(other),
        }
    }
}

/// Failures that stop a walk early; all of them still end the conversation
#[derive(Debug, Error)]
enum WalkError {
    #[error("objective graph could not be built: {0}")]
    Graph(#[from] ConfigError),

    #[error(transparent)]
    Limit(#[from] LimitViolation),

    #[error("event log unavailable: {0}")]
    Log(#[from] EventLogError),

    #[error("objective '{0}' is not part of the graph")]
    UnknownObjective(String),

    #[error("request tenant '{request}' does not match configuration tenant '{config}'")]
    TenantMismatch { request: String, config: String },
}

impl WalkError {
    fn summary(&self) -> ErrorSummary {
        match self {
            Self::Limit(violation) => ErrorSummary::new(violation.code(), violation.to_string()),
            other => ErrorSummary::new(CODE_INTERNAL_ERROR, other.to_string()),
        }
    }
}

/// How a walk ended
#[derive(Debug)]
enum WalkOutcome {
    Completed,
    Failed(ErrorSummary),
    Aborted(ErrorSummary),
}

impl WalkOutcome {
    fn status(&self) -> ConversationStatus {
        match self {
            Self::Completed => ConversationStatus::Completed,
            Self::Failed(_) => ConversationStatus::Failed,
            Self::Aborted(_) => ConversationStatus::Aborted,
        }
    }

    fn error(&self) -> Option<&ErrorSummary> {
        match self {
            Self::Completed => None,
            Self::Failed(e) | Self::Aborted(e) => Some(e),
        }
    }

    fn aborted(objective_id: &str) -> Self {
        Self::Aborted(
            ErrorSummary::new(CODE_ABORTED, "conversation aborted").for_objective(objective_id),
        )
    }
}

/// How one objective ended
enum ObjectiveOutcome {
    Completed,
    Skipped,
    Failed(ErrorSummary),
    Aborted,
}

/// Drives conversations over objective graphs
pub struct OrchestrationEngine {
    client: PrimitiveExecutionClient,
    event_log: EventLog,
    graphs: ConfigGraphService,
    settings: EngineSettings,
}

impl OrchestrationEngine {
    pub fn new(client: PrimitiveExecutionClient, event_log: EventLog, settings: EngineSettings) -> Self {
        Self {
            client,
            event_log,
            graphs: ConfigGraphService::new(),
            settings,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn client(&self) -> &PrimitiveExecutionClient {
        &self.client
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Claim the conversation id and open its trace.
    ///
    /// A caller-supplied id that is already recorded is refused, leaving
    /// the existing record and trace untouched.
    async fn open_conversation(
        &self,
        request: &StartConversation,
    ) -> Result<(Conversation, TraceWriter), StartError> {
        let conversation = Conversation::start(
            request.conversation_id.unwrap_or_else(Uuid::new_v4),
            request.tenant_id.clone(),
        );
        if let Err(e) = self.event_log.register_conversation(&conversation).await {
            warn!(
                conversation_id = %conversation.conversation_id,
                error = %e,
                "Refusing to start conversation"
            );
            return Err(e.into());
        }
        let writer = self.event_log.open_trace(&conversation);
        Ok((conversation, writer))
    }

    /// Run a conversation to completion on the current task.
    ///
    /// Once started, every outcome, including internal errors, is recorded
    /// as a terminal `CONVERSATION_ENDED` event and reflected in the
    /// returned record.
    pub async fn run_conversation(
        &self,
        request: StartConversation,
        cancel: CancellationToken,
    ) -> Result<Conversation, StartError> {
        let (conversation, writer) = self.open_conversation(&request).await?;
        Ok(self.drive(conversation, writer, request, cancel).await)
    }

    /// Run a conversation on its own task
    pub async fn spawn_conversation(
        self: &Arc<Self>,
        request: StartConversation,
    ) -> Result<ConversationHandle, StartError> {
        let (conversation, writer) = self.open_conversation(&request).await?;
        let cancel = CancellationToken::new();

        let engine = Arc::clone(self);
        let task = tokio::spawn({
            let conversation = conversation.clone();
            let writer = writer.clone();
            let cancel = cancel.clone();
            async move { engine.drive(conversation, writer, request, cancel).await }
        });

        Ok(ConversationHandle {
            conversation,
            writer,
            event_log: self.event_log.clone(),
            cancel,
            task,
        })
    }

    #[instrument(
        skip_all,
        fields(
            tenant_id = %conversation.tenant_id,
            conversation_id = %conversation.conversation_id,
            trace_id = %conversation.trace_id,
        )
    )]
    async fn drive(
        &self,
        conversation: Conversation,
        writer: TraceWriter,
        request: StartConversation,
        cancel: CancellationToken,
    ) -> Conversation {
        info!("Starting conversation");

        let config = &request.config;
        let started = writer.append(
            EventType::ConversationStarted,
            json!({
                "tenant_name": config.tenant_name,
                "locale": config.locale,
                "schema_version": config.schema_version,
                "objective_count": config.objectives.len(),
            }),
            Map::new(),
        );

        let outcome = match started {
            Ok(_) => {
                let walk = if request.tenant_id != config.tenant_id {
                    Err(WalkError::TenantMismatch {
                        request: request.tenant_id.clone(),
                        config: config.tenant_id.clone(),
                    })
                } else {
                    self.walk(&writer, config, &cancel).await
                };
                walk.unwrap_or_else(|e| {
                    error!(error = %e, "Conversation failed internally");
                    WalkOutcome::Failed(e.summary())
                })
            }
            Err(e) => WalkOutcome::Failed(WalkError::from(e).summary()),
        };

        close_conversation(&self.event_log, &writer, conversation, outcome)
    }

    async fn walk(
        &self,
        writer: &TraceWriter,
        config: &TenantConfiguration,
        cancel: &CancellationToken,
    ) -> Result<WalkOutcome, WalkError> {
        let graph = self.graphs.build_graph(config)?;
        let limits = &self.settings.limits;
        let deadline = Instant::now() + Duration::from_secs(limits.conversation_timeout_seconds);
        let mut tracker = LimitTracker::new();

        let mut current = Some(graph.root().to_string());
        while let Some(objective_id) = current {
            if cancel.is_cancelled() {
                return Ok(WalkOutcome::aborted(&objective_id));
            }
            limits.check(&tracker)?;
            tracker.record_objective();

            let objective = graph
                .get(&objective_id)
                .ok_or_else(|| WalkError::UnknownObjective(objective_id.clone()))?;

            current = match self
                .run_objective(writer, objective, cancel, deadline, &tracker)
                .await?
            {
                ObjectiveOutcome::Completed => objective.success_target().map(str::to_string),
                ObjectiveOutcome::Skipped => objective.skip_target().map(str::to_string),
                ObjectiveOutcome::Failed(summary) => return Ok(WalkOutcome::Failed(summary)),
                ObjectiveOutcome::Aborted => return Ok(WalkOutcome::aborted(&objective_id)),
            };
        }

        Ok(WalkOutcome::Completed)
    }

    /// Execute one objective with up to `1 + max_retries` attempts
    async fn run_objective(
        &self,
        writer: &TraceWriter,
        objective: &Objective,
        cancel: &CancellationToken,
        deadline: Instant,
        tracker: &LimitTracker,
    ) -> Result<ObjectiveOutcome, WalkError> {
        let total_attempts = objective.total_attempts();
        let timeout_seconds = objective
            .timeout_seconds
            .unwrap_or(self.settings.default_timeout_seconds);

        writer.append(
            EventType::ObjectiveStarted,
            json!({
                "objective_id": objective.id,
                "objective_type": objective.objective_type,
                "purpose": objective.purpose,
                "required": objective.required,
                "max_retries": objective.max_retries,
            }),
            Map::new(),
        )?;
        debug!(objective = %objective.id, total_attempts, "Objective started");

        let timed_out = || LimitViolation::ConversationTimeout {
            elapsed_seconds: tracker.elapsed_seconds(),
            limit_seconds: self.settings.limits.conversation_timeout_seconds,
        };

        let mut last_error = ErrorSummary::new(CODE_PRIMITIVE_ERROR, "no attempt was made");

        for retry_count in 0..total_attempts {
            if retry_count > 0 {
                let delay = self.settings.retry.delay_for_retry(retry_count);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(ObjectiveOutcome::Aborted),
                    _ = tokio::time::sleep_until(deadline) => return Err(timed_out().into()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let request = PrimitiveRequest {
                primitive_type: objective.objective_type,
                params: objective.params.clone(),
                conversation_id: writer.conversation_id(),
                trace_id: writer.trace_id(),
                purpose: objective.purpose.clone(),
                timeout_seconds,
                retry_count,
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ObjectiveOutcome::Aborted),
                _ = tokio::time::sleep_until(deadline) => return Err(timed_out().into()),
                result = self.client.execute(request) => result,
            };
            let metadata = attempt_metadata(retry_count, &result);

            if result.success {
                writer.append(
                    EventType::ObjectiveCompleted,
                    json!({
                        "objective_id": objective.id,
                        "objective_type": objective.objective_type,
                        "data": result.data,
                        "attempts": retry_count + 1,
                        "confidence": result.confidence(),
                    }),
                    metadata,
                )?;
                info!(objective = %objective.id, attempts = retry_count + 1, "Objective completed");
                return Ok(ObjectiveOutcome::Completed);
            }

            let (code, message) = match &result.error {
                Some(e) => (e.code.clone(), e.message.clone()),
                None => (
                    CODE_PRIMITIVE_ERROR.to_string(),
                    "primitive reported failure without an error".to_string(),
                ),
            };
            writer.append(
                EventType::ObjectiveAttemptFailed,
                json!({
                    "objective_id": objective.id,
                    "attempt": retry_count + 1,
                    "error": {"code": code, "message": message},
                }),
                metadata,
            )?;
            warn!(
                objective = %objective.id,
                attempt = retry_count + 1,
                total_attempts,
                %code,
                "Objective attempt failed"
            );
            last_error = ErrorSummary::new(code, message).for_objective(&objective.id);
        }

        if objective.required {
            writer.append(
                EventType::ObjectiveFailed,
                json!({
                    "objective_id": objective.id,
                    "attempts": total_attempts,
                    "error": last_error,
                    "escalation": objective.escalation,
                }),
                Map::new(),
            )?;
            error!(
                objective = %objective.id,
                escalation = %objective.escalation,
                "Required objective failed"
            );
            let summary = ErrorSummary::new(
                CODE_RETRY_EXHAUSTED,
                format!(
                    "objective '{}' failed after {} attempt(s): {}",
                    objective.id, total_attempts, last_error.code
                ),
            )
            .for_objective(&objective.id);
            Ok(ObjectiveOutcome::Failed(summary))
        } else {
            writer.append(
                EventType::ObjectiveSkipped,
                json!({
                    "objective_id": objective.id,
                    "attempts": total_attempts,
                    "error": last_error,
                }),
                Map::new(),
            )?;
            info!(objective = %objective.id, "Optional objective skipped");
            Ok(ObjectiveOutcome::Skipped)
        }
    }
}

fn attempt_metadata(retry_count: u32, result: &PrimitiveResult) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("retry_count".to_string(), json!(retry_count));
    metadata.insert("duration_ms".to_string(), json!(result.duration_ms()));
    if let Some(state) = result.circuit_state() {
        metadata.insert("circuit_state".to_string(), json!(state));
    }
    metadata
}

/// Append the terminal event and settle the conversation record
fn close_conversation(
    event_log: &EventLog,
    writer: &TraceWriter,
    mut conversation: Conversation,
    outcome: WalkOutcome,
) -> Conversation {
    let status = outcome.status();

    let mut payload = json!({ "status": status });
    if let Some(error) = outcome.error() {
        payload["error"] = json!(error);
    }
    if let Err(e) = writer.append(EventType::ConversationEnded, payload, Map::new()) {
        error!(error = %e, "Failed to append terminal event");
    }

    if let Err(e) = conversation.finish(status, Utc::now()) {
        warn!(error = %e, "Conversation already finished");
    }
    if let Err(e) = event_log.record_conversation(&conversation) {
        error!(error = %e, "Failed to record conversation end");
    }

    info!(status = %conversation.status, "Conversation ended");
    conversation
}

/// Handle to a conversation running on its own task
pub struct ConversationHandle {
    conversation: Conversation,
    writer: TraceWriter,
    event_log: EventLog,
    cancel: CancellationToken,
    task: JoinHandle<Conversation>,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation.conversation_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.conversation.trace_id
    }

    /// Ask the conversation to stop; it ends as `aborted`
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the conversation to end.
    ///
    /// If the task itself died, the conversation is closed here as failed.
    pub async fn join(self) -> Conversation {
        match self.task.await {
            Ok(conversation) => conversation,
            Err(e) => {
                error!(
                    conversation_id = %self.conversation.conversation_id,
                    error = %e,
                    "Conversation task died"
                );
                let summary = ErrorSummary::new(
                    CODE_INTERNAL_ERROR,
                    format!("conversation task died: {}", e),
                );
                close_conversation(
                    &self.event_log,
                    &self.writer,
                    self.conversation,
                    WalkOutcome::Failed(summary),
                )
            }
        }
    }
}
