//! Command-line interface for convo.
//!
//! Provides commands for validating and storing tenant configurations,
//! running conversations, and inspecting their event history.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{HttpPrimitiveService, PrimitiveService};
use crate::config::{self, EventBackendKind, ResolvedConfig};
use crate::core::{
    read_document, CircuitBreakerRegistry, ConfigGraphService, EventBackend, EventLog,
    OrchestrationEngine, PrimitiveExecutionClient, StartConversation,
};
use crate::domain::{ConversationState, ConversationStatus};
use crate::storage::{ConfigStore, ConfigStoreError, JsonlBackend, SqliteBackend};

/// convo - Event-sourced conversation orchestration engine
#[derive(Parser, Debug)]
#[command(name = "convo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a tenant configuration file (JSON or YAML)
    Validate {
        /// Configuration file
        file: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage stored tenant configurations
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Run a conversation for a tenant
    Run {
        /// Tenant ID
        tenant_id: String,

        /// Configuration version (latest if not provided)
        #[arg(long)]
        version: Option<u32>,

        /// Conversation ID (generated if not provided)
        #[arg(long)]
        conversation_id: Option<Uuid>,
    },

    /// Print the events of a conversation in order
    Events {
        /// Conversation ID (UUID)
        conversation_id: String,
    },

    /// Show the state of a conversation, rebuilt from its events
    Status {
        /// Conversation ID (UUID)
        conversation_id: String,
    },

    /// List recent conversations
    Conversations {
        /// Maximum number of conversations to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Check that the primitive execution service is reachable
    Health,

    /// Show resolved settings (debug)
    Settings,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate and store a configuration as a new version
    Save {
        /// Configuration file
        file: PathBuf,
    },

    /// Print a stored configuration
    Show {
        /// Tenant ID
        tenant_id: String,

        /// Version (latest if not provided)
        #[arg(long)]
        version: Option<u32>,
    },

    /// List stored versions for a tenant
    Versions {
        /// Tenant ID
        tenant_id: String,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Validate { file, json } => validate_file(&file, json),
            Commands::Config { command } => execute_config(command),
            Commands::Run {
                tenant_id,
                version,
                conversation_id,
            } => run_conversation(&tenant_id, version, conversation_id).await,
            Commands::Events { conversation_id } => show_events(&conversation_id).await,
            Commands::Status { conversation_id } => show_status(&conversation_id).await,
            Commands::Conversations { limit } => list_conversations(limit).await,
            Commands::Health => check_health().await,
            Commands::Settings => show_settings(),
        }
    }
}

fn config_store() -> Result<ConfigStore> {
    Ok(ConfigStore::new(config::config()?.configs_dir()))
}

/// Open the event log on the configured backend
async fn open_event_log(cfg: &ResolvedConfig) -> Result<EventLog> {
    let backend: Arc<dyn EventBackend> = match cfg.event_backend {
        EventBackendKind::Jsonl => Arc::new(JsonlBackend::open(cfg.events_dir()).await?),
        EventBackendKind::Sqlite => Arc::new(SqliteBackend::open(cfg.database_path())?),
    };
    EventLog::new(backend).context("Failed to start event log")
}

fn parse_conversation_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid conversation ID: {}", value))
}

/// Validate a configuration file and print every problem found
fn validate_file(path: &Path, json: bool) -> Result<()> {
    let raw = read_document(path)?;
    let graphs = ConfigGraphService::new();

    let mut report = graphs.validate(&raw);
    let mut root = None;
    if report.valid {
        match graphs.load(&raw).and_then(|config| graphs.build_graph(&config)) {
            Ok(graph) => root = Some(graph.root().to_string()),
            Err(e) => {
                report = crate::core::ValidationReport::from_errors(e.errors());
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.valid {
        println!("✓ {} is valid", path.display());
        if let Some(root) = root {
            println!("  Root objective: {}", root);
        }
    } else {
        println!("✗ {} is invalid:", path.display());
        for error in &report.errors {
            println!("  {:<30} {:<24} {}", error.field, error.code, error.message);
        }
    }

    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

fn execute_config(command: ConfigCommands) -> Result<()> {
    let store = config_store()?;

    match command {
        ConfigCommands::Save { file } => {
            let raw = read_document(&file)?;
            match store.save(&raw) {
                Ok(stored) => {
                    println!(
                        "Saved {} version {} ({})",
                        stored.tenant_id, stored.version, stored.checksum
                    );
                    Ok(())
                }
                Err(ConfigStoreError::Invalid(e)) => {
                    eprintln!("Configuration rejected:");
                    for error in e.errors() {
                        eprintln!("  {}", error);
                    }
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }
        ConfigCommands::Show { tenant_id, version } => {
            let stored = match version {
                Some(version) => store.load_version(&tenant_id, version)?,
                None => store.load_latest(&tenant_id)?,
            };
            println!("{}", serde_json::to_string_pretty(&stored)?);
            Ok(())
        }
        ConfigCommands::Versions { tenant_id } => {
            let versions = store.list_versions(&tenant_id)?;
            if versions.is_empty() {
                println!("No configurations stored for {}", tenant_id);
                return Ok(());
            }

            println!("{:<10} {:<28} {}", "VERSION", "CREATED", "CHECKSUM");
            println!("{}", "-".repeat(110));
            for version in versions {
                let stored = store.load_version(&tenant_id, version)?;
                println!(
                    "{:<10} {:<28} {}",
                    stored.version,
                    stored.created_at.to_rfc3339(),
                    stored.checksum
                );
            }
            Ok(())
        }
    }
}

/// Run a conversation against the configured primitive service
async fn run_conversation(
    tenant_id: &str,
    version: Option<u32>,
    conversation_id: Option<Uuid>,
) -> Result<()> {
    let cfg = config::config()?;
    let store = config_store()?;
    let stored = match version {
        Some(version) => store.load_version(tenant_id, version)?,
        None => store.load_latest(tenant_id)?,
    };

    let service = HttpPrimitiveService::new(cfg.provider.clone(), cfg.primitive_url.clone());
    let client = PrimitiveExecutionClient::new(
        Arc::new(service),
        CircuitBreakerRegistry::new(cfg.breaker.clone()),
    );
    let event_log = open_event_log(cfg).await?;
    let engine = Arc::new(OrchestrationEngine::new(
        client,
        event_log.clone(),
        cfg.engine.clone(),
    ));

    let mut request = StartConversation::new(stored.configuration);
    request.conversation_id = conversation_id;

    let handle = engine.spawn_conversation(request).await?;
    eprintln!(
        "Conversation {} (trace {}) using {} v{}",
        handle.conversation_id(),
        handle.trace_id(),
        tenant_id,
        stored.version
    );

    // Ctrl-C aborts the conversation instead of killing the process
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let conversation = handle.join().await;
    let events = event_log.replay(conversation.conversation_id).await?;

    for event in &events {
        let objective = event.objective_id().unwrap_or("");
        println!(
            "{:>4}  {:<26} {}",
            event.sequence_number, event.event_type, objective
        );
    }

    match conversation.status {
        ConversationStatus::Completed => {
            eprintln!("\n[Conversation {} completed]", conversation.conversation_id);
        }
        status => {
            let error = events.last().and_then(|e| e.error());
            eprintln!(
                "\n[Conversation {} {}: {}]",
                conversation.conversation_id,
                status,
                error
                    .map(|e| format!("{} {}", e.code, e.message))
                    .unwrap_or_default()
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Print the events of a conversation as JSON lines
async fn show_events(conversation_id: &str) -> Result<()> {
    let conversation_id = parse_conversation_id(conversation_id)?;
    let event_log = open_event_log(config::config()?).await?;

    for event in event_log.replay(conversation_id).await? {
        println!("{}", serde_json::to_string(&event)?);
    }

    Ok(())
}

/// Show the state of a conversation
async fn show_status(conversation_id: &str) -> Result<()> {
    let conversation_id = parse_conversation_id(conversation_id)?;
    let event_log = open_event_log(config::config()?).await?;

    let events = event_log.replay(conversation_id).await?;
    let state = ConversationState::from_events(&events)
        .with_context(|| format!("No events recorded for conversation {}", conversation_id))?;

    println!("Conversation: {}", state.conversation_id);
    println!("Tenant: {}", state.tenant_id);
    println!("Trace: {}", state.trace_id);
    println!("Status: {}", state.status);
    println!("Started: {}", state.started_at);
    if let Some(ended) = state.ended_at {
        println!("Ended: {}", ended);
    }
    if let Some(current) = &state.current_objective {
        println!("Current objective: {}", current);
    }
    if let Some(error) = &state.error {
        println!("Error: {} {}", error.code, error.message);
    }

    println!("\nObjectives:");
    let mut objectives: Vec<_> = state.objective_statuses.iter().collect();
    objectives.sort_by(|a, b| a.0.cmp(b.0));
    for (objective, status) in objectives {
        let failures = state.failed_attempts.get(objective).copied().unwrap_or(0);
        println!("  {:<24} {:<10} failed attempts: {}", objective, format!("{:?}", status), failures);
    }

    Ok(())
}

/// List recent conversations
async fn list_conversations(limit: usize) -> Result<()> {
    let event_log = open_event_log(config::config()?).await?;
    let conversations = event_log.list_conversations().await?;

    if conversations.is_empty() {
        println!("No conversations found");
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<12} {}",
        "CONVERSATION ID", "TENANT", "STATUS", "STARTED"
    );
    println!("{}", "-".repeat(100));

    for conversation in conversations.iter().rev().take(limit) {
        println!(
            "{:<38} {:<16} {:<12} {}",
            conversation.conversation_id,
            conversation.tenant_id,
            conversation.status,
            conversation.started_at.to_rfc3339()
        );
    }

    Ok(())
}

async fn check_health() -> Result<()> {
    let cfg = config::config()?;
    let service = HttpPrimitiveService::new(cfg.provider.clone(), cfg.primitive_url.clone());
    service.health_check().await?;
    println!("✓ {} is reachable at {}", service.name(), cfg.primitive_url);
    Ok(())
}

fn show_settings() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:           {}", cfg.home.display());
    println!("  Configurations: {}", cfg.configs_dir().display());
    match cfg.event_backend {
        EventBackendKind::Jsonl => println!("  Events (jsonl): {}", cfg.events_dir().display()),
        EventBackendKind::Sqlite => {
            println!("  Events (sqlite): {}", cfg.database_path().display())
        }
    }
    println!();
    println!("Primitive service:");
    println!("  URL:             {}", cfg.primitive_url);
    println!("  Provider:        {}", cfg.provider);
    println!("  Default timeout: {}s", cfg.engine.default_timeout_seconds);
    println!();
    println!("Circuit breaker:");
    println!("  Failure threshold: {}", cfg.breaker.failure_threshold);
    println!("  Success threshold: {}", cfg.breaker.success_threshold);
    println!("  Open timeout:      {:?}", cfg.breaker.open_timeout);
    println!();
    println!("Retry backoff:");
    println!("  Initial delay: {}ms", cfg.engine.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.engine.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.engine.retry.backoff_multiplier);
    println!();
    println!("Limits:");
    println!("  Max objectives: {}", cfg.engine.limits.max_objectives);
    println!(
        "  Timeout:        {}s",
        cfg.engine.limits.conversation_timeout_seconds
    );

    Ok(())
}
