//! Configuration for convo.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONVO_HOME, CONVO_PRIMITIVE_URL)
//! 2. Config file (.convo/config.yaml)
//! 3. Defaults (~/.convo)
//!
//! Config file discovery:
//! - Searches current directory and parents for .convo/config.yaml
//! - `paths.home` is relative to the .convo/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{CircuitBreakerConfig, EngineLimits, EngineSettings, RetryPolicy};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_PRIMITIVE_URL: &str = "http://localhost:8080";
const DEFAULT_PROVIDER: &str = "primitive-service";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub primitive: PrimitiveConfig,
    #[serde(default)]
    pub breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub limits: Option<EngineLimits>,
    #[serde(default)]
    pub event_log: EventLogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .convo/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimitiveConfig {
    pub base_url: Option<String>,
    pub provider: Option<String>,
    pub default_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventLogConfig {
    #[serde(default)]
    pub backend: EventBackendKind,
}

/// Which event backend to persist to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBackendKind {
    #[default]
    Jsonl,
    Sqlite,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to convo home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Primitive execution service base URL
    pub primitive_url: String,
    /// Provider name (part of circuit breaker keys)
    pub provider: String,
    pub breaker: CircuitBreakerConfig,
    pub engine: EngineSettings,
    pub event_backend: EventBackendKind,
}

impl ResolvedConfig {
    /// Directory for JSONL event traces and conversation records
    pub fn events_dir(&self) -> PathBuf {
        self.home.join("events")
    }

    /// SQLite database for the sqlite backend
    pub fn database_path(&self) -> PathBuf {
        self.home.join("events.db")
    }

    /// Directory for versioned tenant configurations
    pub fn configs_dir(&self) -> PathBuf {
        self.home.join("configs")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".convo").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file settings, environment overrides and defaults
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    env_home: Option<String>,
    env_url: Option<String>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let home = match (env_home, &file.paths.home, &config_file) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home), Some(config_path)) => {
            let convo_dir = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(convo_dir, home)
        }
        _ => default_home,
    };

    let primitive_url = env_url
        .or(file.primitive.base_url)
        .unwrap_or_else(|| DEFAULT_PRIMITIVE_URL.to_string());

    let mut engine = EngineSettings {
        retry: file.retry.unwrap_or_default(),
        limits: file.limits.unwrap_or_default(),
        ..Default::default()
    };
    if let Some(timeout) = file.primitive.default_timeout_seconds {
        engine.default_timeout_seconds = timeout;
    }

    ResolvedConfig {
        home,
        config_file,
        primitive_url,
        provider: file
            .primitive
            .provider
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
        breaker: file.breaker.unwrap_or_default(),
        engine,
        event_backend: file.event_log.backend,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".convo");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(
        file,
        config_file,
        std::env::var("CONVO_HOME").ok(),
        std::env::var("CONVO_PRIMITIVE_URL").ok(),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
