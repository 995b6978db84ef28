//! Tenant configuration validation and objective graph construction.
//!
//! Configurations arrive as JSON or YAML documents. They are validated
//! field by field on the untyped document (so every problem is reported,
//! not just the first parse failure), then converted to typed objectives
//! and checked for dangling references and cycles.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{
    EscalationStrategy, Objective, ObjectiveGraph, ObjectiveType, TenantConfiguration,
    SUPPORTED_SCHEMA_VERSION, TERMINAL,
};

/// Machine-readable error codes reported for configuration problems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequiredField,
    InvalidType,
    InvalidValue,
    OutOfRange,
    EmptyObjectives,
    DuplicateId,
    SchemaVersionMismatch,
    ReferenceError,
    CycleError,
    NoRoot,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ReferenceError => ErrorKind::Reference,
            Self::CycleError => ErrorKind::Cycle,
            _ => ErrorKind::Validation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiredField => "REQUIRED_FIELD",
            Self::InvalidType => "INVALID_TYPE",
            Self::InvalidValue => "INVALID_VALUE",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::EmptyObjectives => "EMPTY_OBJECTIVES",
            Self::DuplicateId => "DUPLICATE_ID",
            Self::SchemaVersionMismatch => "SCHEMA_VERSION_MISMATCH",
            Self::ReferenceError => "REFERENCE_ERROR",
            Self::CycleError => "CYCLE_ERROR",
            Self::NoRoot => "NO_ROOT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error taxonomy for configuration problems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Reference,
    Cycle,
}

/// One configuration problem, addressed by field path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path, e.g. `objectives[2].max_retries`
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.code, self.message)
    }
}

/// Outcome of a validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn merge(mut self, other: ValidationReport) -> Self {
        self.errors.extend(other.errors);
        self.valid = self.errors.is_empty();
        self
    }

    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

/// Configuration rejected at load or save time
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("configuration is invalid ({} error(s)): {}", .0.len(), summarize(.0))]
    Invalid(Vec<FieldError>),

    #[error("failed to parse configuration document: {0}")]
    Parse(String),
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    /// Field errors carried by this error (a parse failure counts as one)
    pub fn errors(&self) -> Vec<FieldError> {
        match self {
            Self::Invalid(errors) => errors.clone(),
            Self::Parse(message) => vec![FieldError::new("", ErrorCode::InvalidType, message.clone())],
        }
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        match self {
            Self::Invalid(errors) => errors.iter().any(|e| e.code.kind() == kind),
            Self::Parse(_) => kind == ErrorKind::Validation,
        }
    }
}

/// Parse a JSON or YAML configuration document into an untyped tree
pub fn parse_document(content: &str) -> Result<Value, ConfigError> {
    // YAML is a superset of JSON, so one parser covers both
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Read and parse a configuration document from disk
pub fn read_document(path: &Path) -> anyhow::Result<Value> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
    parse_document(&content)
        .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
}

/// Validates tenant configurations and builds objective graphs.
///
/// Stateless; every operation is pure and synchronous.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigGraphService;

impl ConfigGraphService {
    pub fn new() -> Self {
        Self
    }

    /// Check required fields, enum membership, numeric bounds and list shape
    pub fn validate(&self, raw: &Value) -> ValidationReport {
        let mut errors = Vec::new();

        let Some(doc) = raw.as_object() else {
            errors.push(FieldError::new(
                "",
                ErrorCode::InvalidType,
                "configuration must be an object",
            ));
            return ValidationReport::from_errors(errors);
        };

        for field in ["tenant_id", "tenant_name", "locale", "schema_version"] {
            require_string(doc, field, field, &mut errors);
        }

        if let Some(version) = doc.get("schema_version").and_then(Value::as_str) {
            if version != SUPPORTED_SCHEMA_VERSION {
                errors.push(FieldError::new(
                    "schema_version",
                    ErrorCode::SchemaVersionMismatch,
                    format!(
                        "schema version '{}' is not supported (expected '{}')",
                        version, SUPPORTED_SCHEMA_VERSION
                    ),
                ));
            }
        }

        if let Some(metadata) = doc.get("metadata") {
            if !metadata.is_object() && !metadata.is_null() {
                errors.push(FieldError::new(
                    "metadata",
                    ErrorCode::InvalidType,
                    "metadata must be an object",
                ));
            }
        }

        match doc.get("objectives") {
            None | Some(Value::Null) => errors.push(FieldError::new(
                "objectives",
                ErrorCode::RequiredField,
                "objectives is required",
            )),
            Some(Value::Array(objectives)) if objectives.is_empty() => {
                errors.push(FieldError::new(
                    "objectives",
                    ErrorCode::EmptyObjectives,
                    "at least one objective is required",
                ))
            }
            Some(Value::Array(objectives)) => {
                let mut seen = HashSet::new();
                for (index, objective) in objectives.iter().enumerate() {
                    validate_objective(index, objective, &mut seen, &mut errors);
                }
            }
            Some(_) => errors.push(FieldError::new(
                "objectives",
                ErrorCode::InvalidType,
                "objectives must be a list",
            )),
        }

        ValidationReport::from_errors(errors)
    }

    /// Every non-terminal edge must name an existing objective
    pub fn validate_references(&self, objectives: &[Objective]) -> ValidationReport {
        let ids: HashSet<&str> = objectives.iter().map(|o| o.id.as_str()).collect();
        let mut errors = Vec::new();

        for (index, objective) in objectives.iter().enumerate() {
            for (field, target) in objective.edges() {
                if !ids.contains(target) {
                    errors.push(FieldError::new(
                        format!("objectives[{}].{}", index, field),
                        ErrorCode::ReferenceError,
                        format!(
                            "objective '{}' {} references unknown objective '{}'",
                            objective.id, field, target
                        ),
                    ));
                }
            }
        }

        ValidationReport::from_errors(errors)
    }

    /// Prove the success/failure edges form no cycle.
    ///
    /// Iterative depth-first search from every node (so disconnected
    /// components are covered), with an explicit visited set and an
    /// on-current-path set. A back-edge into the current path is a cycle.
    /// Dangling targets are ignored here; `validate_references` reports them.
    pub fn validate_dag(&self, objectives: &[Objective]) -> ValidationReport {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (position, objective) in objectives.iter().enumerate() {
            index.entry(objective.id.as_str()).or_insert(position);
        }

        let adjacency: Vec<Vec<(&'static str, usize)>> = objectives
            .iter()
            .map(|objective| {
                objective
                    .edges()
                    .filter_map(|(field, target)| index.get(target).map(|&to| (field, to)))
                    .collect()
            })
            .collect();

        let mut visited = vec![false; objectives.len()];
        let mut on_path = vec![false; objectives.len()];
        let mut reported: HashSet<(usize, usize)> = HashSet::new();
        let mut errors = Vec::new();

        for start in 0..objectives.len() {
            if visited[start] {
                continue;
            }

            // Frames are (node, index of the next edge to explore)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            visited[start] = true;
            on_path[start] = true;

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let Some(&(field, target)) = adjacency[node].get(frame.1) else {
                    on_path[node] = false;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                if on_path[target] {
                    if reported.insert((node, target)) {
                        let path = stack
                            .iter()
                            .map(|&(n, _)| n)
                            .skip_while(|&n| n != target)
                            .chain(std::iter::once(target))
                            .map(|n| objectives[n].id.as_str())
                            .collect::<Vec<_>>()
                            .join(" -> ");
                        errors.push(FieldError::new(
                            format!("objectives[{}].{}", node, field),
                            ErrorCode::CycleError,
                            format!(
                                "cycle detected at objective '{}': {}",
                                objectives[target].id, path
                            ),
                        ));
                    }
                } else if !visited[target] {
                    visited[target] = true;
                    on_path[target] = true;
                    stack.push((target, 0));
                }
            }
        }

        ValidationReport::from_errors(errors)
    }

    /// Validate everything and return the typed configuration
    pub fn load(&self, raw: &Value) -> Result<TenantConfiguration, ConfigError> {
        let report = self.validate(raw);
        if !report.valid {
            return Err(ConfigError::Invalid(report.errors));
        }

        let config: TenantConfiguration = serde_json::from_value(normalize(raw))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let report = self
            .validate_references(&config.objectives)
            .merge(self.validate_dag(&config.objectives));
        if !report.valid {
            return Err(ConfigError::Invalid(report.errors));
        }

        debug!(
            tenant_id = %config.tenant_id,
            objectives = config.objectives.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and load a JSON or YAML document
    pub fn load_str(&self, content: &str) -> Result<TenantConfiguration, ConfigError> {
        self.load(&parse_document(content)?)
    }

    /// Objectives with no incoming edge from another objective, in declaration order
    pub fn candidate_roots<'a>(&self, objectives: &'a [Objective]) -> Vec<&'a str> {
        let incoming: HashSet<&str> = objectives
            .iter()
            .flat_map(|o| o.edges().filter(move |(_, target)| *target != o.id))
            .map(|(_, target)| target)
            .collect();

        objectives
            .iter()
            .map(|o| o.id.as_str())
            .filter(|id| !incoming.contains(id))
            .collect()
    }

    /// Build the executable graph. With several candidate roots the first
    /// one in declaration order wins.
    pub fn build_graph(&self, config: &TenantConfiguration) -> Result<ObjectiveGraph, ConfigError> {
        let roots = self.candidate_roots(&config.objectives);

        let Some(root) = roots.first().map(|r| r.to_string()) else {
            return Err(ConfigError::Invalid(vec![FieldError::new(
                "objectives",
                ErrorCode::NoRoot,
                "every objective has an incoming edge; no root can be chosen",
            )]));
        };

        if roots.len() > 1 {
            warn!(
                tenant_id = %config.tenant_id,
                %root,
                candidates = ?roots,
                "Multiple root candidates, using first in declaration order"
            );
        }

        Ok(ObjectiveGraph::new(root, config.objectives.clone()))
    }
}

/// Drop explicit nulls at document and objective level so they behave
/// like absent fields (and pick up serde defaults)
fn normalize(raw: &Value) -> Value {
    fn strip(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    let mut doc = strip(raw);
    if let Some(Value::Array(objectives)) = doc.get_mut("objectives") {
        for objective in objectives.iter_mut() {
            *objective = strip(objective);
        }
    }
    doc
}

fn require_string(doc: &Map<String, Value>, key: &str, field: &str, errors: &mut Vec<FieldError>) {
    match doc.get(key) {
        None | Some(Value::Null) => errors.push(FieldError::new(
            field,
            ErrorCode::RequiredField,
            format!("{} is required", key),
        )),
        Some(Value::String(s)) if s.trim().is_empty() => errors.push(FieldError::new(
            field,
            ErrorCode::RequiredField,
            format!("{} must not be empty", key),
        )),
        Some(Value::String(_)) => {}
        Some(_) => errors.push(FieldError::new(
            field,
            ErrorCode::InvalidType,
            format!("{} must be a string", key),
        )),
    }
}

fn validate_objective(
    index: usize,
    raw: &Value,
    seen: &mut HashSet<String>,
    errors: &mut Vec<FieldError>,
) {
    let prefix = format!("objectives[{}]", index);
    let Some(objective) = raw.as_object() else {
        errors.push(FieldError::new(
            prefix,
            ErrorCode::InvalidType,
            "objective must be an object",
        ));
        return;
    };
    let field = |name: &str| format!("{}.{}", prefix, name);

    require_string(objective, "id", &field("id"), errors);
    if let Some(id) = objective.get("id").and_then(Value::as_str) {
        if id == TERMINAL {
            errors.push(FieldError::new(
                field("id"),
                ErrorCode::InvalidValue,
                format!("'{}' is reserved for the terminal transition", TERMINAL),
            ));
        } else if !id.trim().is_empty() && !seen.insert(id.to_string()) {
            errors.push(FieldError::new(
                field("id"),
                ErrorCode::DuplicateId,
                format!("objective id '{}' is declared more than once", id),
            ));
        }
    }

    require_string(objective, "type", &field("type"), errors);
    if let Some(kind) = objective.get("type").and_then(Value::as_str) {
        if !kind.trim().is_empty() && kind.parse::<ObjectiveType>().is_err() {
            let allowed: Vec<_> = ObjectiveType::ALL.iter().map(|t| t.as_str()).collect();
            errors.push(FieldError::new(
                field("type"),
                ErrorCode::InvalidValue,
                format!("unknown objective type '{}' (allowed: {})", kind, allowed.join(", ")),
            ));
        }
    }

    require_string(objective, "purpose", &field("purpose"), errors);

    if let Some(required) = objective.get("required") {
        if !required.is_boolean() {
            errors.push(FieldError::new(
                field("required"),
                ErrorCode::InvalidType,
                "required must be a boolean",
            ));
        }
    }

    if let Some(retries) = objective.get("max_retries") {
        match retries.as_i64() {
            Some(n) if n < 1 => errors.push(FieldError::new(
                field("max_retries"),
                ErrorCode::OutOfRange,
                format!("max_retries must be at least 1 (got {})", n),
            )),
            Some(n) if n > i64::from(u32::MAX) => errors.push(FieldError::new(
                field("max_retries"),
                ErrorCode::OutOfRange,
                format!("max_retries is too large (got {})", n),
            )),
            Some(_) => {}
            None => errors.push(FieldError::new(
                field("max_retries"),
                ErrorCode::InvalidType,
                "max_retries must be an integer",
            )),
        }
    }

    for edge in ["on_success", "on_failure"] {
        match objective.get(edge) {
            None | Some(Value::Null) => {}
            Some(Value::String(target)) if target.trim().is_empty() => errors.push(
                FieldError::new(field(edge), ErrorCode::InvalidValue, format!("{} must not be empty", edge)),
            ),
            Some(Value::String(_)) => {}
            Some(_) => errors.push(FieldError::new(
                field(edge),
                ErrorCode::InvalidType,
                format!("{} must be an objective id or '{}'", edge, TERMINAL),
            )),
        }
    }

    match objective.get("escalation") {
        None | Some(Value::Null) => {}
        Some(Value::String(strategy)) => {
            if strategy.parse::<EscalationStrategy>().is_err() {
                let allowed: Vec<_> = EscalationStrategy::ALL.iter().map(|s| s.as_str()).collect();
                errors.push(FieldError::new(
                    field("escalation"),
                    ErrorCode::InvalidValue,
                    format!(
                        "unknown escalation strategy '{}' (allowed: {})",
                        strategy,
                        allowed.join(", ")
                    ),
                ));
            }
        }
        Some(_) => errors.push(FieldError::new(
            field("escalation"),
            ErrorCode::InvalidType,
            "escalation must be a string",
        )),
    }

    if let Some(params) = objective.get("params") {
        if !params.is_object() && !params.is_null() {
            errors.push(FieldError::new(
                field("params"),
                ErrorCode::InvalidType,
                "params must be an object",
            ));
        }
    }

    if let Some(timeout) = objective.get("timeout_seconds") {
        match timeout.as_u64() {
            Some(0) => errors.push(FieldError::new(
                field("timeout_seconds"),
                ErrorCode::OutOfRange,
                "timeout_seconds must be positive",
            )),
            Some(_) => {}
            None if timeout.is_null() => {}
            None => errors.push(FieldError::new(
                field("timeout_seconds"),
                ErrorCode::InvalidType,
                "timeout_seconds must be a positive integer",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn objective(id: &str, on_success: Option<&str>, on_failure: Option<&str>) -> Objective {
        let mut raw = json!({"id": id, "type": "capture_name", "purpose": "test"});
        if let Some(target) = on_success {
            raw["on_success"] = json!(target);
        }
        if let Some(target) = on_failure {
            raw["on_failure"] = json!(target);
        }
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_validate_rejects_non_object() {
        let report = ConfigGraphService::new().validate(&json!([1, 2]));
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, ErrorCode::InvalidType);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let report = ConfigGraphService::new().validate_dag(&[objective("a", Some("a"), None)]);
        assert!(!report.valid);
        assert!(report.errors[0].message.contains("a -> a"));
    }

    #[test]
    fn test_dag_ignores_dangling_and_terminal_edges() {
        let objectives = vec![
            objective("a", Some("missing"), Some("end")),
            objective("b", Some("a"), None),
        ];
        let service = ConfigGraphService::new();

        assert!(service.validate_dag(&objectives).valid);
        let refs = service.validate_references(&objectives);
        assert_eq!(refs.errors.len(), 1);
        assert_eq!(refs.errors[0].field, "objectives[0].on_success");
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let objectives = vec![
            objective("a", Some("b"), Some("c")),
            objective("b", Some("d"), None),
            objective("c", Some("d"), None),
            objective("d", Some("end"), None),
        ];
        assert!(ConfigGraphService::new().validate_dag(&objectives).valid);
    }

    #[test]
    fn test_candidate_roots_declaration_order() {
        let objectives = vec![
            objective("x", Some("z"), None),
            objective("z", None, None),
            objective("y", Some("z"), None),
        ];
        let roots = ConfigGraphService::new().candidate_roots(&objectives);
        assert_eq!(roots, vec!["x", "y"]);
    }
}
