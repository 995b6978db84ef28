//! Objectives and the graph they form.
//!
//! An objective is one unit of conversational work: capture a value of a
//! given type, then move along its success or failure edge.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Edge target that ends the walk instead of naming another objective
pub const TERMINAL: &str = "end";

/// A single declared objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    /// Identifier, unique within the graph
    pub id: String,

    /// Capture primitive executed for this objective
    #[serde(rename = "type")]
    pub objective_type: ObjectiveType,

    /// What the objective is for (passed through to the primitive service)
    pub purpose: String,

    /// Whether a permanent failure fails the whole conversation
    #[serde(default = "default_required")]
    pub required: bool,

    /// Additional attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Where to go after success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Transition>,

    /// Where to go after a skipped (non-required) failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Transition>,

    /// Policy recorded when a required objective fails permanently
    #[serde(default)]
    pub escalation: EscalationStrategy,

    /// Free-form parameters forwarded to the primitive
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Per-call timeout override (engine default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn default_required() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

impl Objective {
    /// Total number of calls the engine may make: the first plus `max_retries`
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Outgoing edges as `(field name, target id)`, skipping the terminal sentinel
    pub fn edges(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("on_success", self.on_success.as_ref()),
            ("on_failure", self.on_failure.as_ref()),
        ]
        .into_iter()
        .filter_map(|(field, transition)| {
            transition
                .and_then(Transition::objective_id)
                .map(|target| (field, target))
        })
    }

    /// Next objective after success, `None` when the walk should end
    pub fn success_target(&self) -> Option<&str> {
        self.on_success.as_ref().and_then(Transition::objective_id)
    }

    /// Next objective after a skip: the failure edge if declared, else the success edge
    pub fn skip_target(&self) -> Option<&str> {
        match &self.on_failure {
            Some(transition) => transition.objective_id(),
            None => self.success_target(),
        }
    }
}

/// Target of an `on_success` / `on_failure` edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transition {
    /// Continue with the named objective
    Objective(String),

    /// Terminal sentinel
    End,
}

impl Transition {
    pub fn objective_id(&self) -> Option<&str> {
        match self {
            Self::Objective(id) => Some(id),
            Self::End => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End)
    }
}

impl From<String> for Transition {
    fn from(value: String) -> Self {
        if value == TERMINAL {
            Self::End
        } else {
            Self::Objective(value)
        }
    }
}

impl From<Transition> for String {
    fn from(value: Transition) -> Self {
        match value {
            Transition::Objective(id) => id,
            Transition::End => TERMINAL.to_string(),
        }
    }
}

/// Closed set of capture primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveType {
    CaptureName,
    CaptureEmail,
    CapturePhone,
    CaptureAddress,
    CapturePostcode,
    CaptureDate,
    CaptureNumber,
    CaptureYesNo,
    CaptureChoice,
    CaptureFreeText,
}

impl ObjectiveType {
    pub const ALL: [ObjectiveType; 10] = [
        Self::CaptureName,
        Self::CaptureEmail,
        Self::CapturePhone,
        Self::CaptureAddress,
        Self::CapturePostcode,
        Self::CaptureDate,
        Self::CaptureNumber,
        Self::CaptureYesNo,
        Self::CaptureChoice,
        Self::CaptureFreeText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaptureName => "capture_name",
            Self::CaptureEmail => "capture_email",
            Self::CapturePhone => "capture_phone",
            Self::CaptureAddress => "capture_address",
            Self::CapturePostcode => "capture_postcode",
            Self::CaptureDate => "capture_date",
            Self::CaptureNumber => "capture_number",
            Self::CaptureYesNo => "capture_yes_no",
            Self::CaptureChoice => "capture_choice",
            Self::CaptureFreeText => "capture_free_text",
        }
    }
}

impl fmt::Display for ObjectiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ObjectiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown objective type '{}'", s))
    }
}

/// What happens when a required objective permanently fails.
///
/// The engine only records the strategy; acting on it belongs to whoever
/// consumes the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStrategy {
    None,
    HumanHandoff,
    Callback,
    Voicemail,
    #[default]
    EndConversation,
}

impl EscalationStrategy {
    pub const ALL: [EscalationStrategy; 5] = [
        Self::None,
        Self::HumanHandoff,
        Self::Callback,
        Self::Voicemail,
        Self::EndConversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::HumanHandoff => "human_handoff",
            Self::Callback => "callback",
            Self::Voicemail => "voicemail",
            Self::EndConversation => "end_conversation",
        }
    }
}

impl fmt::Display for EscalationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EscalationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown escalation strategy '{}'", s))
    }
}

/// Validated, acyclic objective graph with a resolved root
#[derive(Debug, Clone)]
pub struct ObjectiveGraph {
    root: String,
    objectives: HashMap<String, Objective>,
    /// Declaration order of the source list
    order: Vec<String>,
}

impl ObjectiveGraph {
    /// Assemble a graph; callers are expected to have validated the objectives
    pub fn new(root: String, objectives: Vec<Objective>) -> Self {
        let order = objectives.iter().map(|o| o.id.clone()).collect();
        let objectives = objectives.into_iter().map(|o| (o.id.clone(), o)).collect();
        Self {
            root,
            objectives,
            order,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, id: &str) -> Option<&Objective> {
        self.objectives.get(id)
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }

    /// Objectives in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Objective> {
        self.order.iter().filter_map(|id| self.objectives.get(id))
    }
}
