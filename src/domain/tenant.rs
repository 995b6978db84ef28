//! Tenant configuration documents.

use serde::{Deserialize, Serialize};

use super::objective::Objective;

/// The only configuration schema version this engine accepts
pub const SUPPORTED_SCHEMA_VERSION: &str = "1.0";

/// A tenant's declarative conversation plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfiguration {
    pub tenant_id: String,

    pub tenant_name: String,

    /// BCP 47 locale tag, e.g. "en-GB"
    pub locale: String,

    pub schema_version: String,

    /// Objectives in declaration order (order matters for root tie-breaks)
    pub objectives: Vec<Objective>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TenantConfiguration {
    pub fn objective(&self, id: &str) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.id == id)
    }
}
