//! Plugin invocation envelope and result shapes.

use serde::{Deserialize, Serialize};

/// One entity instance handed to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInstanceRef {
    pub id: String,
    pub business_key_value: String,
}

/// One materialized input row (one per bound entity instance).
pub type InputParamData = serde_json::Map<String, serde_json::Value>;

/// Outbound invocation envelope.
///
/// `request_id` is a fresh `flowexec_<uuid>` token per definitive attempt;
/// the same token is never resent unless the previous outcome is known lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInvocation {
    pub request_id: String,
    pub operator: String,
    pub service_name: String,
    pub service_path: String,
    pub entity_instances: Vec<EntityInstanceRef>,
    pub inputs: Vec<InputParamData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_options: Vec<String>,
}

/// Structured plugin response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResult {
    pub request_id: String,
    /// `OK` on success; anything else is a plugin failure.
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub outputs: Vec<serde_json::Value>,
}

impl PluginResult {
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// One finding from the risk-assessment callout. A non-empty finding set
/// puts the node on hold pending human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskCheckFinding {
    pub rule_name: String,
    pub level: String,
    pub detail: String,
}
