//! Process definition types.
//!
//! Definitions are authored elsewhere; the engine only reads them. They are
//! immutable once deployed, so every type here is a plain data carrier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseStatusError;

/// Lifecycle of a process definition.
///
/// Draft rows may be deleted outright; once deployed a definition only moves
/// between `Deployed` and `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcDefStatus {
    Draft,
    Deployed,
    Disabled,
    Deleted,
}

impl std::fmt::Display for ProcDefStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Deployed => write!(f, "deployed"),
            Self::Disabled => write!(f, "disabled"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for ProcDefStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "deployed" => Ok(Self::Deployed),
            "disabled" => Ok(Self::Disabled),
            "deleted" => Ok(Self::Deleted),
            other => Err(ParseStatusError {
                kind: "proc def status",
                value: other.to_string(),
            }),
        }
    }
}

/// Node behavior tag. The per-type execution policy lives in the engine;
/// this enum is the single dispatch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Start,
    End,
    Auto,
    Data,
    Human,
    Decision,
    Foreach,
    Subprocess,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::End => write!(f, "end"),
            Self::Auto => write!(f, "auto"),
            Self::Data => write!(f, "data"),
            Self::Human => write!(f, "human"),
            Self::Decision => write!(f, "decision"),
            Self::Foreach => write!(f, "foreach"),
            Self::Subprocess => write!(f, "subprocess"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            "auto" => Ok(Self::Auto),
            "data" => Ok(Self::Data),
            "human" => Ok(Self::Human),
            "decision" => Ok(Self::Decision),
            "foreach" => Ok(Self::Foreach),
            "subprocess" => Ok(Self::Subprocess),
            other => Err(ParseStatusError {
                kind: "node type",
                value: other.to_string(),
            }),
        }
    }
}

/// How a definition node input parameter is bound at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamBindType {
    /// Literal value supplied by the author.
    Constant,
    /// Looked up from an upstream node's structured output.
    Context,
    /// Read from an attribute of the bound entity instance.
    Entity,
}

impl std::str::FromStr for ParamBindType {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(Self::Constant),
            "context" => Ok(Self::Context),
            "entity" => Ok(Self::Entity),
            other => Err(ParseStatusError {
                kind: "param bind type",
                value: other.to_string(),
            }),
        }
    }
}

/// A process definition row. Versions for one `key` are totally ordered;
/// deploying mints the next `v{n+1}`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcDef {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub version: String,
    /// Root entity expression, e.g. `wecmdb:app_system`.
    pub root_entity: String,
    pub status: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A node inside a process definition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcDefNode {
    pub id: Uuid,
    pub proc_def_id: Uuid,
    /// Author-assigned id, unique within the definition.
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    /// Plugin interface reference for auto/foreach nodes; for subprocess
    /// nodes this names the child definition key.
    pub service_name: Option<String>,
    /// Entity-model expression resolved against the root entity.
    pub routine_expression: Option<String>,
    /// When true, bindings are copied from `bind_node_id` at execution time
    /// instead of being materialized at instance start.
    pub dynamic_bind: bool,
    pub bind_node_id: Option<String>,
    pub risk_check: bool,
    /// Per-node execution timeout in seconds; 0 means no timeout.
    pub timeout_seconds: i32,
    /// Execution order hint used by preview expansion; empty means the node
    /// contributes no preview data.
    pub ordered_no: Option<String>,
    /// Comma list of upstream node ids whose outputs feed this node.
    pub context_param_nodes: Option<String>,
}

impl ProcDefNode {
    pub fn node_type(&self) -> Result<NodeType, ParseStatusError> {
        self.node_type.parse()
    }

    /// Upstream node ids declared as context sources.
    pub fn context_nodes(&self) -> Vec<&str> {
        self.context_param_nodes
            .as_deref()
            .map(|s| s.split(',').filter(|p| !p.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// A directed edge between two definition nodes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcDefLink {
    pub id: Uuid,
    pub proc_def_id: Uuid,
    pub link_id: String,
    /// Source node id (author-assigned).
    pub source: String,
    /// Target node id (author-assigned).
    pub target: String,
    /// Optional guard label, evaluated by decision nodes.
    pub guard: Option<String>,
}

/// Input parameter binding for a definition node.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcDefNodeParam {
    pub id: Uuid,
    pub proc_def_node_id: Uuid,
    pub param_id: String,
    pub name: String,
    pub bind_type: String,
    /// Literal for `constant` bindings.
    pub value: Option<String>,
    /// Context triple for `context` bindings.
    pub ctx_bind_node: Option<String>,
    pub ctx_bind_type: Option<String>,
    pub ctx_bind_name: Option<String>,
    /// Attribute path for `entity` bindings.
    pub entity_attr: Option<String>,
    pub required: bool,
}

/// A definition with everything the engine needs to interpret it.
#[derive(Debug, Clone)]
pub struct DefinitionBundle {
    pub def: ProcDef,
    pub nodes: Vec<ProcDefNode>,
    pub links: Vec<ProcDefLink>,
    pub params: Vec<ProcDefNodeParam>,
}

impl DefinitionBundle {
    pub fn node(&self, node_id: &str) -> Option<&ProcDefNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn params_for(&self, def_node: &ProcDefNode) -> Vec<&ProcDefNodeParam> {
        self.params
            .iter()
            .filter(|p| p.proc_def_node_id == def_node.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips() {
        for raw in [
            "start",
            "end",
            "auto",
            "data",
            "human",
            "decision",
            "foreach",
            "subprocess",
        ] {
            let parsed: NodeType = raw.parse().expect("should parse");
            assert_eq!(parsed.to_string(), raw);
        }
        assert!("gateway".parse::<NodeType>().is_err());
    }

    #[test]
    fn context_nodes_splits_comma_list() {
        let node = ProcDefNode {
            id: Uuid::now_v7(),
            proc_def_id: Uuid::now_v7(),
            node_id: "n3".into(),
            name: "deploy".into(),
            node_type: "auto".into(),
            service_name: Some("deploy:run".into()),
            routine_expression: None,
            dynamic_bind: false,
            bind_node_id: None,
            risk_check: false,
            timeout_seconds: 0,
            ordered_no: None,
            context_param_nodes: Some("n1,n2".into()),
        };
        assert_eq!(node.context_nodes(), vec!["n1", "n2"]);
    }
}
