//! Process instance types: one execution of a definition against a root
//! entity, plus its per-node rows and data bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::ParseStatusError;

/// Status of a process instance as surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ProcInstanceStatus {
    NotStarted,
    InProgress,
    InternallyTerminated,
    Completed,
    Faulted,
}

impl std::fmt::Display for ProcInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::InProgress => write!(f, "InProgress"),
            Self::InternallyTerminated => write!(f, "InternallyTerminated"),
            Self::Completed => write!(f, "Completed"),
            Self::Faulted => write!(f, "Faulted"),
        }
    }
}

impl std::str::FromStr for ProcInstanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(Self::NotStarted),
            "InProgress" => Ok(Self::InProgress),
            "InternallyTerminated" => Ok(Self::InternallyTerminated),
            "Completed" => Ok(Self::Completed),
            "Faulted" => Ok(Self::Faulted),
            other => Err(ParseStatusError {
                kind: "instance status",
                value: other.to_string(),
            }),
        }
    }
}

/// Status machine of one instance node (and of its runtime twin).
///
/// `Waiting` covers human tasks, risk holds and asynchronous plugin calls;
/// all three resume through an `approve` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    NotStarted,
    Running,
    Completed,
    Faulted,
    Skipped,
    Timeouted,
    Waiting,
}

impl NodeStatus {
    /// Terminal states that let successors fire.
    pub fn is_succeeded(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// States from which no task is in flight.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Running | Self::Waiting)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "notStarted"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Faulted => write!(f, "faulted"),
            Self::Skipped => write!(f, "skipped"),
            Self::Timeouted => write!(f, "timeouted"),
            Self::Waiting => write!(f, "waiting"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notStarted" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "faulted" => Ok(Self::Faulted),
            "skipped" => Ok(Self::Skipped),
            "timeouted" => Ok(Self::Timeouted),
            "waiting" => Ok(Self::Waiting),
            other => Err(ParseStatusError {
                kind: "node status",
                value: other.to_string(),
            }),
        }
    }
}

/// One execution of a process definition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcInstance {
    pub id: Uuid,
    pub proc_def_id: Uuid,
    pub proc_def_name: String,
    /// Data id of the root entity this instance operates on.
    pub entity_data_id: String,
    pub entity_type_id: String,
    /// Display name of the root entity at start time.
    pub entity_data_name: String,
    pub status: String,
    pub operator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One concrete execution of a definition node inside an instance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcInstanceNode {
    pub id: Uuid,
    pub proc_ins_id: Uuid,
    pub proc_def_node_id: Uuid,
    /// Author-assigned node id, copied from the definition.
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub status: String,
    /// Request id of the last plugin dispatch, if any.
    pub request_id: Option<String>,
    /// Raw plugin input, retained for diagnostics.
    pub input: Option<serde_json::Value>,
    /// Raw plugin output, retained for diagnostics.
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Risk-assessment findings that put the node on hold, if any.
    pub risk_check_result: Option<serde_json::Value>,
}

/// Association between an instance node and one entity instance it operates
/// on. Static bindings are written at instance start; dynamic ones are
/// copied from the producing node when the consumer runs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DataBindingRow {
    pub id: Uuid,
    pub proc_ins_id: Uuid,
    /// Instance-node id the binding belongs to.
    pub proc_ins_node_id: Uuid,
    pub entity_data_id: String,
    pub entity_type_id: String,
    pub entity_data_name: String,
    /// Composite root→node id path.
    pub full_data_id: String,
}

/// Instance detail returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstanceDetail {
    pub id: Uuid,
    pub proc_def_id: Uuid,
    pub proc_def_name: String,
    pub entity_data_id: String,
    pub entity_data_name: String,
    pub status: ProcInstanceStatus,
    pub operator: String,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<InstanceNodeDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstanceNodeDetail {
    pub id: Uuid,
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub error_message: Option<String>,
    pub risk_check_result: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_wire_names_are_camel_case() {
        assert_eq!(NodeStatus::NotStarted.to_string(), "notStarted");
        assert_eq!(NodeStatus::Timeouted.to_string(), "timeouted");
        assert_eq!(
            serde_json::to_string(&NodeStatus::NotStarted).unwrap(),
            "\"notStarted\""
        );
    }

    #[test]
    fn succeeded_and_settled_partitions() {
        assert!(NodeStatus::Completed.is_succeeded());
        assert!(NodeStatus::Skipped.is_succeeded());
        assert!(!NodeStatus::Faulted.is_succeeded());
        assert!(!NodeStatus::Running.is_settled());
        assert!(!NodeStatus::Waiting.is_settled());
        assert!(NodeStatus::Faulted.is_settled());
    }
}
