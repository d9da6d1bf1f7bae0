//! Runtime twin rows: the workflow, its materialized DAG and the durable
//! operation queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParseStatusError;

/// Status of the runtime workflow row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    /// A repository or invariant failure needs human attention.
    Problem,
    Completed,
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Problem => write!(f, "problem"),
            Self::Completed => write!(f, "completed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "problem" => Ok(Self::Problem),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            other => Err(ParseStatusError {
                kind: "workflow status",
                value: other.to_string(),
            }),
        }
    }
}

/// The runtime twin of a process instance while it executes.
///
/// `host` names the worker that currently owns the workflow; ownership only
/// ever changes through the takeover CAS. `last_alive_at` is the heartbeat
/// the takeover scanner inspects.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub proc_ins_id: Uuid,
    pub name: String,
    pub status: String,
    pub host: String,
    pub sleep: bool,
    pub stop: bool,
    pub last_alive_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Execution-time node row, materialized from the definition node plus the
/// runtime-resolved bindings. Its status machine is independent of the
/// definition node.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowNodeRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// The instance node this runtime node checkpoints into.
    pub proc_ins_node_id: Uuid,
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub status: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub timeout_seconds: i32,
}

/// Execution-time edge row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowLinkRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub link_id: String,
    pub source: String,
    pub target: String,
    pub guard: Option<String>,
}

/// Everything needed to (re)hydrate one workflow in memory.
#[derive(Debug, Clone)]
pub struct WorkflowBundle {
    pub workflow: WorkflowRow,
    pub nodes: Vec<WorkflowNodeRow>,
    pub links: Vec<WorkflowLinkRow>,
}

/// Operator command kinds. All commands traverse the durable queue, even
/// when produced by the worker that will consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Engine-enqueued initial command for a freshly created workflow.
    Start,
    Kill,
    Retry,
    Ignore,
    Approve,
    Stop,
    Continue,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Kill => write!(f, "kill"),
            Self::Retry => write!(f, "retry"),
            Self::Ignore => write!(f, "ignore"),
            Self::Approve => write!(f, "approve"),
            Self::Stop => write!(f, "stop"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "kill" => Ok(Self::Kill),
            "retry" => Ok(Self::Retry),
            "ignore" => Ok(Self::Ignore),
            "approve" => Ok(Self::Approve),
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            other => Err(ParseStatusError {
                kind: "operation",
                value: other.to_string(),
            }),
        }
    }
}

/// Queue status of an operation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Wait,
    Doing,
    Done,
    Fail,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Doing => write!(f, "doing"),
            Self::Done => write!(f, "done"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// A durable command row. Ids are monotonic; operations for the same
/// workflow are consumed in id order.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OperationRow {
    pub id: i64,
    pub workflow_id: Uuid,
    /// Runtime node id the command targets, when node-scoped.
    pub node_id: Option<String>,
    pub operation: String,
    /// Free-form payload: approve continuation tokens, callback bodies.
    pub message: Option<String>,
    pub status: String,
    pub handled_by: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl OperationRow {
    pub fn kind(&self) -> Result<OperationKind, ParseStatusError> {
        self.operation.parse()
    }
}

/// Insert shape for a new operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub workflow_id: Uuid,
    pub node_id: Option<String>,
    pub operation: OperationKind,
    pub message: Option<String>,
    pub created_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kind_round_trips() {
        for raw in ["start", "kill", "retry", "ignore", "approve", "stop", "continue"] {
            let parsed: OperationKind = raw.parse().expect("should parse");
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn workflow_terminal_states() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Terminated.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Problem.is_terminal());
    }
}
