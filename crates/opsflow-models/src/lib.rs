//! Shared domain types for the opsflow platform core.
//!
//! Everything that crosses a crate boundary lives here: process definitions,
//! process instances, the runtime workflow rows, the durable operation queue
//! rows, the preview read-model and the plugin invocation envelope.

pub mod config;
pub mod instance;
pub mod plugin;
pub mod preview;
pub mod process;
pub mod runtime;

pub use config::EngineConfig;
pub use instance::{
    DataBindingRow, InstanceDetail, InstanceNodeDetail, NodeStatus, ProcInstance,
    ProcInstanceNode, ProcInstanceStatus,
};
pub use plugin::{
    EntityInstanceRef, InputParamData, PluginInvocation, PluginResult, RiskCheckFinding,
};
pub use preview::{GraphNodeRow, PreviewData, PreviewEntityNode, PreviewRow};
pub use process::{
    DefinitionBundle, NodeType, ParamBindType, ProcDef, ProcDefLink, ProcDefNode,
    ProcDefNodeParam, ProcDefStatus,
};
pub use runtime::{
    NewOperation, OperationKind, OperationRow, OperationStatus, WorkflowBundle, WorkflowLinkRow,
    WorkflowNodeRow, WorkflowRow, WorkflowStatus,
};

/// Error returned when a persisted status string does not match any variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}
