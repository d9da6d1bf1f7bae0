//! `ProcessRepository` trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use opsflow_models::{
    DataBindingRow, DefinitionBundle, InstanceDetail, NewOperation, NodeStatus, OperationRow,
    ProcInstance, ProcInstanceStatus, WorkflowBundle, WorkflowStatus,
};

/// Error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition missing or not in a startable state.
    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow node not found: {0}")]
    NodeNotFound(String),

    /// No node is waiting on the given plugin request id.
    #[error("no node waiting on request: {0}")]
    RequestNotFound(String),

    /// Malformed request or impossible state transition. Never retried.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Transient database error; callers may retry within their budget.
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Static binding to write at instance start, keyed by author node id.
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub node_id: String,
    pub entity_data_id: String,
    pub entity_type_id: String,
    pub entity_data_name: String,
    pub full_data_id: String,
}

/// Input to `create_process_instance`. Entity resolution has already
/// happened; this is the atomic-write shape.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub proc_def_id: Uuid,
    pub entity_data_id: String,
    /// Display name of the root entity, surfaced on the instance views.
    pub entity_data_name: String,
    pub operator: String,
    /// Worker that will own the freshly created workflow.
    pub host: String,
    pub bindings: Vec<NewBinding>,
}

/// Result of instance creation: the new instance id plus the hydrated
/// workflow bundle the engine runs.
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    pub proc_ins_id: Uuid,
    pub bundle: WorkflowBundle,
    /// Id of the implicit `start` operation enqueued with the instance.
    pub start_operation_id: i64,
}

/// Where a plugin callback should be routed.
#[derive(Debug, Clone)]
pub struct CallbackTarget {
    pub workflow_id: Uuid,
    pub node_id: String,
    pub is_completed: bool,
}

/// Logical persistence interface over the relational store.
///
/// All multi-row mutations are transactional. The two contested writes
/// (workflow takeover, operation claim) are conditional updates returning
/// `false` on a lost race. Implementations must be safe for concurrent use
/// and idempotent wherever a caller may retry.
#[async_trait]
pub trait ProcessRepository: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Load a definition with its nodes, links and params.
    async fn load_definition(&self, proc_def_id: Uuid) -> Result<DefinitionBundle, StoreError>;

    /// Latest deployed version for a definition key.
    async fn latest_deployed_definition(&self, key: &str) -> Result<DefinitionBundle, StoreError>;

    // =========================================================================
    // Instance lifecycle
    // =========================================================================

    /// Atomically create the instance, its nodes, static bindings, the
    /// workflow twin with its node/link rows, and the implicit `start`
    /// operation. Validation failures happen before any write.
    async fn create_process_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<CreatedInstance, StoreError>;

    async fn get_instance_detail(&self, proc_ins_id: Uuid) -> Result<InstanceDetail, StoreError>;

    async fn list_instances(&self) -> Result<Vec<ProcInstance>, StoreError>;

    async fn update_instance_status(
        &self,
        proc_ins_id: Uuid,
        status: ProcInstanceStatus,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Workflow runtime
    // =========================================================================

    async fn load_workflow_bundle(&self, workflow_id: Uuid) -> Result<WorkflowBundle, StoreError>;

    /// Workflows owned by `host` with status `running`, stop=0, sleep=0.
    /// Startup recovery rehydrates exactly this set.
    async fn list_local_running_workflows(&self, host: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Running, non-sleeping workflows whose heartbeat is older than
    /// `stale_before`: the takeover candidates.
    async fn list_stale_workflows(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Takeover CAS: set host and refresh the heartbeat, gated on the
    /// heartbeat still being older than `stale_before`.
    async fn claim_workflow(
        &self,
        workflow_id: Uuid,
        new_host: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn set_workflow_sleep(&self, workflow_id: Uuid, sleep: bool) -> Result<(), StoreError>;

    async fn set_workflow_stop(&self, workflow_id: Uuid, stop: bool) -> Result<(), StoreError>;

    async fn heartbeat(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Checkpoint one node transition into the runtime row and its instance
    /// twin in a single transaction. The engine treats a transition as
    /// observable only after this returns.
    async fn update_node_status(
        &self,
        workflow_node_id: Uuid,
        status: NodeStatus,
        input: Option<serde_json::Value>,
        output: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn update_node_request_id(
        &self,
        workflow_node_id: Uuid,
        request_id: &str,
    ) -> Result<(), StoreError>;

    async fn update_node_risk_result(
        &self,
        workflow_node_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Data bindings
    // =========================================================================

    async fn get_node_bindings(
        &self,
        proc_ins_node_id: Uuid,
    ) -> Result<Vec<DataBindingRow>, StoreError>;

    /// Copy the producing node's bindings onto a dynamically bound consumer,
    /// returning the copies. Idempotent: an existing copy set is returned
    /// as-is.
    async fn copy_dynamic_bindings(
        &self,
        proc_ins_id: Uuid,
        source_node_id: &str,
        target_ins_node_id: Uuid,
    ) -> Result<Vec<DataBindingRow>, StoreError>;

    // =========================================================================
    // Operation queue
    // =========================================================================

    /// Append a command; returns its monotonic id.
    async fn append_operation(&self, op: NewOperation) -> Result<i64, StoreError>;

    /// Pending (`wait`) operations targeting any of the given workflows, in
    /// id order.
    async fn list_pending_operations(
        &self,
        workflow_ids: &[Uuid],
    ) -> Result<Vec<OperationRow>, StoreError>;

    /// Claim CAS: `wait → doing` gated by id and current status. Exactly one
    /// caller wins; a lost race returns `false`.
    async fn claim_operation(&self, operation_id: i64, host: &str) -> Result<bool, StoreError>;

    /// Terminal update: `done` or `fail` with end time.
    async fn finish_operation(&self, operation_id: i64, ok: bool) -> Result<(), StoreError>;

    // =========================================================================
    // Routing
    // =========================================================================

    /// Resolve an instance (and optional instance node) to the workflow id
    /// and runtime node id an operation should target.
    async fn workflow_for_instance(
        &self,
        proc_ins_id: Uuid,
        proc_ins_node_id: Option<Uuid>,
    ) -> Result<(Uuid, Option<String>), StoreError>;

    /// Find the node waiting on a plugin request id (callback routing).
    async fn find_node_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<CallbackTarget, StoreError>;

    // =========================================================================
    // Preview read-model
    // =========================================================================

    async fn save_preview(
        &self,
        rows: Vec<opsflow_models::PreviewRow>,
        graph: Vec<opsflow_models::GraphNodeRow>,
    ) -> Result<(), StoreError>;
}
