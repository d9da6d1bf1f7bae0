//! In-memory implementation of `ProcessRepository`.
//!
//! Backs unit and scenario tests; mirrors the transactional semantics of the
//! Postgres store, including both CAS protocols, on plain mutex-guarded maps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use opsflow_models::{
    DataBindingRow, DefinitionBundle, InstanceDetail, InstanceNodeDetail, NewOperation,
    NodeStatus, OperationRow, OperationStatus, ProcDefStatus, ProcInstance, ProcInstanceNode,
    ProcInstanceStatus, WorkflowBundle, WorkflowLinkRow, WorkflowNodeRow, WorkflowRow,
    WorkflowStatus,
};

use crate::repository::{
    CallbackTarget, CreateInstanceRequest, CreatedInstance, ProcessRepository, StoreError,
};

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, DefinitionBundle>,
    instances: HashMap<Uuid, ProcInstance>,
    instance_nodes: HashMap<Uuid, ProcInstanceNode>,
    bindings: Vec<DataBindingRow>,
    workflows: HashMap<Uuid, WorkflowRow>,
    workflow_nodes: HashMap<Uuid, WorkflowNodeRow>,
    workflow_links: Vec<WorkflowLinkRow>,
    operations: BTreeMap<i64, OperationRow>,
    next_operation_id: i64,
    preview_rows: Vec<opsflow_models::PreviewRow>,
    graph_rows: Vec<opsflow_models::GraphNodeRow>,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a definition (tests author definitions directly).
    pub fn insert_definition(&self, bundle: DefinitionBundle) {
        let mut state = self.state.lock().unwrap();
        state.definitions.insert(bundle.def.id, bundle);
    }

    /// Test hook: raw workflow row access.
    pub fn workflow_row(&self, workflow_id: Uuid) -> Option<WorkflowRow> {
        self.state.lock().unwrap().workflows.get(&workflow_id).cloned()
    }

    /// Test hook: raw operation row access.
    pub fn operation_row(&self, operation_id: i64) -> Option<OperationRow> {
        self.state
            .lock()
            .unwrap()
            .operations
            .get(&operation_id)
            .cloned()
    }

    /// Test hook: status of a runtime node by author node id.
    pub fn node_status(&self, workflow_id: Uuid, node_id: &str) -> Option<NodeStatus> {
        let state = self.state.lock().unwrap();
        state
            .workflow_nodes
            .values()
            .find(|n| n.workflow_id == workflow_id && n.node_id == node_id)
            .and_then(|n| n.status.parse().ok())
    }

    fn append_operation_locked(state: &mut State, op: NewOperation) -> i64 {
        state.next_operation_id += 1;
        let id = state.next_operation_id;
        state.operations.insert(
            id,
            OperationRow {
                id,
                workflow_id: op.workflow_id,
                node_id: op.node_id,
                operation: op.operation.to_string(),
                message: op.message,
                status: OperationStatus::Wait.to_string(),
                handled_by: None,
                created_by: op.created_by,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
            },
        );
        id
    }
}

#[async_trait]
impl ProcessRepository for InMemoryRepository {
    async fn load_definition(&self, proc_def_id: Uuid) -> Result<DefinitionBundle, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .definitions
            .get(&proc_def_id)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(proc_def_id.to_string()))
    }

    async fn latest_deployed_definition(&self, key: &str) -> Result<DefinitionBundle, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .definitions
            .values()
            .filter(|b| b.def.key == key && b.def.status == ProcDefStatus::Deployed.to_string())
            .max_by(|a, b| a.def.version.cmp(&b.def.version))
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(key.to_string()))
    }

    async fn create_process_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<CreatedInstance, StoreError> {
        let mut state = self.state.lock().unwrap();
        let bundle = state
            .definitions
            .get(&req.proc_def_id)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(req.proc_def_id.to_string()))?;

        if bundle.def.status != ProcDefStatus::Deployed.to_string() {
            return Err(StoreError::Validation(format!(
                "definition {} is {}, not deployed",
                bundle.def.id, bundle.def.status
            )));
        }
        let start_count = bundle
            .nodes
            .iter()
            .filter(|n| n.node_type == "start")
            .count();
        if start_count != 1 {
            return Err(StoreError::Validation(format!(
                "definition {} has {} start nodes",
                bundle.def.id, start_count
            )));
        }
        for binding in &req.bindings {
            if !bundle.nodes.iter().any(|n| n.node_id == binding.node_id) {
                return Err(StoreError::Validation(format!(
                    "binding references unknown node {}",
                    binding.node_id
                )));
            }
        }

        let now = Utc::now();
        let proc_ins_id = Uuid::now_v7();
        let workflow_id = Uuid::now_v7();

        state.instances.insert(
            proc_ins_id,
            ProcInstance {
                id: proc_ins_id,
                proc_def_id: bundle.def.id,
                proc_def_name: bundle.def.name.clone(),
                entity_data_id: req.entity_data_id.clone(),
                entity_type_id: bundle.def.root_entity.clone(),
                entity_data_name: req.entity_data_name.clone(),
                status: ProcInstanceStatus::NotStarted.to_string(),
                operator: req.operator.clone(),
                created_at: now,
                updated_at: now,
            },
        );

        let mut work_nodes = Vec::with_capacity(bundle.nodes.len());
        let mut ins_node_ids: HashMap<String, Uuid> = HashMap::new();
        for def_node in &bundle.nodes {
            let ins_node_id = Uuid::now_v7();
            ins_node_ids.insert(def_node.node_id.clone(), ins_node_id);
            state.instance_nodes.insert(
                ins_node_id,
                ProcInstanceNode {
                    id: ins_node_id,
                    proc_ins_id,
                    proc_def_node_id: def_node.id,
                    node_id: def_node.node_id.clone(),
                    name: def_node.name.clone(),
                    node_type: def_node.node_type.clone(),
                    status: NodeStatus::NotStarted.to_string(),
                    request_id: None,
                    input: None,
                    output: None,
                    error_message: None,
                    risk_check_result: None,
                },
            );
            work_nodes.push(WorkflowNodeRow {
                id: Uuid::now_v7(),
                workflow_id,
                proc_ins_node_id: ins_node_id,
                node_id: def_node.node_id.clone(),
                name: def_node.name.clone(),
                node_type: def_node.node_type.clone(),
                status: NodeStatus::NotStarted.to_string(),
                input: None,
                output: None,
                error_message: None,
                timeout_seconds: def_node.timeout_seconds,
            });
        }

        for binding in &req.bindings {
            // Validated above; the map lookup cannot miss.
            let Some(ins_node_id) = ins_node_ids.get(&binding.node_id) else {
                continue;
            };
            state.bindings.push(DataBindingRow {
                id: Uuid::now_v7(),
                proc_ins_id,
                proc_ins_node_id: *ins_node_id,
                entity_data_id: binding.entity_data_id.clone(),
                entity_type_id: binding.entity_type_id.clone(),
                entity_data_name: binding.entity_data_name.clone(),
                full_data_id: binding.full_data_id.clone(),
            });
        }

        let work_links: Vec<WorkflowLinkRow> = bundle
            .links
            .iter()
            .map(|l| WorkflowLinkRow {
                id: Uuid::now_v7(),
                workflow_id,
                link_id: l.link_id.clone(),
                source: l.source.clone(),
                target: l.target.clone(),
                guard: l.guard.clone(),
            })
            .collect();

        let workflow = WorkflowRow {
            id: workflow_id,
            proc_ins_id,
            name: bundle.def.name.clone(),
            status: WorkflowStatus::Running.to_string(),
            host: req.host.clone(),
            sleep: false,
            stop: false,
            last_alive_at: now,
            error_message: None,
        };
        state.workflows.insert(workflow_id, workflow.clone());
        for node in &work_nodes {
            state.workflow_nodes.insert(node.id, node.clone());
        }
        state.workflow_links.extend(work_links.iter().cloned());

        let start_operation_id = Self::append_operation_locked(
            &mut state,
            NewOperation {
                workflow_id,
                node_id: None,
                operation: opsflow_models::OperationKind::Start,
                message: None,
                created_by: req.operator,
            },
        );

        Ok(CreatedInstance {
            proc_ins_id,
            bundle: WorkflowBundle {
                workflow,
                nodes: work_nodes,
                links: work_links,
            },
            start_operation_id,
        })
    }

    async fn get_instance_detail(&self, proc_ins_id: Uuid) -> Result<InstanceDetail, StoreError> {
        let state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get(&proc_ins_id)
            .ok_or(StoreError::InstanceNotFound(proc_ins_id))?;
        let mut nodes: Vec<InstanceNodeDetail> = state
            .instance_nodes
            .values()
            .filter(|n| n.proc_ins_id == proc_ins_id)
            .map(|n| InstanceNodeDetail {
                id: n.id,
                node_id: n.node_id.clone(),
                name: n.name.clone(),
                node_type: n.node_type.clone(),
                status: n.status.parse().unwrap_or(NodeStatus::NotStarted),
                error_message: n.error_message.clone(),
                risk_check_result: n.risk_check_result.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(InstanceDetail {
            id: instance.id,
            proc_def_id: instance.proc_def_id,
            proc_def_name: instance.proc_def_name.clone(),
            entity_data_id: instance.entity_data_id.clone(),
            entity_data_name: instance.entity_data_name.clone(),
            status: instance
                .status
                .parse()
                .unwrap_or(ProcInstanceStatus::NotStarted),
            operator: instance.operator.clone(),
            created_at: instance.created_at,
            nodes,
        })
    }

    async fn list_instances(&self) -> Result<Vec<ProcInstance>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<ProcInstance> = state.instances.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_instance_status(
        &self,
        proc_ins_id: Uuid,
        status: ProcInstanceStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get_mut(&proc_ins_id)
            .ok_or(StoreError::InstanceNotFound(proc_ins_id))?;
        instance.status = status.to_string();
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn load_workflow_bundle(&self, workflow_id: Uuid) -> Result<WorkflowBundle, StoreError> {
        let state = self.state.lock().unwrap();
        let workflow = state
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        let mut nodes: Vec<WorkflowNodeRow> = state
            .workflow_nodes
            .values()
            .filter(|n| n.workflow_id == workflow_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let links: Vec<WorkflowLinkRow> = state
            .workflow_links
            .iter()
            .filter(|l| l.workflow_id == workflow_id)
            .cloned()
            .collect();
        Ok(WorkflowBundle {
            workflow,
            nodes,
            links,
        })
    }

    async fn list_local_running_workflows(&self, host: &str) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workflows
            .values()
            .filter(|w| {
                w.host == host
                    && w.status == WorkflowStatus::Running.to_string()
                    && !w.stop
                    && !w.sleep
            })
            .map(|w| w.id)
            .collect())
    }

    async fn list_stale_workflows(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workflows
            .values()
            .filter(|w| {
                w.status == WorkflowStatus::Running.to_string()
                    && !w.sleep
                    && w.last_alive_at <= stale_before
            })
            .map(|w| w.id)
            .collect())
    }

    async fn claim_workflow(
        &self,
        workflow_id: Uuid,
        new_host: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
            return Ok(false);
        };
        if workflow.last_alive_at >= stale_before {
            return Ok(false);
        }
        workflow.host = new_host.to_string();
        workflow.last_alive_at = Utc::now();
        Ok(true)
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.status = status.to_string();
        workflow.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn set_workflow_sleep(&self, workflow_id: Uuid, sleep: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.sleep = sleep;
        Ok(())
    }

    async fn set_workflow_stop(&self, workflow_id: Uuid, stop: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.stop = stop;
        Ok(())
    }

    async fn heartbeat(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.last_alive_at = now;
        Ok(())
    }

    async fn update_node_status(
        &self,
        workflow_node_id: Uuid,
        status: NodeStatus,
        input: Option<serde_json::Value>,
        output: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let ins_node_id = {
            let node = state
                .workflow_nodes
                .get_mut(&workflow_node_id)
                .ok_or_else(|| StoreError::NodeNotFound(workflow_node_id.to_string()))?;
            node.status = status.to_string();
            if input.is_some() {
                node.input = input.clone();
            }
            if output.is_some() {
                node.output = output.clone();
            }
            node.error_message = error_message.map(str::to_string);
            node.proc_ins_node_id
        };
        if let Some(ins_node) = state.instance_nodes.get_mut(&ins_node_id) {
            ins_node.status = status.to_string();
            if input.is_some() {
                ins_node.input = input;
            }
            if output.is_some() {
                ins_node.output = output;
            }
            ins_node.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn update_node_request_id(
        &self,
        workflow_node_id: Uuid,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let ins_node_id = state
            .workflow_nodes
            .get(&workflow_node_id)
            .map(|n| n.proc_ins_node_id)
            .ok_or_else(|| StoreError::NodeNotFound(workflow_node_id.to_string()))?;
        if let Some(ins_node) = state.instance_nodes.get_mut(&ins_node_id) {
            ins_node.request_id = Some(request_id.to_string());
        }
        Ok(())
    }

    async fn update_node_risk_result(
        &self,
        workflow_node_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let ins_node_id = state
            .workflow_nodes
            .get(&workflow_node_id)
            .map(|n| n.proc_ins_node_id)
            .ok_or_else(|| StoreError::NodeNotFound(workflow_node_id.to_string()))?;
        if let Some(ins_node) = state.instance_nodes.get_mut(&ins_node_id) {
            ins_node.risk_check_result = Some(result);
        }
        Ok(())
    }

    async fn get_node_bindings(
        &self,
        proc_ins_node_id: Uuid,
    ) -> Result<Vec<DataBindingRow>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .bindings
            .iter()
            .filter(|b| b.proc_ins_node_id == proc_ins_node_id)
            .cloned()
            .collect())
    }

    async fn copy_dynamic_bindings(
        &self,
        proc_ins_id: Uuid,
        source_node_id: &str,
        target_ins_node_id: Uuid,
    ) -> Result<Vec<DataBindingRow>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let existing: Vec<DataBindingRow> = state
            .bindings
            .iter()
            .filter(|b| b.proc_ins_node_id == target_ins_node_id)
            .cloned()
            .collect();
        if !existing.is_empty() {
            return Ok(existing);
        }
        let source_ins_node_id = state
            .instance_nodes
            .values()
            .find(|n| n.proc_ins_id == proc_ins_id && n.node_id == source_node_id)
            .map(|n| n.id)
            .ok_or_else(|| StoreError::NodeNotFound(source_node_id.to_string()))?;
        let copies: Vec<DataBindingRow> = state
            .bindings
            .iter()
            .filter(|b| b.proc_ins_node_id == source_ins_node_id)
            .map(|b| DataBindingRow {
                id: Uuid::now_v7(),
                proc_ins_node_id: target_ins_node_id,
                ..b.clone()
            })
            .collect();
        state.bindings.extend(copies.iter().cloned());
        Ok(copies)
    }

    async fn append_operation(&self, op: NewOperation) -> Result<i64, StoreError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::append_operation_locked(&mut state, op))
    }

    async fn list_pending_operations(
        &self,
        workflow_ids: &[Uuid],
    ) -> Result<Vec<OperationRow>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .operations
            .values()
            .filter(|op| {
                op.status == OperationStatus::Wait.to_string()
                    && workflow_ids.contains(&op.workflow_id)
            })
            .cloned()
            .collect())
    }

    async fn claim_operation(&self, operation_id: i64, host: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(op) = state.operations.get_mut(&operation_id) else {
            return Ok(false);
        };
        if op.status != OperationStatus::Wait.to_string() {
            return Ok(false);
        }
        op.status = OperationStatus::Doing.to_string();
        op.handled_by = Some(host.to_string());
        op.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn finish_operation(&self, operation_id: i64, ok: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(op) = state.operations.get_mut(&operation_id) {
            op.status = if ok {
                OperationStatus::Done.to_string()
            } else {
                OperationStatus::Fail.to_string()
            };
            op.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn workflow_for_instance(
        &self,
        proc_ins_id: Uuid,
        proc_ins_node_id: Option<Uuid>,
    ) -> Result<(Uuid, Option<String>), StoreError> {
        let state = self.state.lock().unwrap();
        let workflow_id = state
            .workflows
            .values()
            .find(|w| w.proc_ins_id == proc_ins_id)
            .map(|w| w.id)
            .ok_or(StoreError::InstanceNotFound(proc_ins_id))?;
        let node_id = match proc_ins_node_id {
            Some(ins_node_id) => Some(
                state
                    .workflow_nodes
                    .values()
                    .find(|n| n.proc_ins_node_id == ins_node_id)
                    .map(|n| n.node_id.clone())
                    .ok_or_else(|| StoreError::NodeNotFound(ins_node_id.to_string()))?,
            ),
            None => None,
        };
        Ok((workflow_id, node_id))
    }

    async fn find_node_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<CallbackTarget, StoreError> {
        let state = self.state.lock().unwrap();
        let ins_node = state
            .instance_nodes
            .values()
            .find(|n| n.request_id.as_deref() == Some(request_id))
            .ok_or_else(|| StoreError::RequestNotFound(request_id.to_string()))?;
        let work_node = state
            .workflow_nodes
            .values()
            .find(|n| n.proc_ins_node_id == ins_node.id)
            .ok_or_else(|| StoreError::NodeNotFound(ins_node.node_id.clone()))?;
        Ok(CallbackTarget {
            workflow_id: work_node.workflow_id,
            node_id: work_node.node_id.clone(),
            is_completed: ins_node.status == NodeStatus::Completed.to_string(),
        })
    }

    async fn save_preview(
        &self,
        rows: Vec<opsflow_models::PreviewRow>,
        graph: Vec<opsflow_models::GraphNodeRow>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.preview_rows.extend(rows);
        state.graph_rows.extend(graph);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsflow_models::{OperationKind, ProcDef, ProcDefLink, ProcDefNode};

    fn definition() -> DefinitionBundle {
        let def_id = Uuid::now_v7();
        let node = |node_id: &str, node_type: &str| ProcDefNode {
            id: Uuid::now_v7(),
            proc_def_id: def_id,
            node_id: node_id.into(),
            name: node_id.into(),
            node_type: node_type.into(),
            service_name: None,
            routine_expression: None,
            dynamic_bind: false,
            bind_node_id: None,
            risk_check: false,
            timeout_seconds: 0,
            ordered_no: None,
            context_param_nodes: None,
        };
        DefinitionBundle {
            def: ProcDef {
                id: def_id,
                key: "k1".into(),
                name: "demo".into(),
                version: "v1".into(),
                root_entity: "cmdb:host".into(),
                status: "deployed".into(),
                created_by: "tester".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            nodes: vec![node("start", "start"), node("end", "end")],
            links: vec![ProcDefLink {
                id: Uuid::now_v7(),
                proc_def_id: def_id,
                link_id: "l1".into(),
                source: "start".into(),
                target: "end".into(),
                guard: None,
            }],
            params: vec![],
        }
    }

    fn request(def_id: Uuid) -> CreateInstanceRequest {
        CreateInstanceRequest {
            proc_def_id: def_id,
            entity_data_id: "h1".into(),
            entity_data_name: "host-1".into(),
            operator: "tester".into(),
            host: "10.0.0.1".into(),
            bindings: vec![],
        }
    }

    #[tokio::test]
    async fn create_instance_materializes_workflow_and_start_operation() {
        let repo = InMemoryRepository::new();
        let bundle = definition();
        let def_id = bundle.def.id;
        repo.insert_definition(bundle);

        let created = repo
            .create_process_instance(request(def_id))
            .await
            .expect("should create");

        assert_eq!(created.bundle.nodes.len(), 2);
        assert_eq!(created.bundle.links.len(), 1);
        assert_eq!(created.bundle.workflow.host, "10.0.0.1");

        let op = repo.operation_row(created.start_operation_id).unwrap();
        assert_eq!(op.operation, OperationKind::Start.to_string());
        assert_eq!(op.status, "wait");
    }

    #[tokio::test]
    async fn create_instance_rejects_draft_definition() {
        let repo = InMemoryRepository::new();
        let mut bundle = definition();
        bundle.def.status = "draft".into();
        let def_id = bundle.def.id;
        repo.insert_definition(bundle);

        let err = repo.create_process_instance(request(def_id)).await;
        assert!(matches!(err, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn operation_claim_is_exclusive() {
        let repo = InMemoryRepository::new();
        let bundle = definition();
        let def_id = bundle.def.id;
        repo.insert_definition(bundle);
        let created = repo.create_process_instance(request(def_id)).await.unwrap();
        let op_id = created.start_operation_id;

        assert!(repo.claim_operation(op_id, "w1").await.unwrap());
        assert!(!repo.claim_operation(op_id, "w2").await.unwrap());

        let row = repo.operation_row(op_id).unwrap();
        assert_eq!(row.status, "doing");
        assert_eq!(row.handled_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn workflow_claim_requires_stale_heartbeat() {
        let repo = InMemoryRepository::new();
        let bundle = definition();
        let def_id = bundle.def.id;
        repo.insert_definition(bundle);
        let created = repo.create_process_instance(request(def_id)).await.unwrap();
        let wf_id = created.bundle.workflow.id;

        // Fresh heartbeat: claim must lose.
        let stale_before = Utc::now() - chrono::Duration::seconds(30);
        assert!(!repo.claim_workflow(wf_id, "w2", stale_before).await.unwrap());

        // Age the heartbeat past the threshold: claim must win once.
        repo.heartbeat(wf_id, Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(repo.claim_workflow(wf_id, "w2", stale_before).await.unwrap());
        assert!(!repo.claim_workflow(wf_id, "w3", stale_before).await.unwrap());
        assert_eq!(repo.workflow_row(wf_id).unwrap().host, "w2");
    }
}
