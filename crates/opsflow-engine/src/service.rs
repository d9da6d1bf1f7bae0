//! Engine façade consumed by the HTTP surface.
//!
//! Starting an instance, routing operator commands, handling plugin
//! callbacks and building previews all enter the engine here. Every
//! operator command traverses the durable operation queue even when the
//! target workflow lives on this worker; the local dispatch below is only
//! the claim-and-deliver fast path the scanner would otherwise take.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use opsflow_models::{
    DefinitionBundle, EngineConfig, InstanceDetail, NewOperation, OperationKind, PreviewData,
    ProcInstance,
};
use opsflow_storage::{CreateInstanceRequest, NewBinding, ProcessRepository};

use crate::invoker::{CorrelationIndex, PluginInvoker};
use crate::registry::WorkflowRegistry;
use crate::resolver::{EntityFilter, EntityResolver};
use crate::workflow::{self, LoopMsg, WorkflowCommand};
use crate::EngineError;

/// Shared engine dependencies: the repository, the two collaborators, the
/// callback correlation index, the live-workflow registry and the worker
/// configuration.
pub struct EngineDeps {
    pub repo: Arc<dyn ProcessRepository>,
    pub invoker: Arc<dyn PluginInvoker>,
    pub resolver: Arc<dyn EntityResolver>,
    pub correlation: CorrelationIndex,
    pub registry: WorkflowRegistry,
    pub config: EngineConfig,
}

/// Operation payload accepted from the HTTP surface.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub proc_ins_id: Uuid,
    pub node_ins_id: Option<Uuid>,
    pub act: String,
    pub operator: String,
}

/// Engine façade.
#[derive(Clone)]
pub struct ProcessService {
    deps: Arc<EngineDeps>,
}

impl ProcessService {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &Arc<EngineDeps> {
        &self.deps
    }

    /// Create and start a process instance, returning its detail.
    #[instrument(skip(self))]
    pub async fn start_instance(
        &self,
        proc_def_id: Uuid,
        entity_data_id: &str,
        operator: &str,
    ) -> Result<InstanceDetail, EngineError> {
        let (proc_ins_id, _workflow_id) =
            start_instance_of(&self.deps, proc_def_id, entity_data_id, operator).await?;
        Ok(self.deps.repo.get_instance_detail(proc_ins_id).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<ProcInstance>, EngineError> {
        Ok(self.deps.repo.list_instances().await?)
    }

    pub async fn instance_detail(&self, proc_ins_id: Uuid) -> Result<InstanceDetail, EngineError> {
        Ok(self.deps.repo.get_instance_detail(proc_ins_id).await?)
    }

    /// Append an operator command to the durable queue and attempt the
    /// local fast-path dispatch. Returns the operation id.
    #[instrument(skip(self, req), fields(proc_ins_id = %req.proc_ins_id, act = %req.act))]
    pub async fn submit_operation(&self, req: OperationRequest) -> Result<i64, EngineError> {
        let kind = match req.act.as_str() {
            "retry" => OperationKind::Retry,
            // The HTTP surface says `skip`; the engine calls it ignore.
            "skip" => OperationKind::Ignore,
            "kill" => OperationKind::Kill,
            "approve" => OperationKind::Approve,
            "stop" => OperationKind::Stop,
            "continue" => OperationKind::Continue,
            other => {
                return Err(EngineError::Validation(format!(
                    "unknown operation act `{}`",
                    other
                )))
            }
        };
        if matches!(
            kind,
            OperationKind::Retry | OperationKind::Ignore | OperationKind::Approve
        ) && req.node_ins_id.is_none()
        {
            return Err(EngineError::Validation(format!(
                "`{}` requires a target node",
                kind
            )));
        }

        let (workflow_id, node_id) = self
            .deps
            .repo
            .workflow_for_instance(req.proc_ins_id, req.node_ins_id)
            .await?;

        let op_id = self
            .deps
            .repo
            .append_operation(NewOperation {
                workflow_id,
                node_id: node_id.clone(),
                operation: kind,
                message: None,
                created_by: req.operator,
            })
            .await?;

        let command = command_for(kind, node_id, None);
        let deps = Arc::clone(&self.deps);
        tokio::spawn(async move {
            dispatch(&deps, op_id, workflow_id, command).await;
        });

        Ok(op_id)
    }

    /// Plugin callback: look up the waiting node by request id and enqueue
    /// an approve operation carrying the callback payload. The callback
    /// path never touches workflow memory directly.
    #[instrument(skip(self, body))]
    pub async fn handle_callback(&self, body: Value) -> Result<i64, EngineError> {
        let request_id = body
            .get("results")
            .and_then(|r| r.get("requestId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Validation("callback body carries no results.requestId".to_string())
            })?;

        // Fast path through the in-memory index; the durable column is the
        // fallback after restart or takeover.
        let (workflow_id, node_id) = match self.deps.correlation.lookup(request_id) {
            Some(found) => found,
            None => {
                let target = self.deps.repo.find_node_by_request_id(request_id).await?;
                if target.is_completed {
                    return Err(EngineError::Validation(format!(
                        "request {} already completed",
                        request_id
                    )));
                }
                (target.workflow_id, target.node_id)
            }
        };

        let message = body.to_string();
        let op_id = self
            .deps
            .repo
            .append_operation(NewOperation {
                workflow_id,
                node_id: Some(node_id.clone()),
                operation: OperationKind::Approve,
                message: Some(message.clone()),
                created_by: "pluginCallback".to_string(),
            })
            .await?;

        let command = WorkflowCommand::ApproveNode {
            node_id,
            message: Some(message),
        };
        let deps = Arc::clone(&self.deps);
        tokio::spawn(async move {
            dispatch(&deps, op_id, workflow_id, command).await;
        });

        Ok(op_id)
    }

    /// Build and persist the preview graph for a definition and root
    /// entity.
    pub async fn build_preview(
        &self,
        proc_def_id: Uuid,
        entity_data_id: &str,
        operator: &str,
    ) -> Result<PreviewData, EngineError> {
        crate::preview::build_preview(&self.deps, proc_def_id, entity_data_id, operator, true)
            .await
    }

    /// Start-event endpoint behavior: compute and persist the preview for
    /// the latest deployed definition of the key, then return without
    /// starting an instance.
    pub async fn preview_start_event(
        &self,
        operation_key: &str,
        entity_data_id: &str,
        operator: &str,
    ) -> Result<PreviewData, EngineError> {
        let definition = self
            .deps
            .repo
            .latest_deployed_definition(operation_key)
            .await?;
        crate::preview::build_preview(&self.deps, definition.def.id, entity_data_id, operator, true)
            .await
    }
}

fn command_for(kind: OperationKind, node_id: Option<String>, message: Option<String>) -> WorkflowCommand {
    match kind {
        OperationKind::Start => WorkflowCommand::Start,
        OperationKind::Kill => WorkflowCommand::Kill,
        OperationKind::Stop => WorkflowCommand::Stop,
        OperationKind::Continue => WorkflowCommand::Continue,
        OperationKind::Retry => WorkflowCommand::RetryNode(node_id.unwrap_or_default()),
        OperationKind::Ignore => WorkflowCommand::IgnoreNode(node_id.unwrap_or_default()),
        OperationKind::Approve => WorkflowCommand::ApproveNode {
            node_id: node_id.unwrap_or_default(),
            message,
        },
    }
}

/// Claim the operation and deliver it to the local workflow loop. Returns
/// `false` when the workflow is not hosted here or another worker won the
/// claim. Both are silent, expected outcomes.
pub(crate) async fn dispatch(
    deps: &Arc<EngineDeps>,
    op_id: i64,
    workflow_id: Uuid,
    command: WorkflowCommand,
) -> bool {
    let Some(handle) = deps.registry.get(workflow_id) else {
        return false;
    };
    match deps.repo.claim_operation(op_id, &deps.config.host_ip).await {
        Ok(true) => handle.send(LoopMsg::Command { op_id, command }).await,
        Ok(false) => {
            // Lost the race: another worker is handling it.
            false
        }
        Err(e) => {
            warn!(op_id, "operation claim failed: {}", e);
            false
        }
    }
}

/// Create and launch one instance: resolve static bindings, write the
/// atomic instance/workflow bundle, spawn the interpreter and dispatch the
/// implicit start operation.
pub async fn start_instance_of(
    deps: &Arc<EngineDeps>,
    proc_def_id: Uuid,
    entity_data_id: &str,
    operator: &str,
) -> Result<(Uuid, Uuid), EngineError> {
    let definition = deps.repo.load_definition(proc_def_id).await?;
    let (bindings, root_display_name) =
        resolve_static_bindings(deps, &definition, entity_data_id).await?;

    let created = deps
        .repo
        .create_process_instance(CreateInstanceRequest {
            proc_def_id,
            entity_data_id: entity_data_id.to_string(),
            entity_data_name: root_display_name,
            operator: operator.to_string(),
            host: deps.config.host_ip.clone(),
            bindings,
        })
        .await?;

    let proc_ins_id = created.proc_ins_id;
    let workflow_id = created.bundle.workflow.id;
    let start_op_id = created.start_operation_id;

    let handle = workflow::launch(
        Arc::clone(deps),
        created.bundle,
        definition,
        entity_data_id.to_string(),
        operator.to_string(),
    );

    if deps
        .repo
        .claim_operation(start_op_id, &deps.config.host_ip)
        .await?
    {
        handle
            .send(LoopMsg::Command {
                op_id: start_op_id,
                command: WorkflowCommand::Start,
            })
            .await;
    }

    info!(%proc_ins_id, %workflow_id, "process instance started");
    Ok((proc_ins_id, workflow_id))
}

/// Resolve the static bindings written at instance start: every
/// statically bound task node with a routine expression gets the entities
/// its expression reaches from the root. Returns the bindings plus the
/// root entity's display name.
async fn resolve_static_bindings(
    deps: &Arc<EngineDeps>,
    definition: &DefinitionBundle,
    entity_data_id: &str,
) -> Result<(Vec<NewBinding>, String), EngineError> {
    let root_filter = EntityFilter::id_eq(entity_data_id);
    let mut bindings = Vec::new();
    let mut root_display_name = entity_data_id.to_string();

    for def_node in &definition.nodes {
        if def_node.dynamic_bind {
            continue;
        }
        let Some(routine) = def_node.routine_expression.as_deref().filter(|r| !r.is_empty())
        else {
            continue;
        };
        if !matches!(
            def_node.node_type.as_str(),
            "auto" | "foreach" | "human" | "subprocess"
        ) {
            continue;
        }

        let hops = deps.resolver.analyze(routine).await?;
        let nodes = deps.resolver.query(&hops, Some(&root_filter)).await?;
        for entity in nodes.iter().filter(|n| n.last_flag) {
            bindings.push(NewBinding {
                node_id: def_node.node_id.clone(),
                entity_data_id: entity.data_id.clone(),
                entity_type_id: format!("{}:{}", entity.package_name, entity.entity_name),
                entity_data_name: entity.display_name.clone(),
                full_data_id: entity.full_data_id.clone(),
            });
        }
        if let Some(root) = nodes.iter().find(|n| n.data_id == entity_data_id) {
            root_display_name = root.display_name.clone();
        }
    }

    Ok((bindings, root_display_name))
}
