//! Startup recovery and takeover rehydration.
//!
//! A rehydrated workflow keeps every node already in a terminal state;
//! nodes caught mid-flight are failed with an explanatory error; the
//! plugin callback path may still converge through its pending operation.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use opsflow_models::{NewOperation, NodeStatus, OperationKind, WorkflowStatus};

use crate::service::EngineDeps;
use crate::workflow::{self, LoopMsg, WorkflowCommand};
use crate::EngineError;

const RECOVERY_OPERATOR: &str = "systemRecover";

/// Boot-time recovery: rehydrate every workflow this host still owns with
/// status running, stop=0, sleep=0. Returns how many were brought back.
#[instrument(skip(deps))]
pub async fn recover_local_workflows(deps: &Arc<EngineDeps>) -> Result<usize, EngineError> {
    let workflow_ids = deps
        .repo
        .list_local_running_workflows(&deps.config.host_ip)
        .await?;
    let mut recovered = 0;
    for workflow_id in &workflow_ids {
        match recover_workflow(deps, *workflow_id).await {
            Ok(()) => recovered += 1,
            Err(e) => warn!(%workflow_id, "boot recovery failed: {}", e),
        }
    }
    info!(recovered, total = workflow_ids.len(), "boot recovery finished");
    Ok(recovered)
}

/// Rehydrate one workflow: reload its rows, fail the in-flight nodes,
/// rebuild the in-memory DAG and re-enter the event loop through a
/// self-enqueued start operation.
#[instrument(skip(deps))]
pub async fn recover_workflow(
    deps: &Arc<EngineDeps>,
    workflow_id: Uuid,
) -> Result<(), EngineError> {
    let bundle = deps.repo.load_workflow_bundle(workflow_id).await?;
    let status: WorkflowStatus = bundle
        .workflow
        .status
        .parse()
        .map_err(|e: opsflow_models::ParseStatusError| EngineError::Internal(e.to_string()))?;
    if status != WorkflowStatus::Running {
        return Err(EngineError::Validation(format!(
            "workflow {} is {}, not recoverable",
            workflow_id, status
        )));
    }

    // Nodes caught running are failed-in-flight; terminal nodes stay as
    // they are. Waiting nodes keep waiting; their operations still route.
    let mut bundle = bundle;
    for node in bundle.nodes.iter_mut() {
        if node.status == NodeStatus::Running.to_string() {
            deps.repo
                .update_node_status(
                    node.id,
                    NodeStatus::Faulted,
                    None,
                    None,
                    Some("worker restarted while node was in flight"),
                )
                .await?;
            node.status = NodeStatus::Faulted.to_string();
            node.error_message =
                Some("worker restarted while node was in flight".to_string());
        }
    }

    let instance = deps
        .repo
        .get_instance_detail(bundle.workflow.proc_ins_id)
        .await?;
    let definition = deps.repo.load_definition(instance.proc_def_id).await?;

    let proc_ins_id = bundle.workflow.proc_ins_id;
    let handle = workflow::launch(
        Arc::clone(deps),
        bundle,
        definition,
        instance.entity_data_id,
        RECOVERY_OPERATOR.to_string(),
    );

    // Resume through the durable queue like every other command.
    let op_id = deps
        .repo
        .append_operation(NewOperation {
            workflow_id,
            node_id: None,
            operation: OperationKind::Start,
            message: None,
            created_by: RECOVERY_OPERATOR.to_string(),
        })
        .await?;
    if deps
        .repo
        .claim_operation(op_id, &deps.config.host_ip)
        .await?
    {
        handle
            .send(LoopMsg::Command {
                op_id,
                command: WorkflowCommand::Start,
            })
            .await;
    }

    info!(%workflow_id, %proc_ins_id, "workflow rehydrated");
    Ok(())
}
