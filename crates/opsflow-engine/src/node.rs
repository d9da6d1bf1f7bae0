//! Node runtime: executes a single workflow node and emits a terminal
//! status.
//!
//! ```text
//! notStarted ──claim──▶ running ──ok──▶ completed
//!                        │
//!                        ├──err──▶ faulted
//!                        ├──risk──▶ waiting ──approve──▶ running
//!                        ├──timeout──▶ timeouted
//!                        └──ignore──▶ skipped
//! ```
//!
//! Errors never escape this module: every failure becomes a node status the
//! interpreter acts on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use opsflow_models::{
    EntityInstanceRef, NodeStatus, NodeType, PluginInvocation, ProcDefNode, ProcDefNodeParam,
    WorkflowNodeRow, WorkflowStatus,
};

use crate::invoker::{self, ExecOutcome, InvokeError, PluginCall};
use crate::resolver::EntityFilter;
use crate::service::{self, EngineDeps};

/// Everything a node task needs, snapshotted by the event loop at spawn
/// time so the task never touches workflow memory.
pub struct NodeContext {
    pub workflow_id: uuid::Uuid,
    pub proc_ins_id: uuid::Uuid,
    pub node: WorkflowNodeRow,
    pub def_node: Option<ProcDefNode>,
    pub params: Vec<ProcDefNodeParam>,
    /// Outputs of the declared context nodes (or direct predecessors).
    pub upstream_outputs: HashMap<String, Value>,
    /// Root entity data id of the owning instance.
    pub root_data_id: String,
    pub operator: String,
    /// Approval payload when resuming a waiting node.
    pub resume: Option<String>,
}

/// Terminal result of one node execution.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub risk_result: Option<Value>,
}

impl NodeOutcome {
    pub fn completed(output: Option<Value>) -> Self {
        Self {
            status: NodeStatus::Completed,
            output,
            error_message: None,
            risk_result: None,
        }
    }

    pub fn faulted(message: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Faulted,
            output: None,
            error_message: Some(message.into()),
            risk_result: None,
        }
    }

    pub fn waiting() -> Self {
        Self {
            status: NodeStatus::Waiting,
            output: None,
            error_message: None,
            risk_result: None,
        }
    }

    pub fn timeouted(partial_output: Option<Value>) -> Self {
        Self {
            status: NodeStatus::Timeouted,
            output: partial_output,
            error_message: Some("node execution exceeded its timeout".to_string()),
            risk_result: None,
        }
    }
}

/// Execute one node to a terminal (or waiting) status.
pub async fn execute(deps: Arc<EngineDeps>, ctx: NodeContext) -> NodeOutcome {
    let node_type: NodeType = match ctx.node.node_type.parse() {
        Ok(t) => t,
        Err(e) => return NodeOutcome::faulted(e.to_string()),
    };

    match node_type {
        NodeType::Start | NodeType::End => NodeOutcome::completed(None),
        NodeType::Auto => run_service_node(&deps, &ctx, false).await,
        NodeType::Foreach => run_service_node(&deps, &ctx, true).await,
        NodeType::Data => run_data_node(&deps, &ctx).await,
        NodeType::Human => run_human_node(&ctx),
        NodeType::Decision => run_decision_node(&ctx),
        NodeType::Subprocess => run_subprocess_node(&deps, &ctx).await,
    }
}

/// Human tasks park in `waiting` until an approve operation supplies the
/// completion payload.
fn run_human_node(ctx: &NodeContext) -> NodeOutcome {
    match &ctx.resume {
        None => NodeOutcome::waiting(),
        Some(message) if message.is_empty() => NodeOutcome::completed(None),
        Some(message) => {
            let output = serde_json::from_str(message)
                .unwrap_or_else(|_| Value::String(message.clone()));
            NodeOutcome::completed(Some(output))
        }
    }
}

/// Decision nodes resolve their context-bound inputs into a choice value;
/// the interpreter fires the outgoing links whose guard matches it.
fn run_decision_node(ctx: &NodeContext) -> NodeOutcome {
    let choice = ctx
        .params
        .iter()
        .find_map(|param| {
            let source = param.ctx_bind_node.as_deref()?;
            let output = ctx.upstream_outputs.get(source)?;
            let name = param.ctx_bind_name.as_deref().unwrap_or(&param.param_id);
            first_output_field(output, name)
        })
        .map(value_to_choice)
        .unwrap_or_default();
    NodeOutcome::completed(Some(serde_json::json!({ "choice": choice })))
}

fn first_output_field(output: &Value, name: &str) -> Option<Value> {
    match output {
        Value::Array(rows) => rows.first().and_then(|row| row.get(name)).cloned(),
        Value::Object(map) => {
            if let Some(Value::Array(rows)) = map.get("outputs") {
                rows.first().and_then(|row| row.get(name)).cloned()
            } else {
                map.get(name).cloned()
            }
        }
        _ => None,
    }
}

fn value_to_choice(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Data nodes query the entity model line by line; results become the node
/// output, no plugin is invoked.
async fn run_data_node(deps: &Arc<EngineDeps>, ctx: &NodeContext) -> NodeOutcome {
    let Some(def_node) = &ctx.def_node else {
        return NodeOutcome::faulted("node has no definition counterpart");
    };
    let routine = def_node.routine_expression.as_deref().unwrap_or_default();
    let root_filter = EntityFilter::id_eq(ctx.root_data_id.clone());

    let mut rows = Vec::new();
    for expression in crate::resolver::split_data_expressions(routine) {
        let hops = match deps.resolver.analyze(expression).await {
            Ok(hops) => hops,
            Err(e) => return NodeOutcome::faulted(e.to_string()),
        };
        match deps.resolver.query(&hops, Some(&root_filter)).await {
            Ok(nodes) => {
                rows.extend(nodes.into_iter().filter(|n| n.last_flag).map(|n| {
                    serde_json::json!({
                        "id": n.data_id,
                        "displayName": n.display_name,
                        "entityType": format!("{}:{}", n.package_name, n.entity_name),
                        "fullDataId": n.full_data_id,
                    })
                }));
            }
            Err(e) => return NodeOutcome::faulted(e.to_string()),
        }
    }
    NodeOutcome::completed(Some(Value::Array(rows)))
}

/// Auto and foreach nodes: resolve bindings, invoke the plugin, interpret
/// the response. Foreach expands into one invocation per bound entity and
/// joins the child outcomes.
async fn run_service_node(
    deps: &Arc<EngineDeps>,
    ctx: &NodeContext,
    per_entity: bool,
) -> NodeOutcome {
    let Some(def_node) = &ctx.def_node else {
        return NodeOutcome::faulted("node has no definition counterpart");
    };
    let Some(service_name) = def_node.service_name.clone() else {
        return NodeOutcome::faulted("service node without a service reference");
    };

    // Callback resume: the approve payload is the plugin's deferred result.
    if let Some(message) = &ctx.resume {
        if let Ok(callback) = serde_json::from_str::<Value>(message) {
            if callback.get("results").is_some() {
                return interpret_callback(&callback);
            }
        }
    }

    let bindings = match resolve_bindings(deps, ctx, def_node).await {
        Ok(bindings) => bindings,
        Err(e) => return NodeOutcome::faulted(e.to_string()),
    };
    if bindings.is_empty() {
        // No data to operate on: an empty run completes with no side effect.
        debug!(node = %ctx.node.node_id, "service node has empty binding set");
        return NodeOutcome::completed(None);
    }

    let params: Vec<&ProcDefNodeParam> = ctx.params.iter().collect();
    let entity_attrs = match fetch_entity_attrs(deps, &params, &bindings).await {
        Ok(attrs) => attrs,
        Err(e) => return NodeOutcome::faulted(e.to_string()),
    };
    let inputs =
        match invoker::materialize_inputs(&params, &bindings, &ctx.upstream_outputs, &entity_attrs)
        {
            Ok(inputs) => inputs,
            Err(e) => return NodeOutcome::faulted(e.to_string()),
        };

    let due_date = (ctx.node.timeout_seconds > 0).then(|| {
        (chrono::Utc::now() + chrono::Duration::seconds(ctx.node.timeout_seconds as i64))
            .to_rfc3339()
    });
    // The resume payload that is not a callback body is a continuation
    // token from a risk-hold approval.
    let continue_token = ctx.resume.clone();

    let entity_refs: Vec<EntityInstanceRef> = bindings
        .iter()
        .map(|b| EntityInstanceRef {
            id: b.entity_data_id.clone(),
            business_key_value: b.entity_data_name.clone(),
        })
        .collect();

    if per_entity {
        let mut all_outputs = Vec::new();
        for (index, entity) in entity_refs.iter().enumerate() {
            let outcome = dispatch_one(
                deps,
                ctx,
                def_node,
                &service_name,
                vec![entity.clone()],
                vec![inputs[index].clone()],
                due_date.clone(),
                continue_token.clone(),
            )
            .await;
            match outcome {
                DispatchResult::Completed(outputs, _raw) => all_outputs.extend(outputs),
                DispatchResult::Hold(outcome) => return outcome,
            }
        }
        NodeOutcome::completed(Some(serde_json::json!({ "outputs": all_outputs })))
    } else {
        let outcome = dispatch_one(
            deps,
            ctx,
            def_node,
            &service_name,
            entity_refs,
            inputs,
            due_date,
            continue_token,
        )
        .await;
        match outcome {
            DispatchResult::Completed(outputs, raw) => NodeOutcome::completed(Some(
                serde_json::json!({ "outputs": outputs, "raw": raw }),
            )),
            DispatchResult::Hold(outcome) => outcome,
        }
    }
}

enum DispatchResult {
    /// Shaped outputs plus the raw response for diagnostics.
    Completed(Vec<Value>, Value),
    /// Waiting / faulted / timeouted outcome that ends the node now.
    Hold(NodeOutcome),
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
    deps: &Arc<EngineDeps>,
    ctx: &NodeContext,
    def_node: &ProcDefNode,
    service_name: &str,
    entity_instances: Vec<EntityInstanceRef>,
    inputs: Vec<opsflow_models::InputParamData>,
    due_date: Option<String>,
    continue_token: Option<String>,
) -> DispatchResult {
    let request_id = invoker::new_request_id();

    // Persist and index the request id before the call leaves the process,
    // so a fast callback can always be routed.
    if let Err(e) = deps
        .repo
        .update_node_request_id(ctx.node.id, &request_id)
        .await
    {
        return DispatchResult::Hold(NodeOutcome::faulted(e.to_string()));
    }
    deps.correlation
        .register(&request_id, ctx.workflow_id, &ctx.node.node_id);

    let invocation = PluginInvocation {
        request_id: request_id.clone(),
        operator: ctx.operator.clone(),
        service_name: service_name.to_string(),
        service_path: def_node.name.clone(),
        entity_instances,
        inputs,
        due_date,
        allowed_options: vec![],
    };

    let call = PluginCall {
        invocation,
        risk_check: def_node.risk_check,
        continue_token,
    };

    match deps.invoker.execute(call).await {
        Ok(ExecOutcome::Completed(result)) => {
            deps.correlation.remove(&request_id);
            if result.is_ok() {
                let shaped = invoker::shape_outputs(&result.outputs);
                let raw = serde_json::to_value(&result).unwrap_or(Value::Null);
                DispatchResult::Completed(shaped, raw)
            } else {
                DispatchResult::Hold(NodeOutcome::faulted(result.message))
            }
        }
        Ok(ExecOutcome::Pending { .. }) => DispatchResult::Hold(NodeOutcome::waiting()),
        Ok(ExecOutcome::RiskHold(findings)) => {
            let mut outcome = NodeOutcome::waiting();
            outcome.risk_result = serde_json::to_value(&findings).ok();
            DispatchResult::Hold(outcome)
        }
        Err(InvokeError::MissingParam(param)) => DispatchResult::Hold(NodeOutcome::faulted(
            format!("required parameter `{}` resolved to null", param),
        )),
        Err(e) => {
            deps.correlation.remove(&request_id);
            DispatchResult::Hold(NodeOutcome::faulted(e.to_string()))
        }
    }
}

/// Interpret an asynchronous callback body (`{ results: { requestId, … } }`)
/// delivered through an approve operation.
fn interpret_callback(callback: &Value) -> NodeOutcome {
    let results = &callback["results"];
    let error_code = results
        .get("errorCode")
        .and_then(Value::as_str)
        .unwrap_or("0");
    if error_code != "0" {
        let message = results
            .get("errorMessage")
            .and_then(Value::as_str)
            .unwrap_or("asynchronous plugin reported failure");
        return NodeOutcome::faulted(message);
    }
    let outputs = results
        .get("outputs")
        .cloned()
        .unwrap_or(Value::Array(vec![]));
    let shaped = match &outputs {
        Value::Array(rows) => invoker::shape_outputs(rows),
        other => vec![other.clone()],
    };
    NodeOutcome::completed(Some(
        serde_json::json!({ "outputs": shaped, "raw": callback }),
    ))
}

async fn resolve_bindings(
    deps: &Arc<EngineDeps>,
    ctx: &NodeContext,
    def_node: &ProcDefNode,
) -> Result<Vec<opsflow_models::DataBindingRow>, crate::EngineError> {
    if def_node.dynamic_bind {
        let source = def_node.bind_node_id.as_deref().ok_or_else(|| {
            crate::EngineError::Validation(format!(
                "node {} is dynamically bound but names no source node",
                def_node.node_id
            ))
        })?;
        Ok(deps
            .repo
            .copy_dynamic_bindings(ctx.proc_ins_id, source, ctx.node.proc_ins_node_id)
            .await?)
    } else {
        Ok(deps.repo.get_node_bindings(ctx.node.proc_ins_node_id).await?)
    }
}

/// Fetch attribute maps only when some parameter actually binds to entity
/// data.
async fn fetch_entity_attrs(
    deps: &Arc<EngineDeps>,
    params: &[&ProcDefNodeParam],
    bindings: &[opsflow_models::DataBindingRow],
) -> Result<HashMap<String, Value>, crate::EngineError> {
    let mut attrs = HashMap::new();
    if !params.iter().any(|p| p.bind_type == "entity") {
        return Ok(attrs);
    }
    for binding in bindings {
        let Some((package, entity)) = binding.entity_type_id.split_once(':') else {
            continue;
        };
        let data = deps
            .resolver
            .fetch_attributes(package, entity, &binding.entity_data_id)
            .await?;
        attrs.insert(binding.entity_data_id.clone(), data);
    }
    Ok(attrs)
}

/// Subprocess nodes start a child instance of the definition named by the
/// service reference and adopt the child workflow's terminal status.
async fn run_subprocess_node(deps: &Arc<EngineDeps>, ctx: &NodeContext) -> NodeOutcome {
    let Some(def_node) = &ctx.def_node else {
        return NodeOutcome::faulted("node has no definition counterpart");
    };
    let Some(child_key) = def_node.service_name.clone() else {
        return NodeOutcome::faulted("subprocess node without a child definition key");
    };

    let child_def = match deps.repo.latest_deployed_definition(&child_key).await {
        Ok(bundle) => bundle,
        Err(e) => return NodeOutcome::faulted(e.to_string()),
    };

    let started = service::start_instance_of(
        deps,
        child_def.def.id,
        &ctx.root_data_id,
        &ctx.operator,
    )
    .await;
    let (child_ins_id, child_workflow_id) = match started {
        Ok(ids) => ids,
        Err(e) => return NodeOutcome::faulted(e.to_string()),
    };
    debug!(node = %ctx.node.node_id, %child_workflow_id, "subprocess child started");

    // Observe the child through the store; the node timeout (enforced by
    // the interpreter) bounds this poll.
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let bundle = match deps.repo.load_workflow_bundle(child_workflow_id).await {
            Ok(bundle) => bundle,
            Err(e) => return NodeOutcome::faulted(e.to_string()),
        };
        let status: WorkflowStatus = match bundle.workflow.status.parse() {
            Ok(status) => status,
            Err(e) => return NodeOutcome::faulted(e.to_string()),
        };
        match status {
            WorkflowStatus::Completed => {
                return NodeOutcome::completed(Some(serde_json::json!({
                    "childInstanceId": child_ins_id,
                    "childWorkflowId": child_workflow_id,
                })));
            }
            WorkflowStatus::Terminated | WorkflowStatus::Problem => {
                warn!(%child_workflow_id, %status, "subprocess child did not complete");
                return NodeOutcome::faulted(format!(
                    "child workflow {} ended as {}",
                    child_workflow_id, status
                ));
            }
            WorkflowStatus::Running => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_choice_comes_from_context_param() {
        let param = ProcDefNodeParam {
            id: uuid::Uuid::now_v7(),
            proc_def_node_id: uuid::Uuid::now_v7(),
            param_id: "route".into(),
            name: "route".into(),
            bind_type: "context".into(),
            value: None,
            ctx_bind_node: Some("check".into()),
            ctx_bind_type: Some("output".into()),
            ctx_bind_name: Some("result".into()),
            entity_attr: None,
            required: true,
        };

        let mut upstream = HashMap::new();
        upstream.insert(
            "check".to_string(),
            serde_json::json!({"outputs": [{"result": "pass"}]}),
        );

        let ctx = NodeContext {
            workflow_id: uuid::Uuid::now_v7(),
            proc_ins_id: uuid::Uuid::now_v7(),
            node: WorkflowNodeRow {
                id: uuid::Uuid::now_v7(),
                workflow_id: uuid::Uuid::now_v7(),
                proc_ins_node_id: uuid::Uuid::now_v7(),
                node_id: "gate".into(),
                name: "gate".into(),
                node_type: "decision".into(),
                status: "running".into(),
                input: None,
                output: None,
                error_message: None,
                timeout_seconds: 0,
            },
            def_node: None,
            params: vec![param],
            upstream_outputs: upstream,
            root_data_id: "sys-1".into(),
            operator: "tester".into(),
            resume: None,
        };

        let outcome = run_decision_node(&ctx);
        assert_eq!(outcome.status, NodeStatus::Completed);
        assert_eq!(outcome.output.unwrap()["choice"], "pass");
    }

    #[test]
    fn callback_with_error_code_faults_the_node() {
        let callback = serde_json::json!({
            "results": {"requestId": "flowexec_1", "errorCode": "1", "errorMessage": "boom"}
        });
        let outcome = interpret_callback(&callback);
        assert_eq!(outcome.status, NodeStatus::Faulted);
        assert_eq!(outcome.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn callback_outputs_complete_the_node() {
        let callback = serde_json::json!({
            "results": {"requestId": "flowexec_1", "errorCode": "0",
                        "outputs": [{"retCode": 0}]}
        });
        let outcome = interpret_callback(&callback);
        assert_eq!(outcome.status, NodeStatus::Completed);
        let output = outcome.output.unwrap();
        assert_eq!(output["outputs"][0]["retCode"], "0");
    }
}
