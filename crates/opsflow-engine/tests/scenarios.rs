//! Interpreter scenario tests: full workflows against the in-memory
//! repository with scripted plugin and entity collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use opsflow_engine::invoker::{ExecOutcome, InvokeError, PluginCall, PluginInvoker};
use opsflow_engine::resolver::{
    analyze_expression, EntityFilter, EntityResolver, ExpressionHop, ResolveError,
};
use opsflow_engine::{
    CorrelationIndex, EngineDeps, OperationRequest, ProcessService, Scheduler, WorkflowRegistry,
};
use opsflow_models::{
    DefinitionBundle, EngineConfig, NodeStatus, PluginResult, PreviewEntityNode, ProcDef,
    ProcDefLink, ProcDefNode, ProcDefNodeParam, ProcInstanceStatus, RiskCheckFinding,
};
use opsflow_storage::{InMemoryRepository, ProcessRepository};

// =============================================================================
// Scripted collaborators
// =============================================================================

#[derive(Clone)]
enum Script {
    Ok(Vec<Value>),
    Fail(String),
    Risk(Vec<RiskCheckFinding>),
    #[allow(dead_code)]
    Pending,
}

#[derive(Clone)]
struct RecordedCall {
    service: String,
    entity_ids: Vec<String>,
    continue_token: Option<String>,
    at: Instant,
}

/// Pops one scripted outcome per call, per service; records every call.
struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, Vec<Script>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedInvoker {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn script(&self, service: &str, outcome: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_default()
            .push(outcome);
    }

    fn delay(&self, service: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(service.to_string(), delay);
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, service: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.service == service)
            .collect()
    }
}

#[async_trait]
impl PluginInvoker for ScriptedInvoker {
    async fn execute(&self, call: PluginCall) -> Result<ExecOutcome, InvokeError> {
        let service = call.invocation.service_name.clone();
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&service)
            .copied()
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().unwrap().push(RecordedCall {
            service: service.clone(),
            entity_ids: call
                .invocation
                .entity_instances
                .iter()
                .map(|e| e.id.clone())
                .collect(),
            continue_token: call.continue_token.clone(),
            at: Instant::now(),
        });

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.entry(service).or_default();
            if queue.is_empty() {
                Script::Ok(vec![])
            } else {
                queue.remove(0)
            }
        };

        match script {
            Script::Ok(outputs) => Ok(ExecOutcome::Completed(PluginResult {
                request_id: call.invocation.request_id,
                status: "OK".to_string(),
                message: String::new(),
                outputs,
            })),
            Script::Fail(message) => Err(InvokeError::Plugin {
                code: "FAIL".to_string(),
                message,
            }),
            Script::Risk(findings) => Ok(ExecOutcome::RiskHold(findings)),
            Script::Pending => Ok(ExecOutcome::Pending {
                request_id: call.invocation.request_id,
            }),
        }
    }
}

/// Returns the same canned entity set for every query.
struct StaticResolver {
    nodes: Vec<PreviewEntityNode>,
}

impl StaticResolver {
    fn single_entity(data_id: &str) -> Self {
        Self {
            nodes: vec![PreviewEntityNode {
                id: format!("wecmdb:host:{}", data_id),
                package_name: "wecmdb".to_string(),
                entity_name: "host".to_string(),
                data_id: data_id.to_string(),
                display_name: format!("host {}", data_id),
                full_data_id: data_id.to_string(),
                last_flag: true,
                previous_ids: vec![],
                succeeding_ids: vec![],
                entity_data: None,
            }],
        }
    }
}

#[async_trait]
impl EntityResolver for StaticResolver {
    async fn analyze(&self, expression: &str) -> Result<Vec<ExpressionHop>, ResolveError> {
        analyze_expression(expression)
    }

    async fn query(
        &self,
        _hops: &[ExpressionHop],
        _root_filter: Option<&EntityFilter>,
    ) -> Result<Vec<PreviewEntityNode>, ResolveError> {
        Ok(self.nodes.clone())
    }

    async fn fetch_attributes(
        &self,
        _package: &str,
        _entity: &str,
        _data_id: &str,
    ) -> Result<Value, ResolveError> {
        Ok(serde_json::json!({}))
    }
}

// =============================================================================
// Definition builders
// =============================================================================

struct DefBuilder {
    def_id: Uuid,
    nodes: Vec<ProcDefNode>,
    links: Vec<ProcDefLink>,
    params: Vec<ProcDefNodeParam>,
}

impl DefBuilder {
    fn new() -> Self {
        Self {
            def_id: Uuid::now_v7(),
            nodes: vec![],
            links: vec![],
            params: vec![],
        }
    }

    fn node(mut self, node_id: &str, node_type: &str) -> Self {
        self.nodes.push(ProcDefNode {
            id: Uuid::now_v7(),
            proc_def_id: self.def_id,
            node_id: node_id.to_string(),
            name: node_id.to_string(),
            node_type: node_type.to_string(),
            service_name: None,
            routine_expression: None,
            dynamic_bind: false,
            bind_node_id: None,
            risk_check: false,
            timeout_seconds: 0,
            ordered_no: None,
            context_param_nodes: None,
        });
        self
    }

    fn service_node(mut self, node_id: &str, service: &str) -> Self {
        self = self.node(node_id, "auto");
        let node = self.nodes.last_mut().unwrap();
        node.service_name = Some(service.to_string());
        node.routine_expression = Some("wecmdb:host".to_string());
        self
    }

    fn risk_check(mut self, node_id: &str) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.node_id == node_id) {
            node.risk_check = true;
        }
        self
    }

    fn link(mut self, source: &str, target: &str) -> Self {
        self.links.push(ProcDefLink {
            id: Uuid::now_v7(),
            proc_def_id: self.def_id,
            link_id: format!("{}-{}", source, target),
            source: source.to_string(),
            target: target.to_string(),
            guard: None,
        });
        self
    }

    fn guarded_link(mut self, source: &str, target: &str, guard: &str) -> Self {
        self = self.link(source, target);
        self.links.last_mut().unwrap().guard = Some(guard.to_string());
        self
    }

    fn decision_node(mut self, node_id: &str, source_node: &str) -> Self {
        self = self.node(node_id, "decision");
        let def_node_id = self.nodes.last().unwrap().id;
        self.params.push(ProcDefNodeParam {
            id: Uuid::now_v7(),
            proc_def_node_id: def_node_id,
            param_id: "route".to_string(),
            name: "route".to_string(),
            bind_type: "context".to_string(),
            value: None,
            ctx_bind_node: Some(source_node.to_string()),
            ctx_bind_type: Some("output".to_string()),
            ctx_bind_name: Some("result".to_string()),
            entity_attr: None,
            required: true,
        });
        self
    }

    fn build(self) -> DefinitionBundle {
        DefinitionBundle {
            def: ProcDef {
                id: self.def_id,
                key: "demo".to_string(),
                name: "demo".to_string(),
                version: "v1".to_string(),
                root_entity: "wecmdb:host".to_string(),
                status: "deployed".to_string(),
                created_by: "tester".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            nodes: self.nodes,
            links: self.links,
            params: self.params,
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    repo: Arc<InMemoryRepository>,
    invoker: Arc<ScriptedInvoker>,
    service: ProcessService,
    deps: Arc<EngineDeps>,
}

fn test_config(host: &str) -> EngineConfig {
    EngineConfig {
        http_port: 0,
        host_ip: host.to_string(),
        db_dsn: String::new(),
        jwt_signing_key: String::new(),
        stale_takeover: Duration::from_secs(1),
        operation_scan_interval: Duration::from_millis(100),
        takeover_scan_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(200),
    }
}

fn harness(host: &str) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let invoker = Arc::new(ScriptedInvoker::new());
    let deps = Arc::new(EngineDeps {
        repo: Arc::clone(&repo) as Arc<dyn ProcessRepository>,
        invoker: Arc::clone(&invoker) as Arc<dyn PluginInvoker>,
        resolver: Arc::new(StaticResolver::single_entity("e1")),
        correlation: CorrelationIndex::new(),
        registry: WorkflowRegistry::new(),
        config: test_config(host),
    });
    let service = ProcessService::new(Arc::clone(&deps));
    Harness {
        repo,
        invoker,
        service,
        deps,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn workflow_status(repo: &Arc<InMemoryRepository>, workflow_id: Uuid) -> String {
    repo.workflow_row(workflow_id)
        .map(|w| w.status)
        .unwrap_or_default()
}

// =============================================================================
// Scenarios
// =============================================================================

/// S1: {start → auto(svcA) → end}, plugin OK. Everything completes and the
/// plugin saw exactly one call with the bound entity.
#[tokio::test]
async fn s1_linear_happy_path() {
    let h = harness("w1");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .node("end", "end")
        .link("start", "A")
        .link("A", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);

    h.invoker
        .script("svcA", Script::Ok(vec![serde_json::json!({"retCode": 0})]));

    let detail = h
        .service
        .start_instance(def_id, "e1", "tester")
        .await
        .expect("should start");
    let (workflow_id, _) = h
        .repo
        .workflow_for_instance(detail.id, None)
        .await
        .unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "completed",
        "workflow completion",
    )
    .await;

    for node in ["start", "A", "end"] {
        assert_eq!(
            h.repo.node_status(workflow_id, node),
            Some(NodeStatus::Completed),
            "node {} should be completed",
            node
        );
    }

    let calls = h.invoker.calls_for("svcA");
    assert_eq!(calls.len(), 1, "exactly one plugin call");
    assert_eq!(calls[0].entity_ids, vec!["e1".to_string()]);

    let detail = h.service.instance_detail(detail.id).await.unwrap();
    assert_eq!(detail.status, ProcInstanceStatus::Completed);
    // The root entity's display name resolved at start is surfaced on the
    // instance views.
    assert_eq!(detail.entity_data_name, "host e1");
    let listed = h.service.list_instances().await.unwrap();
    assert_eq!(listed[0].entity_data_name, "host e1");
}

/// S2: first plugin call fails, node faults; a retry operation re-runs it
/// with the same binding and the workflow completes.
#[tokio::test]
async fn s2_retry_after_failure() {
    let h = harness("w1");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .node("end", "end")
        .link("start", "A")
        .link("A", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);

    h.invoker.script("svcA", Script::Fail("disk full".into()));
    h.invoker.script("svcA", Script::Ok(vec![]));

    let detail = h.service.start_instance(def_id, "e1", "tester").await.unwrap();
    let (workflow_id, _) = h.repo.workflow_for_instance(detail.id, None).await.unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || repo.node_status(workflow_id, "A") == Some(NodeStatus::Faulted),
        "node A faulted",
    )
    .await;

    let node_ins_id = h
        .service
        .instance_detail(detail.id)
        .await
        .unwrap()
        .nodes
        .into_iter()
        .find(|n| n.node_id == "A")
        .unwrap()
        .id;
    h.service
        .submit_operation(OperationRequest {
            proc_ins_id: detail.id,
            node_ins_id: Some(node_ins_id),
            act: "retry".to_string(),
            operator: "operator".to_string(),
        })
        .await
        .unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "completed",
        "workflow completion after retry",
    )
    .await;

    assert_eq!(
        h.repo.node_status(workflow_id, "A"),
        Some(NodeStatus::Completed)
    );
    assert_eq!(h.invoker.calls_for("svcA").len(), 2);
    // Both attempts target the same binding.
    let calls = h.invoker.calls_for("svcA");
    assert_eq!(calls[0].entity_ids, calls[1].entity_ids);
}

/// S3: a risk hold parks the node waiting; approve supplies the
/// continuation token and the invocation proceeds.
#[tokio::test]
async fn s3_risk_hold_then_approve() {
    let h = harness("w1");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .risk_check("A")
        .node("end", "end")
        .link("start", "A")
        .link("A", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);

    h.invoker.script(
        "svcA",
        Script::Risk(vec![RiskCheckFinding {
            rule_name: "no-prod-friday".to_string(),
            level: "high".to_string(),
            detail: "deploy window closed".to_string(),
        }]),
    );
    h.invoker.script("svcA", Script::Ok(vec![]));

    let detail = h.service.start_instance(def_id, "e1", "tester").await.unwrap();
    let (workflow_id, _) = h.repo.workflow_for_instance(detail.id, None).await.unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || repo.node_status(workflow_id, "A") == Some(NodeStatus::Waiting),
        "node A waiting on risk hold",
    )
    .await;

    let node_ins_id = h
        .service
        .instance_detail(detail.id)
        .await
        .unwrap()
        .nodes
        .into_iter()
        .find(|n| n.node_id == "A")
        .unwrap()
        .id;
    h.service
        .submit_operation(OperationRequest {
            proc_ins_id: detail.id,
            node_ins_id: Some(node_ins_id),
            act: "approve".to_string(),
            operator: "approver".to_string(),
        })
        .await
        .unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "completed",
        "workflow completion after approve",
    )
    .await;

    let calls = h.invoker.calls_for("svcA");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].continue_token.is_none(), "first call is unapproved");
    assert!(
        calls[1].continue_token.is_some(),
        "approved call carries the continuation token"
    );
}

/// S4: worker W1 creates a workflow and dies before running it. W2's
/// takeover scanner claims the stale row, rehydrates, and completes it.
#[tokio::test]
async fn s4_takeover_from_dead_worker() {
    let h = harness("w2");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .node("end", "end")
        .link("start", "A")
        .link("A", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);
    h.invoker.script("svcA", Script::Ok(vec![]));

    // W1 persisted the instance but crashed before its loop ever ran.
    let created = h
        .repo
        .create_process_instance(opsflow_storage::CreateInstanceRequest {
            proc_def_id: def_id,
            entity_data_id: "e1".to_string(),
            entity_data_name: "host e1".to_string(),
            operator: "tester".to_string(),
            host: "w1".to_string(),
            bindings: vec![opsflow_storage::NewBinding {
                node_id: "A".to_string(),
                entity_data_id: "e1".to_string(),
                entity_type_id: "wecmdb:host".to_string(),
                entity_data_name: "host e1".to_string(),
                full_data_id: "e1".to_string(),
            }],
        })
        .await
        .unwrap();
    let workflow_id = created.bundle.workflow.id;

    // Age the heartbeat past the takeover threshold.
    h.repo
        .heartbeat(workflow_id, Utc::now() - chrono::Duration::seconds(60))
        .await
        .unwrap();

    let scheduler = Scheduler::start(Arc::clone(&h.deps));

    let repo = Arc::clone(&h.repo);
    wait_until(
        || {
            repo.workflow_row(workflow_id)
                .map(|w| w.host == "w2")
                .unwrap_or(false)
        },
        "takeover claim by w2",
    )
    .await;

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "completed",
        "workflow completion on w2",
    )
    .await;

    assert_eq!(h.invoker.calls_for("svcA").len(), 1);
    scheduler.shutdown().await;
}

/// S5: {start → (A, B) → C → end}. C must not fire before the slower of A
/// and B has completed.
#[tokio::test]
async fn s5_parallel_join() {
    let h = harness("w1");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .service_node("B", "svcB")
        .service_node("C", "svcC")
        .node("end", "end")
        .link("start", "A")
        .link("start", "B")
        .link("A", "C")
        .link("B", "C")
        .link("C", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);

    h.invoker.delay("svcA", Duration::from_millis(50));
    h.invoker.delay("svcB", Duration::from_millis(300));

    let detail = h.service.start_instance(def_id, "e1", "tester").await.unwrap();
    let (workflow_id, _) = h.repo.workflow_for_instance(detail.id, None).await.unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "completed",
        "parallel join completion",
    )
    .await;

    let a = &h.invoker.calls_for("svcA")[0];
    let b = &h.invoker.calls_for("svcB")[0];
    let c = &h.invoker.calls_for("svcC")[0];
    // Call records are taken after the per-service delay, i.e. at node
    // completion time; C's invocation cannot predate either branch.
    assert!(c.at >= a.at, "C fired before A completed");
    assert!(c.at >= b.at, "C fired before B completed");
    assert_eq!(h.invoker.calls_for("svcC").len(), 1, "C fired exactly once");
}

/// S6: kill while A runs. A finishes and is recorded; nothing downstream
/// is scheduled; the workflow terminates.
#[tokio::test]
async fn s6_kill_lets_inflight_finish() {
    let h = harness("w1");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .service_node("B", "svcB")
        .node("end", "end")
        .link("start", "A")
        .link("A", "B")
        .link("B", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);

    h.invoker.delay("svcA", Duration::from_millis(400));

    let detail = h.service.start_instance(def_id, "e1", "tester").await.unwrap();
    let (workflow_id, _) = h.repo.workflow_for_instance(detail.id, None).await.unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || repo.node_status(workflow_id, "A") == Some(NodeStatus::Running),
        "node A running",
    )
    .await;

    h.service
        .submit_operation(OperationRequest {
            proc_ins_id: detail.id,
            node_ins_id: None,
            act: "kill".to_string(),
            operator: "operator".to_string(),
        })
        .await
        .unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "terminated",
        "workflow terminated",
    )
    .await;

    // The in-flight call ran to completion and was recorded.
    assert_eq!(
        h.repo.node_status(workflow_id, "A"),
        Some(NodeStatus::Completed)
    );
    // No successor was scheduled.
    assert!(h.invoker.calls_for("svcB").is_empty());
    assert_eq!(
        h.repo.node_status(workflow_id, "B"),
        Some(NodeStatus::NotStarted)
    );

    let detail = h.service.instance_detail(detail.id).await.unwrap();
    assert_eq!(detail.status, ProcInstanceStatus::InternallyTerminated);
}

/// Decision nodes fire only the guard-matching branch; given identical
/// outputs the chosen set is identical across runs.
#[tokio::test]
async fn decision_fires_matching_guard_only() {
    for _ in 0..3 {
        let h = harness("w1");
        let definition = DefBuilder::new()
            .node("start", "start")
            .service_node("check", "svcCheck")
            .decision_node("gate", "check")
            .service_node("X", "svcX")
            .service_node("Y", "svcY")
            .node("end", "end")
            .link("start", "check")
            .link("check", "gate")
            .guarded_link("gate", "X", "pass")
            .guarded_link("gate", "Y", "fail")
            .link("X", "end")
            .link("Y", "end")
            .build();
        let def_id = definition.def.id;
        h.repo.insert_definition(definition);

        h.invoker.script(
            "svcCheck",
            Script::Ok(vec![serde_json::json!({"result": "pass"})]),
        );

        let detail = h.service.start_instance(def_id, "e1", "tester").await.unwrap();
        let (workflow_id, _) = h.repo.workflow_for_instance(detail.id, None).await.unwrap();

        let repo = Arc::clone(&h.repo);
        wait_until(
            || workflow_status(&repo, workflow_id) == "completed",
            "guarded branch completion",
        )
        .await;

        assert_eq!(h.invoker.calls_for("svcX").len(), 1);
        assert!(h.invoker.calls_for("svcY").is_empty());
        assert_eq!(
            h.repo.node_status(workflow_id, "Y"),
            Some(NodeStatus::NotStarted)
        );
    }
}

/// A stop operation suspends scheduling without touching node states; a
/// continue resumes from where the workflow left off.
#[tokio::test]
async fn stop_then_continue_resumes() {
    let h = harness("w1");
    let definition = DefBuilder::new()
        .node("start", "start")
        .service_node("A", "svcA")
        .service_node("B", "svcB")
        .node("end", "end")
        .link("start", "A")
        .link("A", "B")
        .link("B", "end")
        .build();
    let def_id = definition.def.id;
    h.repo.insert_definition(definition);

    h.invoker.delay("svcA", Duration::from_millis(300));

    let detail = h.service.start_instance(def_id, "e1", "tester").await.unwrap();
    let (workflow_id, _) = h.repo.workflow_for_instance(detail.id, None).await.unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || repo.node_status(workflow_id, "A") == Some(NodeStatus::Running),
        "node A running",
    )
    .await;

    h.service
        .submit_operation(OperationRequest {
            proc_ins_id: detail.id,
            node_ins_id: None,
            act: "stop".to_string(),
            operator: "operator".to_string(),
        })
        .await
        .unwrap();

    // A finishes; B must not start while sleeping.
    let repo = Arc::clone(&h.repo);
    wait_until(
        || repo.node_status(workflow_id, "A") == Some(NodeStatus::Completed),
        "node A completed while stopped",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.invoker.calls_for("svcB").is_empty());
    assert!(h.repo.workflow_row(workflow_id).unwrap().sleep);

    h.service
        .submit_operation(OperationRequest {
            proc_ins_id: detail.id,
            node_ins_id: None,
            act: "continue".to_string(),
            operator: "operator".to_string(),
        })
        .await
        .unwrap();

    let repo = Arc::clone(&h.repo);
    wait_until(
        || workflow_status(&repo, workflow_id) == "completed",
        "completion after continue",
    )
    .await;
    assert_eq!(h.invoker.calls_for("svcB").len(), 1);
}
