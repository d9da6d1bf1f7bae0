//! The workflow interpreter: one single-writer event loop per process
//! instance.
//!
//! The loop is driven by two message sources: node completions from
//! spawned node tasks, and operator commands claimed off the durable
//! operation queue. All node state transitions are checkpointed through the
//! repository before they become observable, and the workflow heartbeats
//! its row while executing so a dead worker's workflows become
//! takeover-eligible.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use opsflow_models::{
    DefinitionBundle, NodeStatus, NodeType, OperationKind, OperationRow, ProcInstanceStatus,
    WorkflowBundle, WorkflowLinkRow, WorkflowNodeRow, WorkflowStatus,
};

use crate::node::{self, NodeContext, NodeOutcome};
use crate::registry::WorkflowHandle;
use crate::retry::RetryPolicy;
use crate::service::EngineDeps;
use crate::EngineError;

/// Operator commands the loop understands.
#[derive(Debug, Clone)]
pub enum WorkflowCommand {
    Start,
    RetryNode(String),
    IgnoreNode(String),
    ApproveNode {
        node_id: String,
        message: Option<String>,
    },
    Kill,
    Stop,
    Continue,
}

impl WorkflowCommand {
    /// Convert a claimed operation row into a command.
    pub fn from_row(row: &OperationRow) -> Result<Self, EngineError> {
        let kind = row
            .kind()
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let node_id = || {
            row.node_id
                .clone()
                .ok_or_else(|| EngineError::Validation(format!("operation {} needs a node", row.id)))
        };
        Ok(match kind {
            OperationKind::Start => Self::Start,
            OperationKind::Kill => Self::Kill,
            OperationKind::Retry => Self::RetryNode(node_id()?),
            OperationKind::Ignore => Self::IgnoreNode(node_id()?),
            OperationKind::Approve => Self::ApproveNode {
                node_id: node_id()?,
                message: row.message.clone(),
            },
            OperationKind::Stop => Self::Stop,
            OperationKind::Continue => Self::Continue,
        })
    }
}

/// Messages entering the event loop.
pub enum LoopMsg {
    Command {
        op_id: i64,
        command: WorkflowCommand,
    },
    NodeFinished {
        node_id: String,
        outcome: NodeOutcome,
    },
}

enum Flow {
    Continue,
    Exit,
}

/// In-memory interpreter state for one process instance.
pub struct Workflow {
    id: Uuid,
    proc_ins_id: Uuid,
    deps: Arc<EngineDeps>,
    definition: DefinitionBundle,
    root_data_id: String,
    operator: String,

    nodes: HashMap<String, WorkflowNodeRow>,
    links: Vec<WorkflowLinkRow>,
    /// node id → indexes into `links`.
    incoming: HashMap<String, Vec<usize>>,
    outgoing: HashMap<String, Vec<usize>>,
    fired_links: HashSet<String>,

    kill_requested: bool,
    sleeping: bool,
    tx: mpsc::Sender<LoopMsg>,
}

/// Build the interpreter and spawn its event loop; the returned handle is
/// already registered.
pub fn launch(
    deps: Arc<EngineDeps>,
    bundle: WorkflowBundle,
    definition: DefinitionBundle,
    root_data_id: String,
    operator: String,
) -> WorkflowHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = WorkflowHandle::new(bundle.workflow.id, bundle.workflow.proc_ins_id, tx.clone());
    deps.registry.insert(handle.clone());

    let workflow = Workflow::new(deps, bundle, definition, root_data_id, operator, tx);
    tokio::spawn(workflow.run(rx));
    handle
}

impl Workflow {
    fn new(
        deps: Arc<EngineDeps>,
        bundle: WorkflowBundle,
        definition: DefinitionBundle,
        root_data_id: String,
        operator: String,
        tx: mpsc::Sender<LoopMsg>,
    ) -> Self {
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, link) in bundle.links.iter().enumerate() {
            outgoing.entry(link.source.clone()).or_default().push(index);
            incoming.entry(link.target.clone()).or_default().push(index);
        }

        Self {
            id: bundle.workflow.id,
            proc_ins_id: bundle.workflow.proc_ins_id,
            deps,
            definition,
            root_data_id,
            operator,
            nodes: bundle
                .nodes
                .into_iter()
                .map(|n| (n.node_id.clone(), n))
                .collect(),
            links: bundle.links,
            incoming,
            outgoing,
            fired_links: HashSet::new(),
            kill_requested: bundle.workflow.stop,
            sleeping: bundle.workflow.sleep,
            tx,
        }
    }

    /// The single-writer event loop.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LoopMsg>) {
        info!(workflow_id = %self.id, "workflow loop started");
        let mut heartbeat = tokio::time::interval(self.deps.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.deps.repo.heartbeat(self.id, Utc::now()).await {
                        warn!(workflow_id = %self.id, "heartbeat failed: {}", e);
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match self.handle(msg).await {
                        Flow::Continue => {}
                        Flow::Exit => break,
                    }
                }
            }
        }

        self.deps.registry.remove(self.id);
        info!(workflow_id = %self.id, "workflow loop exited");
    }

    async fn handle(&mut self, msg: LoopMsg) -> Flow {
        match msg {
            LoopMsg::Command { op_id, command } => {
                let result = self.handle_command(command).await;
                let ok = result.is_ok();
                if let Err(e) = &result {
                    warn!(workflow_id = %self.id, op_id, "command rejected: {}", e);
                }
                if let Err(e) = self.deps.repo.finish_operation(op_id, ok).await {
                    warn!(workflow_id = %self.id, op_id, "finish operation failed: {}", e);
                }
                match result {
                    Ok(flow) => flow,
                    Err(_) => Flow::Continue,
                }
            }
            LoopMsg::NodeFinished { node_id, outcome } => {
                self.handle_node_finished(&node_id, outcome).await
            }
        }
    }

    async fn handle_command(&mut self, command: WorkflowCommand) -> Result<Flow, EngineError> {
        match command {
            WorkflowCommand::Start => {
                self.deps
                    .repo
                    .update_instance_status(self.proc_ins_id, ProcInstanceStatus::InProgress)
                    .await?;
                // A fresh workflow fires its start node; a rehydrated one
                // rescans from whatever already completed.
                let start_fresh = self
                    .nodes
                    .values()
                    .find(|n| n.node_type == NodeType::Start.to_string())
                    .filter(|n| n.status == NodeStatus::NotStarted.to_string())
                    .map(|n| n.node_id.clone());
                match start_fresh {
                    Some(start_id) => self.spawn_node(&start_id, None).await,
                    None => self.rescan_ready().await,
                }
                Ok(Flow::Continue)
            }
            WorkflowCommand::RetryNode(node_id) => {
                let status = self.node_status(&node_id)?;
                if !matches!(status, NodeStatus::Faulted | NodeStatus::Timeouted) {
                    return Err(EngineError::Validation(format!(
                        "retry is invalid from {}",
                        status
                    )));
                }
                if !self
                    .checkpoint(&node_id, NodeStatus::NotStarted, None, None, None)
                    .await
                {
                    return Ok(self.mark_problem("checkpoint failed after retries").await);
                }
                self.spawn_node(&node_id, None).await;
                Ok(Flow::Continue)
            }
            WorkflowCommand::IgnoreNode(node_id) => {
                let status = self.node_status(&node_id)?;
                if !matches!(
                    status,
                    NodeStatus::Faulted | NodeStatus::Timeouted | NodeStatus::Waiting
                ) {
                    return Err(EngineError::Validation(format!(
                        "ignore is invalid from {}",
                        status
                    )));
                }
                let outcome = NodeOutcome {
                    status: NodeStatus::Skipped,
                    output: None,
                    error_message: None,
                    risk_result: None,
                };
                Ok(self.handle_node_finished(&node_id, outcome).await)
            }
            WorkflowCommand::ApproveNode { node_id, message } => {
                let status = self.node_status(&node_id)?;
                if status != NodeStatus::Waiting {
                    return Err(EngineError::Validation(format!(
                        "approve is invalid from {}",
                        status
                    )));
                }
                // An approve without payload still carries consent; the node
                // runtime distinguishes resume from first execution by the
                // payload's presence.
                self.spawn_node(&node_id, Some(message.unwrap_or_default()))
                    .await;
                Ok(Flow::Continue)
            }
            WorkflowCommand::Kill => {
                self.kill_requested = true;
                self.deps.repo.set_workflow_stop(self.id, true).await?;
                // In-flight nodes run to completion; no successor is
                // scheduled. Terminate now if already quiescent.
                Ok(self.finish_if_quiescent().await)
            }
            WorkflowCommand::Stop => {
                self.sleeping = true;
                self.deps.repo.set_workflow_sleep(self.id, true).await?;
                Ok(Flow::Continue)
            }
            WorkflowCommand::Continue => {
                self.sleeping = false;
                self.deps.repo.set_workflow_sleep(self.id, false).await?;
                self.rescan_ready().await;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_node_finished(&mut self, node_id: &str, outcome: NodeOutcome) -> Flow {
        debug!(workflow_id = %self.id, node_id, status = %outcome.status, "node finished");

        // Checkpoint before the transition becomes observable.
        if !self
            .checkpoint(
                node_id,
                outcome.status,
                None,
                outcome.output.clone(),
                outcome.error_message.as_deref(),
            )
            .await
        {
            return self.mark_problem("checkpoint failed after retries").await;
        }
        if let Some(risk) = &outcome.risk_result {
            if let Some(node) = self.nodes.get(node_id) {
                if let Err(e) = self
                    .deps
                    .repo
                    .update_node_risk_result(node.id, risk.clone())
                    .await
                {
                    warn!(workflow_id = %self.id, node_id, "risk result write failed: {}", e);
                }
            }
        }

        let node_type = self
            .nodes
            .get(node_id)
            .and_then(|n| n.node_type.parse::<NodeType>().ok());

        if self.kill_requested {
            // Record the result, schedule nothing further.
            return self.finish_if_quiescent().await;
        }

        if outcome.status.is_succeeded() {
            if node_type == Some(NodeType::End) {
                return self.finish_at_end().await;
            }
            if !self.sleeping {
                let fired_targets = self.fire_outgoing(node_id);
                for target in fired_targets {
                    if self.is_ready(&target) {
                        self.spawn_node(&target, None).await;
                    }
                }
            }
        }

        Flow::Continue
    }

    /// Fire this node's outgoing links and return their targets. Decision
    /// nodes fire the guard-matching subset; every other type fires all.
    fn fire_outgoing(&mut self, node_id: &str) -> Vec<String> {
        let node_type = self
            .nodes
            .get(node_id)
            .and_then(|n| n.node_type.parse::<NodeType>().ok());
        let choice = (node_type == Some(NodeType::Decision)).then(|| {
            self.nodes
                .get(node_id)
                .and_then(|n| n.output.as_ref())
                .and_then(|o| o.get("choice"))
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string()
        });

        let mut targets = Vec::new();
        let Some(out_links) = self.outgoing.get(node_id) else {
            return targets;
        };
        let mut fired = Vec::new();
        for &index in out_links {
            let link = &self.links[index];
            let fires = match &choice {
                // Empty guards always fire; labeled guards must match.
                Some(choice) => link
                    .guard
                    .as_deref()
                    .map(|g| g.is_empty() || g == choice)
                    .unwrap_or(true),
                None => true,
            };
            if fires {
                fired.push(link.link_id.clone());
                targets.push(link.target.clone());
            }
        }
        self.fired_links.extend(fired);
        targets
    }

    /// A node is ready iff at least one incoming link fired and every other
    /// incoming link is either fired or dead. A link is dead when it can
    /// never fire anymore: its source succeeded without choosing it
    /// (decision branch not taken) or its source sits on a dead path. This
    /// keeps joins waiting for live parallel branches while not blocking on
    /// branches a decision ruled out.
    fn is_ready(&self, node_id: &str) -> bool {
        let Some(node) = self.nodes.get(node_id) else {
            return false;
        };
        if node.status != NodeStatus::NotStarted.to_string() {
            return false;
        }
        let Some(in_links) = self.incoming.get(node_id) else {
            // Only the start node has no incoming links.
            return true;
        };
        let mut any_fired = false;
        for &index in in_links {
            let link = &self.links[index];
            if self.fired_links.contains(&link.link_id) {
                any_fired = true;
            } else if !self.link_is_dead(index, &mut HashSet::new()) {
                // A live unfired link: the join must keep waiting.
                return false;
            }
        }
        any_fired
    }

    /// An unfired link is dead when its source succeeded without firing it,
    /// or the source itself can never run.
    fn link_is_dead(&self, link_index: usize, visiting: &mut HashSet<String>) -> bool {
        let link = &self.links[link_index];
        let Some(source) = self.nodes.get(&link.source) else {
            return true;
        };
        match source.status.parse::<NodeStatus>() {
            Ok(status) if status.is_succeeded() => !self.fired_links.contains(&link.link_id),
            _ => self.node_is_dead(&link.source, visiting),
        }
    }

    /// A node is dead when it never started and every incoming link is
    /// dead. `visiting` guards against malformed cyclic definitions.
    fn node_is_dead(&self, node_id: &str, visiting: &mut HashSet<String>) -> bool {
        if !visiting.insert(node_id.to_string()) {
            return false;
        }
        let Some(node) = self.nodes.get(node_id) else {
            return true;
        };
        if node.status != NodeStatus::NotStarted.to_string() {
            // Running, waiting, faulted or timeouted: could still produce a
            // firing (faulted nodes are retryable).
            return false;
        }
        let Some(in_links) = self.incoming.get(node_id) else {
            return false;
        };
        in_links
            .iter()
            .all(|&index| self.link_is_dead(index, visiting))
    }

    /// Re-evaluate firing for every settled successful node, then spawn
    /// whatever is ready. Used on recovery start and `continue`.
    async fn rescan_ready(&mut self) {
        let succeeded: Vec<String> = self
            .nodes
            .values()
            .filter(|n| {
                n.status
                    .parse::<NodeStatus>()
                    .map(NodeStatus::is_succeeded)
                    .unwrap_or(false)
            })
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in succeeded {
            self.fire_outgoing(&node_id);
        }
        let candidates: Vec<String> = self.nodes.keys().cloned().collect();
        for node_id in candidates {
            if self.is_ready(&node_id) {
                self.spawn_node(&node_id, None).await;
            }
        }
    }

    /// Claim the node (checkpoint to running) and execute it on its own
    /// task; the task reports back through the loop channel.
    async fn spawn_node(&mut self, node_id: &str, resume: Option<String>) {
        if !self
            .checkpoint(node_id, NodeStatus::Running, None, None, None)
            .await
        {
            return;
        }
        let Some(node) = self.nodes.get(node_id) else {
            error!(workflow_id = %self.id, node_id, "spawn of unknown node");
            return;
        };

        let def_node = self.definition.node(node_id).cloned();
        let params = def_node
            .as_ref()
            .map(|d| {
                self.definition
                    .params_for(d)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let upstream_outputs = self.collect_upstream_outputs(node_id, def_node.as_ref());

        let ctx = NodeContext {
            workflow_id: self.id,
            proc_ins_id: self.proc_ins_id,
            node: node.clone(),
            def_node,
            params,
            upstream_outputs,
            root_data_id: self.root_data_id.clone(),
            operator: self.operator.clone(),
            resume,
        };

        let deps = Arc::clone(&self.deps);
        let tx = self.tx.clone();
        let node_key = node_id.to_string();
        let timeout_seconds = node.timeout_seconds;

        tokio::spawn(async move {
            let outcome = if timeout_seconds > 0 {
                let limit = std::time::Duration::from_secs(timeout_seconds as u64);
                match tokio::time::timeout(limit, node::execute(deps, ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => NodeOutcome::timeouted(None),
                }
            } else {
                node::execute(deps, ctx).await
            };
            let _ = tx
                .send(LoopMsg::NodeFinished {
                    node_id: node_key,
                    outcome,
                })
                .await;
        });
    }

    /// Outputs visible to a node: its declared context nodes, or its direct
    /// predecessors when none are declared.
    fn collect_upstream_outputs(
        &self,
        node_id: &str,
        def_node: Option<&opsflow_models::ProcDefNode>,
    ) -> HashMap<String, serde_json::Value> {
        let declared: Vec<String> = def_node
            .map(|d| d.context_nodes().iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let sources: Vec<String> = if declared.is_empty() {
            self.incoming
                .get(node_id)
                .map(|links| {
                    links
                        .iter()
                        .map(|&i| self.links[i].source.clone())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            declared
        };

        sources
            .into_iter()
            .filter_map(|source| {
                self.nodes
                    .get(&source)
                    .and_then(|n| n.output.clone())
                    .map(|output| (source, output))
            })
            .collect()
    }

    /// End-node policy: completed when no sibling faulted or timeouted,
    /// otherwise the workflow needs attention.
    async fn finish_at_end(&mut self) -> Flow {
        let troubled = self.nodes.values().any(|n| {
            matches!(
                n.status.parse::<NodeStatus>(),
                Ok(NodeStatus::Faulted | NodeStatus::Timeouted)
            )
        });
        if troubled {
            self.set_terminal(WorkflowStatus::Problem, ProcInstanceStatus::Faulted, None)
                .await
        } else {
            self.set_terminal(
                WorkflowStatus::Completed,
                ProcInstanceStatus::Completed,
                None,
            )
            .await
        }
    }

    /// After a kill: terminated once nothing is running or waiting.
    async fn finish_if_quiescent(&mut self) -> Flow {
        let busy = self.nodes.values().any(|n| {
            matches!(
                n.status.parse::<NodeStatus>(),
                Ok(NodeStatus::Running | NodeStatus::Waiting)
            )
        });
        if busy {
            return Flow::Continue;
        }
        self.set_terminal(
            WorkflowStatus::Terminated,
            ProcInstanceStatus::InternallyTerminated,
            None,
        )
        .await
    }

    async fn mark_problem(&mut self, reason: &str) -> Flow {
        error!(workflow_id = %self.id, "workflow marked problem: {}", reason);
        self.set_terminal(
            WorkflowStatus::Problem,
            ProcInstanceStatus::Faulted,
            Some(reason),
        )
        .await
    }

    async fn set_terminal(
        &mut self,
        workflow_status: WorkflowStatus,
        instance_status: ProcInstanceStatus,
        error_message: Option<&str>,
    ) -> Flow {
        if let Err(e) = self
            .deps
            .repo
            .update_workflow_status(self.id, workflow_status, error_message)
            .await
        {
            error!(workflow_id = %self.id, "terminal workflow update failed: {}", e);
        }
        if let Err(e) = self
            .deps
            .repo
            .update_instance_status(self.proc_ins_id, instance_status)
            .await
        {
            error!(workflow_id = %self.id, "terminal instance update failed: {}", e);
        }
        info!(workflow_id = %self.id, status = %workflow_status, "workflow reached terminal state");
        Flow::Exit
    }

    fn node_status(&self, node_id: &str) -> Result<NodeStatus, EngineError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| EngineError::NotFound(format!("node {}", node_id)))?
            .status
            .parse()
            .map_err(|e: opsflow_models::ParseStatusError| EngineError::Internal(e.to_string()))
    }

    /// Durable write with a bounded local retry budget; in-memory state is
    /// only updated after the write lands.
    async fn checkpoint(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        input: Option<serde_json::Value>,
        output: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> bool {
        let Some(node_db_id) = self.nodes.get(node_id).map(|n| n.id) else {
            error!(workflow_id = %self.id, node_id, "checkpoint of unknown node");
            return false;
        };
        let policy = RetryPolicy::default();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .deps
                .repo
                .update_node_status(
                    node_db_id,
                    status,
                    input.clone(),
                    output.clone(),
                    error_message,
                )
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_transient() && policy.has_attempts_remaining(attempt) => {
                    warn!(workflow_id = %self.id, node_id, attempt, "checkpoint retry: {}", e);
                    tokio::time::sleep(policy.delay_for_attempt(attempt + 1)).await;
                }
                Err(e) => {
                    error!(workflow_id = %self.id, node_id, "checkpoint failed: {}", e);
                    return false;
                }
            }
        }

        if let Some(node) = self.nodes.get_mut(node_id) {
            node.status = status.to_string();
            if output.is_some() {
                node.output = output;
            }
            node.error_message = error_message.map(str::to_string);
        }
        true
    }
}
