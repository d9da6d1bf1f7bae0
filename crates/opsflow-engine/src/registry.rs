//! In-memory registry of live workflows on this worker.
//!
//! Addition happens at instance start or takeover, removal when a workflow
//! loop exits at a terminal state. The registry is process-wide state and is
//! substituted freely in tests.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::workflow::LoopMsg;

/// Sending half of one workflow's event loop.
#[derive(Clone)]
pub struct WorkflowHandle {
    pub workflow_id: Uuid,
    pub proc_ins_id: Uuid,
    tx: mpsc::Sender<LoopMsg>,
}

impl WorkflowHandle {
    pub fn new(workflow_id: Uuid, proc_ins_id: Uuid, tx: mpsc::Sender<LoopMsg>) -> Self {
        Self {
            workflow_id,
            proc_ins_id,
            tx,
        }
    }

    /// Deliver a message to the loop; `false` when the loop already exited.
    pub async fn send(&self, msg: LoopMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

/// Concurrent workflow-id → handle map.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<DashMap<Uuid, WorkflowHandle>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: WorkflowHandle) {
        self.inner.insert(handle.workflow_id, handle);
    }

    pub fn remove(&self, workflow_id: Uuid) {
        self.inner.remove(&workflow_id);
    }

    pub fn get(&self, workflow_id: Uuid) -> Option<WorkflowHandle> {
        self.inner.get(&workflow_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, workflow_id: Uuid) -> bool {
        self.inner.contains_key(&workflow_id)
    }

    /// Ids of every workflow currently hosted here.
    pub fn ids(&self) -> Vec<Uuid> {
        self.inner.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
