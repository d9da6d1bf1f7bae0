//! Per-worker background loops.
//!
//! The operation scanner claims pending commands for locally hosted
//! workflows; the takeover scanner claims workflows whose previous owner
//! stopped heartbeating and rehydrates them here. Both are plain interval
//! loops with a watch-channel shutdown signal.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::recovery;
use crate::service::{self, EngineDeps};
use crate::workflow::WorkflowCommand;

/// Handle over the two scanner loops.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    operation_handle: JoinHandle<()>,
    takeover_handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the scanners. Call after boot recovery so the registry is
    /// already populated.
    pub fn start(deps: Arc<EngineDeps>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let operation_handle =
            tokio::spawn(operation_scan_loop(Arc::clone(&deps), shutdown_rx.clone()));
        let takeover_handle = tokio::spawn(takeover_scan_loop(deps, shutdown_rx));

        Self {
            shutdown_tx,
            operation_handle,
            takeover_handle,
        }
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.operation_handle.await;
        let _ = self.takeover_handle.await;
        info!("scheduler stopped");
    }
}

/// Every `operation_scan_interval`: pending operations whose target
/// workflow is hosted here are claimed and delivered. A lost claim is
/// silent: another worker won.
async fn operation_scan_loop(deps: Arc<EngineDeps>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(deps.config.operation_scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => scan_operations(&deps).await,
            _ = shutdown_rx.changed() => {
                debug!("operation scanner: shutdown requested");
                break;
            }
        }
    }
}

async fn scan_operations(deps: &Arc<EngineDeps>) {
    let workflow_ids = deps.registry.ids();
    if workflow_ids.is_empty() {
        return;
    }
    let operations = match deps.repo.list_pending_operations(&workflow_ids).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("operation scan query failed: {}", e);
            return;
        }
    };

    for row in operations {
        let command = match WorkflowCommand::from_row(&row) {
            Ok(command) => command,
            Err(e) => {
                warn!(op_id = row.id, "malformed operation: {}", e);
                if let Err(e) = deps.repo.finish_operation(row.id, false).await {
                    warn!(op_id = row.id, "finish of malformed operation failed: {}", e);
                }
                continue;
            }
        };
        let deps = Arc::clone(deps);
        tokio::spawn(async move {
            service::dispatch(&deps, row.id, row.workflow_id, command).await;
        });
    }
}

/// Every `takeover_scan_interval`: workflows that are running, not
/// sleeping and silent past the staleness threshold are claimed with the
/// CAS; winners rehydrate them locally. Normally the scan finds nothing.
async fn takeover_scan_loop(deps: Arc<EngineDeps>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(deps.config.takeover_scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => scan_takeover(&deps).await,
            _ = shutdown_rx.changed() => {
                debug!("takeover scanner: shutdown requested");
                break;
            }
        }
    }
}

async fn scan_takeover(deps: &Arc<EngineDeps>) {
    let stale_before = Utc::now()
        - chrono::Duration::from_std(deps.config.stale_takeover).unwrap_or_default();
    let candidates = match deps.repo.list_stale_workflows(stale_before).await {
        Ok(ids) => ids,
        Err(e) => {
            error!("takeover scan query failed: {}", e);
            return;
        }
    };

    for workflow_id in candidates {
        // A workflow already hosted here is alive; its heartbeat loop owns
        // the row.
        if deps.registry.contains(workflow_id) {
            continue;
        }
        match deps
            .repo
            .claim_workflow(workflow_id, &deps.config.host_ip, stale_before)
            .await
        {
            Ok(true) => {
                info!(%workflow_id, "workflow claimed, rehydrating");
                if let Err(e) = recovery::recover_workflow(deps, workflow_id).await {
                    error!(%workflow_id, "takeover rehydration failed: {}", e);
                }
            }
            Ok(false) => {
                debug!(%workflow_id, "takeover claim lost");
            }
            Err(e) => {
                error!(%workflow_id, "takeover claim failed: {}", e);
            }
        }
    }
}
