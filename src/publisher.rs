//! # Republish and Expiration Daemon
//!
//! One background task per node keeps the database honest: remote values
//! past their TTL are dropped, and locally-originated values whose republish
//! interval has elapsed are pushed back out to their current custodians.
//!
//! At most one publish is in flight at any time; each store fan-out is
//! awaited before the next value is considered. The daemon refuses to run
//! twice concurrently and stops cooperatively through the node's
//! cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::node::DhtNode;
use crate::rpc::DhtRpc;

/// Drives periodic expiration sweeps and republishes for one node.
pub struct Publisher<R: DhtRpc> {
    node: DhtNode<R>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
}

impl<R: DhtRpc> Publisher<R> {
    pub fn new(node: DhtNode<R>) -> Self {
        let shutdown = node.shutdown_token();
        Self {
            node,
            shutdown,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the daemon loop. A second call while a loop is alive is
    /// refused.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("publisher already running, refusing to start again");
            return;
        }
        let node = self.node.clone();
        let shutdown = self.shutdown.clone();
        let running = Arc::clone(&self.running);
        let interval = node.config().publisher_pass_interval;
        tokio::spawn(async move {
            info!(id = %node.local_id(), "publisher started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if shutdown.is_cancelled() {
                    break;
                }
                run_pass(&node, &shutdown).await;
            }
            running.store(false, Ordering::SeqCst);
            info!(id = %node.local_id(), "publisher stopped");
        });
    }

    /// Request cooperative shutdown. The in-flight publish, if any,
    /// completes; no further value is started.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One expiration-and-republish pass, for callers that drive the
    /// schedule themselves (tests, embedding applications).
    pub async fn run_once(&self) -> PassReport {
        run_pass(&self.node, &self.shutdown).await
    }
}

/// What one daemon pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassReport {
    /// Remote values dropped for exceeding their TTL.
    pub expired: usize,
    /// Local values pushed back out this pass.
    pub republished: usize,
    /// Republishes that fell short of the store quorum.
    pub quorum_misses: usize,
}

async fn run_pass<R: DhtRpc>(node: &DhtNode<R>, shutdown: &CancellationToken) -> PassReport {
    let mut report = PassReport::default();
    let Some(plan) = node.publish_plan().await else {
        return report;
    };
    report.expired = plan.expired;
    if plan.expired > 0 {
        debug!(expired = plan.expired, "expiration sweep dropped values");
    }

    for (key, publisher_id) in plan.due {
        if shutdown.is_cancelled() {
            break;
        }
        // The value may have been removed or refreshed since the plan was
        // made; the node re-checks and skips in that case.
        match node.publish_value(key, publisher_id).await {
            Ok(Some(store)) => {
                trace!(key = %key, accepted = store.accepted.len(), "value republished");
                report.republished += 1;
                if !store.quorum_met {
                    report.quorum_misses += 1;
                }
            }
            Ok(None) => {
                trace!(key = %key, "value no longer due, skipped");
            }
            Err(err) => {
                debug!(key = %key, %err, "republish attempt failed");
            }
        }
    }
    report
}
