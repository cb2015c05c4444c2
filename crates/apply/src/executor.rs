//! Operation executor: runs one bucket's operations concurrently on a bounded pool.

use std::sync::Arc;
use std::time::Instant;

use kairo_core::{Cluster, ClusterError, DeletePropagation, ResultCode};
use kairo_plan::PendingOperation;
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::retry::RetryPolicy;
use crate::strategy::strategy_for;

/// Per-attempt knobs the strategies read.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Application name, stamped as the tracking label value.
    pub instance: String,
    pub prune: bool,
    pub dry_run: bool,
    pub propagation: DeletePropagation,
}

/// Result of executing one pending operation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub op: PendingOperation,
    pub code: ResultCode,
    pub message: String,
    pub attempts: u32,
    pub fatal: Option<ClusterError>,
}

pub struct Executor {
    cluster: Arc<dyn Cluster>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(cluster: Arc<dyn Cluster>, workers: usize, retry: RetryPolicy) -> Self {
        Self { cluster, retry, permits: Arc::new(Semaphore::new(workers.max(1))) }
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> { &self.cluster }

    /// Execute a single operation on the caller's task.
    pub async fn run_one(&self, op: PendingOperation, ctx: &ExecContext) -> Outcome {
        execute(self.cluster.as_ref(), op, ctx, &self.retry).await
    }

    /// Execute operations concurrently. Outcomes come back in completion order; an
    /// operation whose task dies is reported as SyncFailed.
    pub async fn run_all(&self, ops: Vec<PendingOperation>, ctx: &ExecContext) -> Vec<Outcome> {
        let mut pending: Vec<Option<PendingOperation>> = ops.iter().cloned().map(Some).collect();
        let mut set = JoinSet::new();
        for (idx, op) in ops.into_iter().enumerate() {
            let cluster = Arc::clone(&self.cluster);
            let permits = Arc::clone(&self.permits);
            let ctx = ctx.clone();
            let retry = self.retry;
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                (idx, execute(cluster.as_ref(), op, &ctx, &retry).await)
            });
        }
        let mut out = Vec::with_capacity(pending.len());
        let mut task_error: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    pending[idx] = None;
                    out.push(outcome);
                }
                Err(e) => {
                    error!(error = %e, "operation task failed");
                    task_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        // A dead task cannot report which operation it held.
        let reason = task_error.unwrap_or_else(|| "task ended without a result".to_string());
        for op in pending.into_iter().flatten() {
            counter!("sync_failed_total", 1u64);
            let message = format!("operation task failed: {}", reason);
            out.push(Outcome { op, code: ResultCode::SyncFailed, message, attempts: 0, fatal: None });
        }
        out
    }
}

async fn execute(cluster: &dyn Cluster, op: PendingOperation, ctx: &ExecContext, retry: &RetryPolicy) -> Outcome {
    let t0 = Instant::now();
    debug!(resource = %op.resource, kind = op.kind.as_str(), wave = op.wave, "executing");
    let step = strategy_for(op.kind).execute(cluster, &op, ctx, retry).await;
    histogram!("sync_op_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("sync_ops_total", 1u64, "kind" => op.kind.as_str(), "code" => step.code.as_str());
    if step.code.is_failure() {
        counter!("sync_failed_total", 1u64);
    }
    info!(resource = %op.resource, kind = op.kind.as_str(), code = step.code.as_str(), attempts = step.attempts, msg = %step.message, "operation done");
    Outcome { op, code: step.code, message: step.message, attempts: step.attempts, fatal: step.fatal }
}
