//! Per-kind execution strategies. `OperationKind` is a closed set; each kind maps to
//! one strategy through [`strategy_for`].

use kairo_core::annotations::{LAST_APPLIED, TRACKING_LABEL};
use kairo_core::{Cluster, ClusterError, HookDeletePolicy, OperationKind, ResultCode};
use kairo_plan::PendingOperation;
use tracing::debug;

use crate::executor::ExecContext;
use crate::retry::RetryPolicy;

/// What a strategy reports back for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub code: ResultCode,
    pub message: String,
    pub attempts: u32,
    /// Infrastructure failure that should end the attempt with phase Error.
    pub fatal: Option<ClusterError>,
}

impl StepResult {
    fn ok(code: ResultCode, message: impl Into<String>, attempts: u32) -> Self {
        Self { code, message: message.into(), attempts, fatal: None }
    }

    fn failed(err: ClusterError, attempts: u32) -> Self {
        let fatal = matches!(err, ClusterError::Unreachable(_)).then(|| err.clone());
        Self { code: ResultCode::SyncFailed, message: err.to_string(), attempts, fatal }
    }
}

#[async_trait::async_trait]
pub trait OperationStrategy: Send + Sync {
    async fn execute(&self, cluster: &dyn Cluster, op: &PendingOperation, ctx: &ExecContext, retry: &RetryPolicy) -> StepResult;
}

pub struct ApplyStrategy;
pub struct PruneStrategy;
pub struct HookStrategy;

static APPLY: ApplyStrategy = ApplyStrategy;
static PRUNE: PruneStrategy = PruneStrategy;
static HOOK: HookStrategy = HookStrategy;

pub fn strategy_for(kind: OperationKind) -> &'static dyn OperationStrategy {
    match kind {
        OperationKind::Create | OperationKind::Update => &APPLY,
        OperationKind::Prune => &PRUNE,
        OperationKind::Hook => &HOOK,
    }
}

fn describe(op: &PendingOperation, verb: &str) -> String {
    format!("{}/{} {}", op.resource.kind.to_lowercase(), op.resource.name, verb)
}

async fn apply_tracked(cluster: &dyn Cluster, op: &PendingOperation, ctx: &ExecContext, retry: &RetryPolicy) -> Result<u32, StepResult> {
    let Some(desired) = op.manifest.as_ref() else {
        return Err(StepResult::ok(ResultCode::SyncFailed, "no desired manifest", 0));
    };
    let mut manifest = desired.clone();
    manifest.set_annotation(LAST_APPLIED, &desired.raw().to_string());
    manifest.set_label(TRACKING_LABEL, &ctx.instance);
    let what = op.resource.to_string();
    let (res, attempts) = retry.run(&what, || cluster.apply(&manifest)).await;
    match res {
        Ok(_) => Ok(attempts),
        Err(e) => Err(StepResult::failed(e, attempts)),
    }
}

#[async_trait::async_trait]
impl OperationStrategy for ApplyStrategy {
    async fn execute(&self, cluster: &dyn Cluster, op: &PendingOperation, ctx: &ExecContext, retry: &RetryPolicy) -> StepResult {
        let verb = if op.kind == OperationKind::Create { "created" } else { "configured" };
        if ctx.dry_run {
            return StepResult::ok(ResultCode::Synced, describe(op, &format!("{} (dry run)", verb)), 0);
        }
        match apply_tracked(cluster, op, ctx, retry).await {
            Ok(attempts) => StepResult::ok(ResultCode::Synced, describe(op, verb), attempts),
            Err(failed) => failed,
        }
    }
}

#[async_trait::async_trait]
impl OperationStrategy for PruneStrategy {
    async fn execute(&self, cluster: &dyn Cluster, op: &PendingOperation, ctx: &ExecContext, retry: &RetryPolicy) -> StepResult {
        if !ctx.prune {
            return StepResult::ok(ResultCode::PruneSkipped, "ignored (requires pruning)", 0);
        }
        let what = op.resource.to_string();
        if op.preserve {
            if ctx.dry_run {
                return StepResult::ok(ResultCode::PruneSkipped, "pruning disabled for resource (dry run)", 0);
            }
            let (res, attempts) = retry.run(&what, || cluster.untrack(&op.resource, TRACKING_LABEL)).await;
            return match res {
                Ok(()) | Err(ClusterError::NotFound(_)) => {
                    StepResult::ok(ResultCode::PruneSkipped, "pruning disabled for resource; tracking removed", attempts)
                }
                Err(e) => StepResult::failed(e, attempts),
            };
        }
        if ctx.dry_run {
            return StepResult::ok(ResultCode::Pruned, describe(op, "pruned (dry run)"), 0);
        }
        let (res, attempts) = retry.run(&what, || cluster.delete(&op.resource, ctx.propagation)).await;
        match res {
            Ok(()) => StepResult::ok(ResultCode::Pruned, describe(op, "pruned"), attempts),
            Err(ClusterError::NotFound(_)) => StepResult::ok(ResultCode::Pruned, describe(op, "already gone"), attempts),
            Err(e) => StepResult::failed(e, attempts),
        }
    }
}

#[async_trait::async_trait]
impl OperationStrategy for HookStrategy {
    async fn execute(&self, cluster: &dyn Cluster, op: &PendingOperation, ctx: &ExecContext, retry: &RetryPolicy) -> StepResult {
        if ctx.dry_run {
            return StepResult::ok(ResultCode::Synced, describe(op, "hook created (dry run)"), 0);
        }
        let mut attempts = 0;
        if op.delete_policies.contains(&HookDeletePolicy::BeforeHookCreation) {
            let what = op.resource.to_string();
            let (res, n) = retry.run(&what, || cluster.delete(&op.resource, ctx.propagation)).await;
            attempts += n;
            match res {
                Ok(()) => debug!(resource = %op.resource, "deleted previous hook instance"),
                Err(ClusterError::NotFound(_)) => {}
                Err(e) => return StepResult::failed(e, attempts),
            }
        }
        match apply_tracked(cluster, op, ctx, retry).await {
            Ok(n) => StepResult::ok(ResultCode::Synced, describe(op, "hook created"), attempts + n),
            Err(mut failed) => {
                failed.attempts += attempts;
                failed
            }
        }
    }
}
