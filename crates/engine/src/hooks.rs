//! Hook orchestration. Hooks are created through the executor like any other
//! operation, but they only count as done once their health says so: Healthy is
//! success, Degraded is failure, anything else keeps polling until the hook timeout.
//! A hook that was seen live and then disappears before reporting either way is a
//! failure: its outcome can no longer be observed.

use std::time::Instant;

use kairo_apply::{ExecContext, Executor, Outcome};
use kairo_core::{ClusterError, HealthStatus, HookDeletePolicy, ResultCode};
use kairo_health::HealthRegistry;
use kairo_plan::PendingOperation;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::ledger::Ledger;
use crate::sync::{entry_for, Waiter};

pub(crate) enum HookEnd {
    Completed,
    Failed(String),
    Cancelled,
    Error(String),
}

pub(crate) struct HookContext<'a> {
    pub executor: &'a Executor,
    pub exec: &'a ExecContext,
    pub health: &'a HealthRegistry,
    pub config: &'a SyncConfig,
}

/// Create `ops`, wait for each to finish and record one ledger entry per hook.
pub(crate) async fn run(ctx: HookContext<'_>, ops: Vec<PendingOperation>, ledger: &mut Ledger, waiter: &mut Waiter) -> HookEnd {
    let mut failed: Option<String> = None;
    let mut fatal: Option<ClusterError> = None;
    // Each hook still running, with whether it has been seen live yet.
    let mut waiting: Vec<(Outcome, bool)> = Vec::new();

    for o in ctx.executor.run_all(ops, ctx.exec).await {
        if o.fatal.is_some() && fatal.is_none() {
            fatal = o.fatal.clone();
        }
        if o.code.is_failure() || ctx.exec.dry_run {
            settle(&ctx, o, ledger, &mut failed).await;
        } else {
            waiting.push((o, false));
        }
    }
    if let Some(e) = fatal {
        return HookEnd::Error(e.to_string());
    }

    let deadline = Instant::now() + ctx.config.hook_timeout;
    while !waiting.is_empty() {
        let mut next = Vec::new();
        for (mut o, seen) in waiting {
            let cluster = ctx.executor.cluster();
            let r = &o.op.resource;
            let (live, _) = ctx.config.retry.run(&r.to_string(), || cluster.get(r)).await;
            let live = match live {
                Ok(live) => live,
                Err(e) => return HookEnd::Error(format!("failed to get hook {}: {}", o.op.resource, e)),
            };
            if live.is_none() && seen {
                let message = format!("{}/{} hook deleted before completion could be observed", r.kind.to_lowercase(), r.name);
                o.code = ResultCode::SyncFailed;
                o.message = message;
                settle(&ctx, o, ledger, &mut failed).await;
                continue;
            }
            let seen = seen || live.is_some();
            let verdict = ctx.health.evaluate(live.as_ref());
            match verdict.status {
                HealthStatus::Healthy => {
                    o.message = format!("{}/{} hook completed", o.op.resource.kind.to_lowercase(), o.op.resource.name);
                    settle(&ctx, o, ledger, &mut failed).await;
                }
                HealthStatus::Degraded => {
                    o.code = ResultCode::SyncFailed;
                    o.message = verdict.message.unwrap_or_else(|| "hook failed".to_string());
                    settle(&ctx, o, ledger, &mut failed).await;
                }
                _ => next.push((o, seen)),
            }
        }
        if next.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            for (mut o, _) in next {
                o.code = ResultCode::SyncFailed;
                o.message = "hook timed out".to_string();
                settle(&ctx, o, ledger, &mut failed).await;
            }
            break;
        }
        let first = &next[0].0.op.resource;
        if let Err(e) = ledger.set_message(format!("waiting for completion of hook {}/{}", first.kind.to_lowercase(), first.name)) {
            debug!(error = %e, "ledger message not updated");
        }
        if !waiter.pause(Some(deadline)).await {
            return HookEnd::Cancelled;
        }
        waiting = next;
    }

    match failed {
        Some(msg) => HookEnd::Failed(msg),
        None => HookEnd::Completed,
    }
}

/// Record the final result for one hook and apply its delete policy.
async fn settle(ctx: &HookContext<'_>, outcome: Outcome, ledger: &mut Ledger, failed: &mut Option<String>) {
    let ok = !outcome.code.is_failure();
    info!(resource = %outcome.op.resource, phase = ?outcome.op.hook_phase, code = outcome.code.as_str(), "hook finished");
    if let Err(e) = ledger.append(entry_for(&outcome)) {
        warn!(error = %e, "ledger refused hook entry");
    }
    if !ok && failed.is_none() {
        *failed = Some(format!("one or more synchronization tasks completed unsuccessfully, reason: {}", outcome.message));
    }
    if ctx.exec.dry_run {
        return;
    }
    let policy = if ok { HookDeletePolicy::HookSucceeded } else { HookDeletePolicy::HookFailed };
    if !outcome.op.delete_policies.contains(&policy) {
        return;
    }
    let cluster = ctx.executor.cluster();
    let r = &outcome.op.resource;
    let (res, _) = ctx.config.retry.run(&r.to_string(), || cluster.delete(r, ctx.exec.propagation)).await;
    match res {
        Ok(()) | Err(ClusterError::NotFound(_)) => debug!(resource = %r, ?policy, "hook deleted"),
        Err(e) => warn!(resource = %r, error = %e, "hook delete policy failed"),
    }
}
