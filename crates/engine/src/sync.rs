//! Sync coordinator: one task per attempt walks the wave schedule, hands buckets to the
//! executor, gates on health between buckets and is the only writer of the ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kairo_apply::{ExecContext, Executor, Outcome};
use kairo_core::{OperationKind, OperationPhase, OperationResult, RefreshType, ResourceRef, ResultCode};
use kairo_health::{gate, GateVerdict};
use kairo_persist::{now_ts, AttemptRecord};
use kairo_plan::{build, Bucket, BuildOptions, PendingOperation, Schedule, Stage};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::AppInner;
use crate::hooks::{self, HookEnd};
use crate::ledger::{Ledger, LedgerReader, LedgerSnapshot};

pub const TERMINATED: &str = "operation terminated";
pub const SUCCEEDED: &str = "successfully synced (all tasks run)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Delete live objects that are no longer desired.
    pub prune: bool,
    /// Do not wait on health between buckets.
    pub async_mode: bool,
    pub dry_run: bool,
    pub apply_out_of_sync_only: bool,
    /// Treat Progressing as blocking at the health gate.
    pub require_healthy: bool,
}

/// Caller's view of a running or finished attempt.
#[derive(Clone)]
pub struct SyncHandle {
    id: String,
    reader: LedgerReader,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub fn id(&self) -> &str { &self.id }
    pub fn phase(&self) -> OperationPhase { self.reader.current().phase }
    pub fn results(&self) -> Vec<OperationResult> { self.reader.current().entries.clone() }
    pub fn snapshot(&self) -> Arc<LedgerSnapshot> { self.reader.current() }
    /// Epoch bumped on every ledger write.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.reader.subscribe() }
    pub async fn wait(&self) -> Arc<LedgerSnapshot> { self.reader.wait_terminal().await }
    /// Resolve at a terminal phase, or earlier once only deletions are outstanding.
    pub async fn wait_settled(&self) -> Arc<LedgerSnapshot> { self.reader.wait_settled().await }

    /// Stop starting buckets. In-flight cluster calls are allowed to finish.
    pub fn terminate(&self) {
        info!(id = %self.id, "termination requested");
        self.cancel.cancel();
    }
}

/// Suspension helper shared by every wait in an attempt: resumes on the poll tick, on
/// an application refresh, or reports cancellation.
pub(crate) struct Waiter {
    cancel: CancellationToken,
    refresh_rx: watch::Receiver<u64>,
    poll: Duration,
}

impl Waiter {
    /// Returns false when the attempt was cancelled.
    pub(crate) async fn pause(&mut self, deadline: Option<Instant>) -> bool {
        let mut wake = Instant::now() + self.poll;
        if let Some(d) = deadline {
            wake = wake.min(d);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            changed = self.refresh_rx.changed() => {
                if changed.is_ok() { debug!("woken by refresh"); }
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
        }
        !self.cancel.is_cancelled()
    }
}

enum Stop {
    Failed(String),
    Error(String),
    Terminated,
}

pub(crate) fn entry_for(outcome: &Outcome) -> OperationResult {
    OperationResult {
        resource: outcome.op.resource.clone(),
        operation: outcome.op.kind,
        code: outcome.code,
        message: outcome.message.clone(),
        wave: outcome.op.wave,
        hook_phase: outcome.op.hook_phase,
        attempts: outcome.attempts,
        ts: now_ts(),
    }
}

pub(crate) struct Coordinator {
    app: Arc<AppInner>,
    id: String,
    options: SyncOptions,
    executor: Executor,
    exec: ExecContext,
    ledger: Ledger,
    waiter: Waiter,
    cancel: CancellationToken,
    /// Resources applied in finished buckets; the health gate looks at these.
    applied: Vec<ResourceRef>,
}

impl Coordinator {
    pub(crate) fn spawn(app: Arc<AppInner>, options: SyncOptions) -> SyncHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let (ledger, reader) = Ledger::new(&id, now_ts());
        let cancel = CancellationToken::new();
        let config = &app.config;
        let executor = Executor::new(Arc::clone(&app.cluster), config.workers, config.retry);
        let exec = ExecContext {
            instance: app.name.clone(),
            prune: options.prune,
            dry_run: options.dry_run,
            propagation: config.propagation,
        };
        let waiter = Waiter { cancel: cancel.clone(), refresh_rx: app.refresh_tx.subscribe(), poll: config.poll };
        let coordinator = Coordinator {
            id: id.clone(),
            options,
            executor,
            exec,
            ledger,
            waiter,
            cancel: cancel.clone(),
            applied: Vec::new(),
            app,
        };
        tokio::spawn(coordinator.run());
        SyncHandle { id, reader, cancel }
    }

    async fn run(mut self) {
        let t0 = Instant::now();
        counter!("sync_attempts", 1u64);
        info!(app = %self.app.name, id = %self.id, prune = self.options.prune, async_mode = self.options.async_mode, dry_run = self.options.dry_run, "sync started");

        let (phase, message) = match self.drive().await {
            Ok(()) => (OperationPhase::Succeeded, SUCCEEDED.to_string()),
            Err(Stop::Failed(msg)) => (OperationPhase::Failed, msg),
            Err(Stop::Terminated) => (OperationPhase::Failed, TERMINATED.to_string()),
            Err(Stop::Error(msg)) => (OperationPhase::Error, msg),
        };

        if let Err(e) = self.app.refresh_status(RefreshType::Normal).await {
            warn!(app = %self.app.name, error = %e, "post-sync refresh failed");
        }
        let finished = now_ts();
        self.persist(phase, &message, finished);
        if let Err(e) = self.ledger.finish(phase, message.clone(), finished) {
            warn!(id = %self.id, error = %e, "ledger refused final phase");
        }
        histogram!("sync_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("sync_phase_total", 1u64, "phase" => phase.as_str());
        info!(app = %self.app.name, id = %self.id, phase = phase.as_str(), results = self.ledger.len(), msg = %message, "sync finished");
    }

    async fn drive(&mut self) -> Result<(), Stop> {
        let diff = self.app.diff.diff(RefreshType::Normal).await.map_err(|e| Stop::Error(format!("comparison failed: {:#}", e)))?;
        let graph = build(&diff, BuildOptions { apply_out_of_sync_only: self.options.apply_out_of_sync_only });
        for w in &graph.warnings {
            warn!(app = %self.app.name, warning = %w, "plan warning");
        }
        let mut schedule = Schedule::from_graph(graph);
        info!(app = %self.app.name, buckets = schedule.len(), "plan built");

        let walked = self.walk(&mut schedule).await;
        if let Err(Stop::Failed(_)) = &walked {
            let hooks = schedule.take_sync_fail_hooks();
            if !hooks.is_empty() {
                info!(app = %self.app.name, hooks = hooks.len(), "running SyncFail hooks");
                match self.run_hooks(hooks).await {
                    HookEnd::Completed | HookEnd::Failed(_) | HookEnd::Cancelled => {}
                    HookEnd::Error(e) => warn!(app = %self.app.name, error = %e, "SyncFail hooks errored"),
                }
            }
        }
        walked
    }

    async fn walk(&mut self, schedule: &mut Schedule) -> Result<(), Stop> {
        let mut first = true;
        while let Some(info) = schedule.peek().cloned() {
            if self.cancel.is_cancelled() {
                schedule.halt();
                return Err(Stop::Terminated);
            }
            if !first && !self.options.async_mode && !self.options.dry_run {
                if let Err(stop) = self.await_gate().await {
                    schedule.halt();
                    return Err(stop);
                }
            }
            first = false;
            let Some(bucket) = schedule.start_next() else { break };
            info!(app = %self.app.name, stage = ?info.stage, wave = info.wave, resources = info.resources.len(), "starting bucket");
            if let Err(stop) = self.run_bucket(bucket).await {
                schedule.halt();
                warn!(app = %self.app.name, stage = ?info.stage, wave = info.wave, remaining = schedule.remaining().len(), "bucket halted the attempt");
                return Err(stop);
            }
            schedule.complete();
        }
        Ok(())
    }

    fn record(&mut self, outcome: &Outcome) {
        if let Err(e) = self.ledger.append(entry_for(outcome)) {
            warn!(id = %self.id, error = %e, "ledger refused entry");
        }
    }

    async fn run_bucket(&mut self, bucket: Bucket) -> Result<(), Stop> {
        let mut failed: Option<String> = None;
        let mut fatal = None;
        let mut deleting = Vec::new();
        let outcomes = if bucket.operations.is_empty() {
            Vec::new()
        } else {
            self.executor.run_all(bucket.operations, &self.exec).await
        };
        for o in &outcomes {
            self.record(o);
            if o.fatal.is_some() && fatal.is_none() {
                fatal = o.fatal.clone();
            }
            if o.code.is_failure() && failed.is_none() {
                failed = Some(format!("one or more objects failed to apply, reason: {}", o.message));
            }
            if self.options.dry_run {
                continue;
            }
            match (o.op.kind, o.code) {
                (OperationKind::Prune, ResultCode::Pruned) => deleting.push(o.op.resource.clone()),
                (OperationKind::Create | OperationKind::Update, ResultCode::Synced) => self.applied.push(o.op.resource.clone()),
                _ => {}
            }
        }
        if let Some(e) = fatal {
            return Err(Stop::Error(e.to_string()));
        }
        if failed.is_none() && !bucket.hooks.is_empty() {
            match self.run_hooks(bucket.hooks).await {
                HookEnd::Completed => {}
                HookEnd::Failed(msg) => failed = Some(msg),
                HookEnd::Cancelled => return Err(Stop::Terminated),
                HookEnd::Error(msg) => return Err(Stop::Error(msg)),
            }
        }
        if let Some(msg) = failed {
            return Err(Stop::Failed(msg));
        }
        if bucket.stage == Stage::Prune && !deleting.is_empty() {
            self.await_gone(deleting).await?;
        }
        Ok(())
    }

    async fn run_hooks(&mut self, ops: Vec<PendingOperation>) -> HookEnd {
        let ctx = hooks::HookContext {
            executor: &self.executor,
            exec: &self.exec,
            health: &self.app.health,
            config: &self.app.config,
        };
        hooks::run(ctx, ops, &mut self.ledger, &mut self.waiter).await
    }

    /// Block until already-applied resources pass the gate, the gate fails, or the
    /// health timeout elapses.
    async fn await_gate(&mut self) -> Result<(), Stop> {
        if self.applied.is_empty() {
            return Ok(());
        }
        let t0 = Instant::now();
        let deadline = t0 + self.app.config.health_timeout;
        loop {
            let mut verdicts = Vec::with_capacity(self.applied.len());
            for r in &self.applied {
                let cluster = &self.app.cluster;
                let (live, _) = self.app.config.retry.run(&r.to_string(), || cluster.get(r)).await;
                match live {
                    Ok(live) => verdicts.push((r, self.app.health.evaluate(live.as_ref()))),
                    Err(e) => return Err(Stop::Error(format!("failed to get live state of {}: {}", r, e))),
                }
            }
            let verdict = gate(verdicts.iter().map(|(r, v)| (*r, v)), self.options.require_healthy);
            let wait = match verdict {
                GateVerdict::Pass => {
                    histogram!("health_gate_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    return Ok(());
                }
                GateVerdict::Fail(msg) => {
                    counter!("health_gate_failed_total", 1u64);
                    return Err(Stop::Failed(msg));
                }
                GateVerdict::Wait(msg) => msg,
            };
            if Instant::now() >= deadline {
                return Err(Stop::Failed(format!("health check timed out: {}", wait)));
            }
            debug!(app = %self.app.name, msg = %wait, "health gate waiting");
            if let Err(e) = self.ledger.set_message(wait) {
                debug!(error = %e, "ledger message not updated");
            }
            if !self.waiter.pause(Some(deadline)).await {
                return Err(Stop::Terminated);
            }
        }
    }

    /// Wait until pruned objects are gone. Finalizers may hold them indefinitely; only
    /// cancellation ends the wait early.
    async fn await_gone(&mut self, targets: Vec<ResourceRef>) -> Result<(), Stop> {
        let mut pending = targets;
        loop {
            let mut still = Vec::new();
            for r in pending {
                let cluster = &self.app.cluster;
                let (live, _) = self.app.config.retry.run(&r.to_string(), || cluster.get(&r)).await;
                match live {
                    Ok(None) => debug!(resource = %r, "prune target gone"),
                    Ok(Some(_)) => still.push(r),
                    Err(e) => return Err(Stop::Error(format!("failed to get live state of {}: {}", r, e))),
                }
            }
            let Some(first) = still.first() else { return Ok(()) };
            let msg = match still.len() {
                1 => format!("waiting for deletion of {}/{}", first.kind.to_lowercase(), first.name),
                n => format!("waiting for deletion of {}/{} and {} more", first.kind.to_lowercase(), first.name, n - 1),
            };
            info!(app = %self.app.name, pending = still.len(), "{}", msg);
            if let Err(e) = self.ledger.await_deletion(msg) {
                debug!(error = %e, "ledger message not updated");
            }
            if !self.waiter.pause(None).await {
                return Err(Stop::Terminated);
            }
            pending = still;
        }
    }

    fn persist(&self, phase: OperationPhase, message: &str, finished: i64) {
        let Some(store) = self.app.store.as_ref() else { return };
        let snap = self.ledger.snapshot();
        let record = AttemptRecord {
            id: self.id.clone(),
            app: self.app.name.clone(),
            started: snap.started,
            finished,
            phase,
            message: message.to_string(),
            results: snap.entries.clone(),
        };
        let t0 = Instant::now();
        match store.put_attempt(&record) {
            Ok(()) => {
                histogram!("ledger_persist_ms", t0.elapsed().as_secs_f64() * 1000.0);
            }
            Err(e) => warn!(app = %self.app.name, id = %self.id, error = %format!("{:#}", e), "persisting attempt failed"),
        }
    }
}
