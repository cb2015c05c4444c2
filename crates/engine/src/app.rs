//! Application aggregate: owns the collaborators, the last computed status and the
//! most recent operation.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use kairo_core::annotations::HOOK;
use kairo_core::{
    Cluster, ClusterError, DiffProvider, HealthStatus, HealthVerdict, Manifest, RefreshType, ResourceRef, SyncStatus, SyncWave,
};
use kairo_health::HealthRegistry;
use kairo_persist::{now_ts, AttemptRecord, LedgerStore};
use kairo_plan::graph::parse_wave;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::EngineError;
use crate::ledger::LedgerSnapshot;
use crate::sync::{Coordinator, SyncHandle, SyncOptions};

/// Status row for one managed (or formerly managed) resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub resource: ResourceRef,
    pub sync: SyncStatus,
    pub health: HealthVerdict,
    pub wave: SyncWave,
    pub hook: bool,
    /// Live only; removed by the next sync with pruning enabled.
    pub requires_pruning: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub sync: SyncStatus,
    pub health: HealthStatus,
    pub resources: Vec<ResourceStatus>,
    /// Seconds since epoch of the refresh that produced this status; None before the first.
    pub refreshed: Option<i64>,
}

impl Default for AppStatus {
    fn default() -> Self {
        Self { sync: SyncStatus::OutOfSync, health: HealthStatus::Unknown, resources: Vec::new(), refreshed: None }
    }
}

impl AppStatus {
    pub fn resource(&self, kind: &str, name: &str) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| r.resource.is(kind, name))
    }
}

pub(crate) struct AppInner {
    pub(crate) name: String,
    pub(crate) diff: Arc<dyn DiffProvider>,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) health: HealthRegistry,
    pub(crate) config: SyncConfig,
    pub(crate) store: Option<Arc<dyn LedgerStore>>,
    pub(crate) refresh_tx: watch::Sender<u64>,
    status: ArcSwap<AppStatus>,
    operation: Mutex<Option<SyncHandle>>,
}

/// Cluster failures keep their type so callers can tell an outage from a bad manifest.
fn diff_error(e: anyhow::Error) -> EngineError {
    match e.downcast::<ClusterError>() {
        Ok(cluster) => EngineError::Cluster(cluster),
        Err(other) => EngineError::DiffProvider(other),
    }
}

fn is_hook(obj: Option<&Manifest>) -> bool { obj.and_then(|m| m.annotation(HOOK)).is_some() }

impl AppInner {
    fn operation(&self) -> MutexGuard<'_, Option<SyncHandle>> { self.operation.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Recompute sync and health for every resource, publish the result and wake any
    /// coordinator waiting on it.
    pub(crate) async fn refresh_status(&self, refresh: RefreshType) -> Result<Arc<AppStatus>, EngineError> {
        let diff = self.diff.diff(refresh).await.map_err(diff_error)?;
        let mut resources = Vec::new();
        for (entry, in_sync) in diff.entries() {
            let hook = is_hook(entry.desired.as_ref()) || is_hook(entry.live.as_ref());
            let wave = entry.desired.as_ref().or(entry.live.as_ref()).and_then(|m| parse_wave(m).ok()).unwrap_or(0);
            resources.push(ResourceStatus {
                resource: entry.reference.clone(),
                sync: if in_sync { SyncStatus::Synced } else { SyncStatus::OutOfSync },
                health: self.health.evaluate(entry.live.as_ref()),
                wave,
                hook,
                requires_pruning: entry.desired.is_none(),
            });
        }
        resources.sort_by(|a, b| a.resource.cmp(&b.resource));

        let counted = resources.iter().filter(|r| !r.hook);
        let sync = if counted.clone().any(|r| r.sync == SyncStatus::OutOfSync) { SyncStatus::OutOfSync } else { SyncStatus::Synced };
        let health = HealthStatus::aggregate(counted.filter(|r| !r.requires_pruning).map(|r| r.health.status));
        let status = Arc::new(AppStatus { sync, health, resources, refreshed: Some(now_ts()) });
        debug!(app = %self.name, ?refresh, sync = sync.as_str(), health = health.as_str(), "refreshed");
        self.status.store(Arc::clone(&status));
        self.refresh_tx.send_modify(|e| *e = e.wrapping_add(1));
        Ok(status)
    }
}

pub struct ApplicationBuilder {
    name: String,
    diff: Arc<dyn DiffProvider>,
    cluster: Arc<dyn Cluster>,
    health: HealthRegistry,
    config: Option<SyncConfig>,
    store: Option<Arc<dyn LedgerStore>>,
}

impl ApplicationBuilder {
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Application {
        let (refresh_tx, _) = watch::channel(0u64);
        Application {
            inner: Arc::new(AppInner {
                name: self.name,
                diff: self.diff,
                cluster: self.cluster,
                health: self.health,
                config: self.config.unwrap_or_else(SyncConfig::from_env),
                store: self.store,
                refresh_tx,
                status: ArcSwap::from_pointee(AppStatus::default()),
                operation: Mutex::new(None),
            }),
        }
    }
}

/// One application: a desired state, the cluster it lands in, and its sync history.
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

impl Application {
    pub fn builder(name: &str, diff: Arc<dyn DiffProvider>, cluster: Arc<dyn Cluster>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.to_string(),
            diff,
            cluster,
            health: HealthRegistry::with_builtins(),
            config: None,
            store: None,
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn config(&self) -> &SyncConfig { &self.inner.config }

    /// Start a sync attempt on a new task. Only one attempt runs at a time.
    pub fn start_sync(&self, options: SyncOptions) -> Result<SyncHandle, EngineError> {
        let mut current = self.inner.operation();
        if let Some(running) = current.as_ref() {
            if !running.phase().is_terminal() {
                return Err(EngineError::AlreadyRunning(self.inner.name.clone()));
            }
        }
        let handle = Coordinator::spawn(Arc::clone(&self.inner), options);
        info!(app = %self.inner.name, id = %handle.id(), "sync requested");
        *current = Some(handle.clone());
        Ok(handle)
    }

    pub async fn refresh(&self, refresh: RefreshType) -> Result<Arc<AppStatus>, EngineError> {
        self.inner.refresh_status(refresh).await
    }

    /// Status from the most recent refresh.
    pub fn status(&self) -> Arc<AppStatus> { self.inner.status.load_full() }

    pub fn aggregate_status(&self) -> (SyncStatus, HealthStatus) {
        let s = self.inner.status.load();
        (s.sync, s.health)
    }

    pub fn resource(&self, kind: &str, name: &str) -> Option<ResourceStatus> {
        self.inner.status.load().resource(kind, name).cloned()
    }

    /// Ledger of the most recent attempt, running or finished.
    pub fn operation(&self) -> Option<Arc<LedgerSnapshot>> { self.inner.operation().as_ref().map(|h| h.snapshot()) }

    pub fn history(&self, limit: Option<usize>) -> Result<Vec<AttemptRecord>, EngineError> {
        match self.inner.store.as_ref() {
            Some(store) => store.history(&self.inner.name, limit).map_err(EngineError::Store),
            None => Ok(Vec::new()),
        }
    }
}
