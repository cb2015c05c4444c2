#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kairo_apply::{ManifestDiffer, StaticSource};
use kairo_core::{Cluster, HealthStatus, HealthVerdict, LiveObject, Manifest};
use kairo_engine::{Application, LedgerSnapshot, SyncConfig, SyncHandle};
use kairo_health::HealthRegistry;
use kairo_kubehub::MemCluster;
use serde_json::{json, Value as Json};

pub const APP: &str = "demo";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

pub struct Fixture {
    pub cluster: Arc<MemCluster>,
    pub source: Arc<StaticSource>,
    pub app: Application,
}

pub fn manifest(v: Json) -> Manifest { Manifest::from_value(v).unwrap() }

fn annotated(mut m: Manifest, wave: Option<i32>) -> Manifest {
    if let Some(w) = wave {
        m.set_annotation("kairo.dev/sync-wave", &w.to_string());
    }
    m
}

pub fn cm(name: &str, wave: Option<i32>) -> Manifest {
    annotated(manifest(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": name}})), wave)
}

pub fn pod(name: &str, wave: Option<i32>) -> Manifest {
    annotated(
        manifest(json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": name},
            "spec": {"containers": [{"name": "main", "image": "nginx:1.25"}]}
        })),
        wave,
    )
}

pub fn deployment(name: &str, wave: Option<i32>) -> Manifest {
    annotated(
        manifest(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": name},
            "spec": {
                "replicas": 1,
                "progressDeadlineSeconds": 1,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {"containers": [{"name": "main", "image": "example.com/does-not-exist:latest"}]}
                }
            }
        })),
        wave,
    )
}

pub fn job_hook(name: &str, phases: &str) -> Manifest {
    let mut m = manifest(json!({
        "apiVersion": "batch/v1", "kind": "Job",
        "metadata": {"name": name},
        "spec": {"template": {"spec": {"restartPolicy": "Never", "containers": [{"name": "main", "image": "busybox"}]}}}
    }));
    m.set_annotation("kairo.dev/hook", phases);
    m
}

pub fn cm_hook(name: &str, phases: &str) -> Manifest {
    let mut m = cm(name, None);
    m.set_annotation("kairo.dev/hook", phases);
    m
}

/// Live object already owned by the application.
pub fn tracked(mut m: Manifest) -> Manifest {
    m.set_label(INSTANCE_LABEL, APP);
    m
}

/// Builtins plus a ConfigMap assessor driven by the `example.com/health` annotation.
pub fn health() -> HealthRegistry {
    let mut h = HealthRegistry::with_builtins();
    h.register("", "ConfigMap", |o: &LiveObject| match o.annotation("example.com/health") {
        Some("Degraded") => Some(HealthVerdict::with_message(HealthStatus::Degraded, "marked degraded")),
        Some("Progressing") => Some(HealthVerdict::new(HealthStatus::Progressing)),
        _ => None,
    });
    h
}

pub fn fixture(desired: Vec<Manifest>) -> Fixture { fixture_with(desired, SyncConfig::fast()) }

pub fn fixture_with(desired: Vec<Manifest>, config: SyncConfig) -> Fixture {
    let cluster = Arc::new(MemCluster::new());
    let source = Arc::new(StaticSource::new(desired));
    let dyn_cluster: Arc<dyn Cluster> = cluster.clone();
    let differ = ManifestDiffer::new(Arc::clone(&source), Arc::clone(&dyn_cluster), APP, Some("default"));
    let app = Application::builder(APP, Arc::new(differ), dyn_cluster).health(health()).config(config).build();
    Fixture { cluster, source, app }
}

/// Wait for the attempt to finish, failing the test after five seconds.
pub async fn finish(h: &SyncHandle) -> Arc<LedgerSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), h.wait()).await.expect("sync did not finish in time")
}

/// Wait until `pred` holds for the ledger.
pub async fn wait_for(h: &SyncHandle, pred: impl Fn(&LedgerSnapshot) -> bool) -> Arc<LedgerSnapshot> {
    let mut rx = h.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let s = h.snapshot();
            if pred(&s) {
                return s;
            }
            if rx.changed().await.is_err() {
                return h.snapshot();
            }
        }
    });
    waited.await.expect("ledger condition not reached in time")
}
