mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kairo_apply::{ManifestDiffer, StaticSource};
use kairo_core::{Cluster, ClusterError, HookPhase, OperationKind, OperationPhase, RefreshType, ResourceRef, ResultCode, SyncStatus};
use kairo_engine::{Application, EngineError, SyncConfig, SyncOptions, TERMINATED};
use kairo_kubehub::{Call, MemCluster};
use kairo_persist::SqliteLedgerStore;
use serde_json::{json, Value as Json};

#[tokio::test]
async fn transient_errors_retry_and_exhaustion_spares_siblings() {
    let f = fixture(vec![cm("flaky", None), cm("broken", None), cm("fine", None), cm("later", Some(1))]);
    f.cluster.fail(Call::Apply, "ConfigMap", "flaky", 2, ClusterError::Transient("etcdserver: leader changed".into()));
    f.cluster.fail(Call::Apply, "ConfigMap", "broken", 10, ClusterError::Transient("connection reset by peer".into()));

    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Failed);
    assert_eq!(snap.len(), 3);
    let flaky = snap.latest("ConfigMap", "flaky").unwrap();
    assert_eq!((flaky.code, flaky.attempts), (ResultCode::Synced, 3));
    let broken = snap.latest("ConfigMap", "broken").unwrap();
    assert_eq!((broken.code, broken.attempts), (ResultCode::SyncFailed, 3));
    assert_eq!(snap.latest("ConfigMap", "fine").map(|e| e.code), Some(ResultCode::Synced));
    assert!(snap.latest("ConfigMap", "later").is_none());
    assert!(snap.message.contains("connection reset by peer"), "{}", snap.message);
}

#[tokio::test]
async fn rejected_apply_fails_without_retry_and_skips_post_sync() {
    let f = fixture(vec![cm("bad", None), cm_hook("after", "PostSync")]);
    f.cluster.fail(Call::Apply, "ConfigMap", "bad", 1, ClusterError::Rejected("admission webhook denied the request".into()));

    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Failed);
    let bad = snap.latest("ConfigMap", "bad").unwrap();
    assert_eq!((bad.code, bad.attempts), (ResultCode::SyncFailed, 1));
    assert!(snap.latest("ConfigMap", "after").is_none());
    assert!(!f.cluster.contains("ConfigMap", "after"));
}

#[tokio::test]
async fn post_sync_hook_runs_last_and_honours_delete_policy() {
    let mut hook = cm_hook("notify", "PostSync");
    hook.set_annotation("kairo.dev/hook-delete-policy", "HookSucceeded");
    let f = fixture(vec![hook, cm("app", None)]);

    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Succeeded, "{}", snap.message);
    assert_eq!(snap.entries[0].resource.name, "app");
    let notify = snap.latest("ConfigMap", "notify").unwrap();
    assert_eq!(notify.operation, OperationKind::Hook);
    assert_eq!(notify.hook_phase, Some(HookPhase::PostSync));
    assert_eq!(notify.code, ResultCode::Synced);
    assert!(!f.cluster.contains("ConfigMap", "notify"));
    // Hooks do not count towards sync status.
    assert_eq!(f.app.aggregate_status().0, SyncStatus::Synced);
}

#[tokio::test]
async fn failed_pre_sync_hook_stops_every_wave_and_runs_sync_fail() {
    let f = fixture(vec![job_hook("migrate", "PreSync"), cm("app", None), cm_hook("cleanup", "SyncFail")]);
    f.cluster.set_controller(Some(Arc::new(|obj: &mut Json| {
        if obj["kind"] == "Job" {
            obj["status"] = json!({
                "failed": 1,
                "conditions": [{
                    "type": "Failed",
                    "status": "True",
                    "reason": "BackoffLimitExceeded",
                    "message": "Job has reached the specified backoff limit"
                }]
            });
        }
    })));

    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Failed);
    let migrate = snap.latest("Job", "migrate").unwrap();
    assert_eq!(migrate.code, ResultCode::SyncFailed);
    assert_eq!(migrate.hook_phase, Some(HookPhase::PreSync));
    assert_eq!(migrate.message, "Job has reached the specified backoff limit");
    assert!(snap.latest("ConfigMap", "app").is_none());
    assert!(!f.cluster.contains("ConfigMap", "app"));
    let cleanup = snap.latest("ConfigMap", "cleanup").unwrap();
    assert_eq!((cleanup.code, cleanup.hook_phase), (ResultCode::Synced, Some(HookPhase::SyncFail)));
}

#[tokio::test]
async fn pre_sync_hook_completes_before_waves() {
    let f = fixture(vec![cm("app", None), job_hook("migrate", "PreSync")]);
    f.cluster.set_controller(Some(kairo_kubehub::ready_controller()));

    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Succeeded, "{}", snap.message);
    let names: Vec<_> = snap.entries.iter().map(|e| e.resource.name.as_str()).collect();
    assert_eq!(names, vec!["migrate", "app"]);
    assert!(f.cluster.contains("Job", "migrate"));
}

#[tokio::test]
async fn hook_deleted_while_running_fails_without_waiting_for_timeout() {
    let f = fixture(vec![job_hook("migrate", "PreSync"), cm("app", None)]);
    let h = f.app.start_sync(SyncOptions::default()).unwrap();
    wait_for(&h, |s| s.message.contains("waiting for completion of hook job/migrate")).await;

    let job = ResourceRef::new("batch", "Job", Some("default"), "migrate");
    f.cluster.delete(&job, kairo_core::DeletePropagation::Background).await.unwrap();
    let snap = tokio::time::timeout(Duration::from_secs(1), h.wait()).await.expect("hook wait ran to the timeout");

    assert_eq!(snap.phase, OperationPhase::Failed);
    let migrate = snap.latest("Job", "migrate").unwrap();
    assert_eq!(migrate.code, ResultCode::SyncFailed);
    assert!(migrate.message.contains("deleted before completion"), "{}", migrate.message);
    assert!(snap.latest("ConfigMap", "app").is_none());
}

fn slow_pair() -> Vec<kairo_core::Manifest> {
    let mut slow = cm("slow", Some(1));
    slow.set_annotation("example.com/health", "Progressing");
    vec![slow, cm("next", Some(2))]
}

#[tokio::test]
async fn progressing_passes_the_gate_unless_healthy_is_required() {
    let f = fixture(slow_pair());
    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Succeeded);
    assert_eq!(snap.len(), 2);
}

#[tokio::test]
async fn terminate_stops_later_buckets() {
    let f = fixture(slow_pair());
    let h = f.app.start_sync(SyncOptions { require_healthy: true, ..Default::default() }).unwrap();
    wait_for(&h, |s| s.latest("ConfigMap", "slow").is_some() && s.message.starts_with("waiting")).await;
    assert_eq!(h.phase(), OperationPhase::Running);

    h.terminate();
    let snap = finish(&h).await;
    assert_eq!(snap.phase, OperationPhase::Failed);
    assert_eq!(snap.message, TERMINATED);
    assert!(snap.latest("ConfigMap", "next").is_none());
}

#[tokio::test]
async fn health_gate_times_out() {
    let config = SyncConfig { health_timeout: Duration::from_millis(50), ..SyncConfig::fast() };
    let f = fixture_with(slow_pair(), config);
    let snap = finish(&f.app.start_sync(SyncOptions { require_healthy: true, ..Default::default() }).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Failed);
    assert!(snap.message.contains("timed out"), "{}", snap.message);
    assert!(snap.latest("ConfigMap", "next").is_none());
}

#[tokio::test]
async fn prune_disabled_leaves_extra_objects() {
    let f = fixture(vec![cm("keep", None)]);
    f.cluster.insert(tracked(cm("orphan", None)));

    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Succeeded);
    let orphan = snap.latest("ConfigMap", "orphan").unwrap();
    assert_eq!(orphan.code, ResultCode::PruneSkipped);
    assert_eq!(orphan.message, "ignored (requires pruning)");
    assert!(f.cluster.contains("ConfigMap", "orphan"));
    assert_eq!(f.app.aggregate_status().0, SyncStatus::OutOfSync);
    assert!(f.app.resource("ConfigMap", "orphan").unwrap().requires_pruning);
}

#[tokio::test]
async fn preserved_objects_are_untracked_instead_of_deleted() {
    let f = fixture(Vec::new());
    let mut kept = tracked(cm("orphan", None));
    kept.set_annotation("kairo.dev/sync-options", "Prune=false");
    f.cluster.insert(kept);

    let snap = finish(&f.app.start_sync(SyncOptions { prune: true, ..Default::default() }).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Succeeded);
    assert_eq!(snap.latest("ConfigMap", "orphan").map(|e| e.code), Some(ResultCode::PruneSkipped));
    let live = f.cluster.object("ConfigMap", "orphan").unwrap();
    assert!(live.label(INSTANCE_LABEL).is_none());
    assert_eq!(f.app.aggregate_status().0, SyncStatus::Synced);
}

#[tokio::test]
async fn only_one_attempt_at_a_time() {
    let f = fixture(Vec::new());
    let mut held = tracked(pod("held", None));
    held.raw_mut()["metadata"]["finalizers"] = json!(["example.com/block"]);
    f.cluster.insert(held);

    let h = f.app.start_sync(SyncOptions { prune: true, ..Default::default() }).unwrap();
    wait_for(&h, |s| s.latest("Pod", "held").is_some()).await;
    assert!(matches!(f.app.start_sync(SyncOptions::default()), Err(EngineError::AlreadyRunning(_))));

    h.terminate();
    assert_eq!(finish(&h).await.phase, OperationPhase::Failed);
    let next = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(next.phase, OperationPhase::Succeeded);
    assert_eq!(next.latest("Pod", "held").map(|e| e.code), Some(ResultCode::PruneSkipped));
}

#[tokio::test]
async fn dry_run_records_without_touching_the_cluster() {
    let f = fixture(vec![cm("a", None), job_hook("migrate", "PreSync")]);
    f.cluster.insert(tracked(cm("stale", None)));

    let snap = finish(&f.app.start_sync(SyncOptions { prune: true, dry_run: true, ..Default::default() }).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Succeeded, "{}", snap.message);
    assert_eq!(snap.len(), 3);
    assert!(snap.entries.iter().all(|e| e.message.contains("(dry run)")), "{:?}", snap.entries);
    assert!(f.cluster.calls().is_empty());
    assert!(!f.cluster.contains("ConfigMap", "a"));
    assert!(f.cluster.contains("ConfigMap", "stale"));
}

#[tokio::test]
async fn unreachable_cluster_is_an_error() {
    let f = fixture(vec![cm("a", None)]);
    f.cluster.set_unreachable(Some("dial tcp 10.0.0.1:6443: connection refused"));
    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Error);
    assert!(snap.message.starts_with("comparison failed"), "{}", snap.message);
    assert!(snap.is_empty());

    let refreshed = f.app.refresh(RefreshType::Normal).await;
    assert!(matches!(refreshed, Err(EngineError::Cluster(ClusterError::Unreachable(_)))), "{:?}", refreshed.err());
}

#[tokio::test]
async fn unreachable_during_apply_is_an_error() {
    let f = fixture(vec![cm("a", None), cm("b", Some(1))]);
    f.cluster.fail(Call::Apply, "ConfigMap", "a", 1, ClusterError::Unreachable("connection refused".into()));
    let snap = finish(&f.app.start_sync(SyncOptions::default()).unwrap()).await;
    assert_eq!(snap.phase, OperationPhase::Error);
    assert_eq!(snap.latest("ConfigMap", "a").map(|e| e.code), Some(ResultCode::SyncFailed));
    assert!(snap.latest("ConfigMap", "b").is_none());
}

#[tokio::test]
async fn finished_attempts_are_persisted_newest_first() {
    let cluster = Arc::new(MemCluster::new());
    let source = Arc::new(StaticSource::new(vec![cm("a", None)]));
    let dyn_cluster: Arc<dyn Cluster> = cluster.clone();
    let differ = ManifestDiffer::new(Arc::clone(&source), Arc::clone(&dyn_cluster), APP, Some("default"));
    let store = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
    let app = Application::builder(APP, Arc::new(differ), dyn_cluster)
        .health(health())
        .config(SyncConfig::fast())
        .store(store)
        .build();

    let first = finish(&app.start_sync(SyncOptions::default()).unwrap()).await;
    cluster.fail(Call::Apply, "ConfigMap", "a", 1, ClusterError::Rejected("invalid".into()));
    let second = finish(&app.start_sync(SyncOptions::default()).unwrap()).await;

    let history = app.history(None).unwrap();
    assert_eq!(history.len(), 2);
    let ids: Vec<_> = history.iter().map(|a| a.id.as_str()).collect();
    assert!(ids.contains(&first.id.as_str()) && ids.contains(&second.id.as_str()));
    let failed = history.iter().find(|a| a.id == second.id).unwrap();
    assert_eq!(failed.phase, OperationPhase::Failed);
    assert_eq!(failed.results, second.entries);
}
