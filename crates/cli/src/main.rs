use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kairo_apply::{DirSource, ManifestDiffer};
use kairo_core::{Cluster, DiffProvider, OperationPhase, OperationResult, RefreshType};
use kairo_engine::{AppStatus, Application, LedgerSnapshot, SyncOptions};
use kairo_kubehub::KubeCluster;
use kairo_persist::{AttemptRecord, LedgerStore, SqliteLedgerStore};
use kairo_plan::{BuildOptions, Schedule};
use metrics::counter;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kairoctl", version, about = "Kairo CLI: wave-ordered sync of a manifest directory")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,
    /// Namespace for manifests without one (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync a manifest directory into the cluster, wave by wave
    Sync {
        /// Directory with YAML manifests
        dir: PathBuf,
        /// Application name; also the tracking label value
        #[arg(long = "app")]
        app: String,
        /// Delete tracked objects that are no longer in the directory
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
        /// Do not wait for health between waves
        #[arg(long = "async", action = ArgAction::SetTrue)]
        async_mode: bool,
        /// Plan and record results without touching the cluster
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Treat Progressing as blocking at the health gate
        #[arg(long = "require-healthy", action = ArgAction::SetTrue)]
        require_healthy: bool,
        /// Skip resources whose live state already matches
        #[arg(long = "apply-out-of-sync-only", action = ArgAction::SetTrue)]
        apply_out_of_sync_only: bool,
    },
    /// Show per-resource sync and health for an application
    Status {
        dir: PathBuf,
        #[arg(long = "app")]
        app: String,
    },
    /// Print the buckets a sync would run, in order
    Plan {
        dir: PathBuf,
        #[arg(long = "app")]
        app: String,
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Show persisted sync attempts, newest first
    History {
        #[arg(long = "app")]
        app: String,
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("KAIRO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAIRO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KAIRO_METRICS_ADDR; expected host:port");
        }
    }
}

struct Wiring {
    cluster: Arc<dyn Cluster>,
    diff: Arc<dyn DiffProvider>,
}

async fn wire(dir: PathBuf, app: &str, namespace: Option<&str>) -> Result<Wiring> {
    let kube = KubeCluster::connect().await.context("connecting to cluster")?;
    let ns = namespace.map(|s| s.to_string()).unwrap_or_else(|| kube.default_namespace().to_string());
    let cluster: Arc<dyn Cluster> = Arc::new(kube);
    let diff: Arc<dyn DiffProvider> = Arc::new(ManifestDiffer::new(DirSource::new(dir), Arc::clone(&cluster), app, Some(ns.as_str())));
    Ok(Wiring { cluster, diff })
}

fn open_store() -> Option<Arc<dyn LedgerStore>> {
    match SqliteLedgerStore::open_default() {
        Ok(s) => Some(Arc::new(s)),
        Err(e) => {
            warn!(error = %e, "ledger store unavailable; history will not be kept");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Sync { dir, app, prune, async_mode, dry_run, require_healthy, apply_out_of_sync_only } => {
            info!(app = %app, dir = %dir.display(), prune, dry_run, "sync invoked");
            let w = wire(dir, &app, ns).await?;
            let mut builder = Application::builder(&app, w.diff, w.cluster);
            if let Some(store) = open_store() {
                builder = builder.store(store);
            }
            let application = builder.build();
            application.refresh(RefreshType::Hard).await?;
            let options = SyncOptions { prune, async_mode, dry_run, apply_out_of_sync_only, require_healthy };
            let handle = application.start_sync(options)?;

            // In async mode a deletion held by finalizers does not keep the CLI waiting.
            let done = async {
                if async_mode { handle.wait_settled().await } else { handle.wait().await }
            };
            let snap = tokio::select! {
                snap = done => snap,
                _ = signal::ctrl_c() => {
                    info!("Ctrl-C received; terminating sync");
                    handle.terminate();
                    handle.wait().await
                }
            };
            counter!("cli_sync_total", 1u64, "phase" => snap.phase.as_str());
            match cli.output {
                Output::Human => print_snapshot(&snap),
                Output::Json => println!("{}", serde_json::to_string_pretty(&*snap)?),
            }
            if snap.phase == OperationPhase::Running {
                info!(id = %snap.id, msg = %snap.message, "sync still running; not waiting for deletions");
            }
            let code = exit_code(&snap);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { dir, app } => {
            info!(app = %app, dir = %dir.display(), "status invoked");
            let w = wire(dir, &app, ns).await?;
            let application = Application::builder(&app, w.diff, w.cluster).build();
            let status = application.refresh(RefreshType::Hard).await?;
            match cli.output {
                Output::Human => print_status(&status),
                Output::Json => println!("{}", serde_json::to_string_pretty(&*status)?),
            }
        }
        Commands::Plan { dir, app, prune } => {
            info!(app = %app, dir = %dir.display(), "plan invoked");
            let w = wire(dir, &app, ns).await?;
            let diff = w.diff.diff(RefreshType::Hard).await?;
            let graph = kairo_plan::build(&diff, BuildOptions::default());
            for warning in &graph.warnings {
                eprintln!("warning: {}", warning);
            }
            let schedule = Schedule::from_graph(graph);
            let buckets: Vec<_> =
                schedule.infos().iter().filter(|b| prune || b.stage != kairo_plan::Stage::Prune).cloned().collect();
            match cli.output {
                Output::Human => {
                    println!("{:<9} {:>5}  RESOURCES", "STAGE", "WAVE");
                    for b in &buckets {
                        let names: Vec<_> = b.resources.iter().map(short_ref).collect();
                        println!("{:<9} {:>5}  {}", format!("{:?}", b.stage), b.wave, names.join(", "));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&buckets)?),
            }
        }
        Commands::History { app, limit } => {
            let store = SqliteLedgerStore::open_default()?;
            let attempts = store.history(&app, Some(limit))?;
            match cli.output {
                Output::Human => print_history(&attempts),
                Output::Json => println!("{}", serde_json::to_string_pretty(&attempts)?),
            }
        }
    }

    Ok(())
}

/// Process exit status for a sync. A Running snapshot only comes back in async mode,
/// when nothing but deletions is outstanding.
fn exit_code(snap: &LedgerSnapshot) -> i32 {
    match snap.phase {
        OperationPhase::Succeeded | OperationPhase::Running => 0,
        OperationPhase::Failed | OperationPhase::Error => 1,
    }
}

fn short_ref(r: &kairo_core::ResourceRef) -> String { format!("{}/{}", r.kind.to_lowercase(), r.name) }

fn print_results(entries: &[OperationResult]) {
    println!("{:>4} {:>5}  {:<8} {:<10} {:<32} MESSAGE", "#", "WAVE", "OP", "RESULT", "RESOURCE");
    for (i, e) in entries.iter().enumerate() {
        let what = match e.hook_phase {
            Some(p) => format!("{} ({})", short_ref(&e.resource), p.as_str()),
            None => short_ref(&e.resource),
        };
        println!("{:>4} {:>5}  {:<8} {:<10} {:<32} {}", i + 1, e.wave, e.operation.as_str(), e.code.as_str(), what, e.message);
    }
}

fn print_snapshot(snap: &LedgerSnapshot) {
    print_results(snap.entries());
    println!();
    println!("operation {}: {} {}", snap.id, snap.phase.as_str(), snap.message);
}

fn print_status(status: &AppStatus) {
    println!("{:<32} {:>5}  {:<10} {:<12} MESSAGE", "RESOURCE", "WAVE", "SYNC", "HEALTH");
    for r in status.resources.iter().filter(|r| !r.hook) {
        let sync = if r.requires_pruning { "Prune" } else { r.sync.as_str() };
        let msg = r.health.message.as_deref().unwrap_or("");
        println!("{:<32} {:>5}  {:<10} {:<12} {}", short_ref(&r.resource), r.wave, sync, r.health.status.as_str(), msg);
    }
    println!();
    println!("sync: {}  health: {}", status.sync.as_str(), status.health.as_str());
}

fn print_history(attempts: &[AttemptRecord]) {
    if attempts.is_empty() {
        println!("(no attempts recorded)");
        return;
    }
    println!("{:<38} {:<10} {:>8} {:>7}  MESSAGE", "ID", "PHASE", "SECONDS", "RESULTS");
    for a in attempts {
        let took = (a.finished - a.started).max(0);
        println!("{:<38} {:<10} {:>8} {:>7}  {}", a.id, a.phase.as_str(), took, a.results.len(), a.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from(["kairoctl", "-o", "json", "sync", "./deploy", "--app", "demo", "--prune", "--dry-run"])
            .unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Sync { dir, app, prune, async_mode, dry_run, .. } => {
                assert_eq!(dir, PathBuf::from("./deploy"));
                assert_eq!(app, "demo");
                assert!(prune && dry_run && !async_mode);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_namespace_after_subcommand() {
        let cli = Cli::try_parse_from(["kairoctl", "history", "--app", "demo", "--ns", "team-a"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("team-a"));
        assert!(matches!(cli.command, Commands::History { limit: 10, .. }));
    }

    fn snapshot_in(phase: OperationPhase) -> LedgerSnapshot {
        LedgerSnapshot {
            id: "op".into(),
            epoch: 3,
            phase,
            message: String::new(),
            started: 0,
            finished: None,
            awaiting_deletion: phase == OperationPhase::Running,
            entries: Vec::new(),
        }
    }

    #[test]
    fn only_failed_syncs_exit_nonzero() {
        assert_eq!(exit_code(&snapshot_in(OperationPhase::Succeeded)), 0);
        assert_eq!(exit_code(&snapshot_in(OperationPhase::Running)), 0);
        assert_eq!(exit_code(&snapshot_in(OperationPhase::Failed)), 1);
        assert_eq!(exit_code(&snapshot_in(OperationPhase::Error)), 1);
    }

    #[test]
    fn app_is_required() {
        assert!(Cli::try_parse_from(["kairoctl", "status", "./deploy"]).is_err());
    }
}
