//! Kairo apply: executes pending operations against a cluster, loads manifests and
//! compares desired with live state.

#![forbid(unsafe_code)]

pub mod compare;
pub mod executor;
pub mod load;
pub mod retry;
pub mod strategy;

pub use compare::{compare, drift, in_sync, DirSource, Drift, ManifestDiffer, ManifestSource, StaticSource};
pub use executor::{ExecContext, Executor, Outcome};
pub use load::{load_dir, parse_manifests, parse_manifests_with, LoadLimits};
pub use retry::RetryPolicy;
pub use strategy::{strategy_for, OperationStrategy, StepResult};
