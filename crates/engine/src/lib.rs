//! Kairo engine: runs wave-ordered sync attempts for an application and keeps the
//! per-attempt result ledger and the aggregate application status.

#![forbid(unsafe_code)]

mod app;
pub mod config;
mod error;
mod hooks;
pub mod ledger;
mod sync;

pub use app::{AppStatus, Application, ApplicationBuilder, ResourceStatus};
pub use config::SyncConfig;
pub use error::EngineError;
pub use ledger::{Ledger, LedgerError, LedgerReader, LedgerSnapshot};
pub use sync::{SyncHandle, SyncOptions, SUCCEEDED, TERMINATED};
