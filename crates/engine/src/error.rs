use kairo_core::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("comparison failed: {0:#}")]
    DiffProvider(anyhow::Error),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("ledger store: {0:#}")]
    Store(anyhow::Error),
    #[error("another operation is already in progress for {0}")]
    AlreadyRunning(String),
}
