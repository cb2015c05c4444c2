use serde::{Deserialize, Serialize};

use crate::{LiveObject, Manifest, ResourceRef};

/// Failures reported by a cluster collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Network blips, rate limiting, conflicts; worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Invalid spec or admission rejection; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The cluster cannot be reached at all.
    #[error("unreachable: {0}")]
    Unreachable(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool { matches!(self, Self::Transient(_)) }
}

/// Propagation policy used when pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeletePropagation {
    #[default]
    Foreground,
    Background,
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshType {
    /// Re-read live state and recompare against the cached desired state.
    Normal,
    /// Also discard any cached desired state before comparing.
    Hard,
}

/// Desired/live pair for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub reference: ResourceRef,
    pub desired: Option<Manifest>,
    pub live: Option<LiveObject>,
}

/// Already-computed difference between desired and live state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub to_create: Vec<DiffEntry>,
    pub to_update: Vec<DiffEntry>,
    pub to_prune: Vec<DiffEntry>,
    /// Managed resources whose live state already matches.
    pub unchanged: Vec<DiffEntry>,
}

impl Diff {
    pub fn is_out_of_sync(&self) -> bool {
        !(self.to_create.is_empty() && self.to_update.is_empty() && self.to_prune.is_empty())
    }

    /// Every entry, paired with whether it is in sync.
    pub fn entries(&self) -> impl Iterator<Item = (&DiffEntry, bool)> {
        self.to_create
            .iter()
            .chain(self.to_update.iter())
            .chain(self.to_prune.iter())
            .map(|e| (e, false))
            .chain(self.unchanged.iter().map(|e| (e, true)))
    }
}

/// Cluster API surface the engine needs. Implementations must be idempotent on apply.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    async fn apply(&self, manifest: &Manifest) -> Result<ResourceRef, ClusterError>;

    /// Request deletion. Success means the request was accepted, not that the object is gone.
    async fn delete(&self, reference: &ResourceRef, propagation: DeletePropagation) -> Result<(), ClusterError>;

    async fn get(&self, reference: &ResourceRef) -> Result<Option<LiveObject>, ClusterError>;

    /// Remove the tracking label so the object is no longer owned by the application.
    async fn untrack(&self, reference: &ResourceRef, label: &str) -> Result<(), ClusterError>;

    /// Live objects carrying `label=instance`.
    async fn list_tracked(&self, label: &str, instance: &str) -> Result<Vec<LiveObject>, ClusterError>;

    /// Whether objects of group/kind live in a namespace. Kinds the cluster does not
    /// serve are reported as Rejected.
    async fn namespaced(&self, group: &str, kind: &str) -> Result<bool, ClusterError>;
}

/// Source of the desired-vs-live difference for one application.
#[async_trait::async_trait]
pub trait DiffProvider: Send + Sync {
    async fn diff(&self, refresh: RefreshType) -> anyhow::Result<Diff>;
}
