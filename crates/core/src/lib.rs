//! Kairo core types: resource identity, statuses, per-operation results and the
//! collaborator traits the engine is driven through.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod annotations;
mod cluster;
mod manifest;

pub use cluster::{Cluster, ClusterError, DeletePropagation, Diff, DiffEntry, DiffProvider, RefreshType};
pub use manifest::{LiveObject, Manifest, ManifestError};

/// Ordering key attached to a resource. Lower waves apply first, higher waves prune first.
pub type SyncWave = i32;

/// Identity of a resource across desired manifests, live objects and ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    pub fn is(&self, kind: &str, name: &str) -> bool {
        self.kind == kind && self.name == name
    }
}

// Stable tie-break key inside a wave: kind, then name.
impl Ord for ResourceRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.group.cmp(&other.group))
    }
}

impl PartialOrd for ResourceRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.kind, self.namespace.as_deref().unwrap_or(""), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Prune,
    Hook,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Prune => "Prune",
            Self::Hook => "Hook",
        }
    }
}

impl FromStr for OperationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Self::Create),
            "Update" => Ok(Self::Update),
            "Prune" => Ok(Self::Prune),
            "Hook" => Ok(Self::Hook),
            other => Err(format!("unknown operation kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Synced,
    Pruned,
    PruneSkipped,
    SyncFailed,
    Unknown,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "Synced",
            Self::Pruned => "Pruned",
            Self::PruneSkipped => "PruneSkipped",
            Self::SyncFailed => "SyncFailed",
            Self::Unknown => "Unknown",
        }
    }

    pub fn is_failure(self) -> bool { matches!(self, Self::SyncFailed) }
}

impl FromStr for ResultCode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Synced" => Ok(Self::Synced),
            "Pruned" => Ok(Self::Pruned),
            "PruneSkipped" => Ok(Self::PruneSkipped),
            "SyncFailed" => Ok(Self::SyncFailed),
            "Unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown result code: {}", other)),
        }
    }
}

/// Health of one live resource, or of an application by aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Missing,
    Suspended,
    Unknown,
}

impl HealthStatus {
    /// Aggregation precedence: Degraded > Progressing > Missing > Unknown > Suspended > Healthy.
    pub fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Suspended => 1,
            Self::Unknown => 2,
            Self::Missing => 3,
            Self::Progressing => 4,
            Self::Degraded => 5,
        }
    }

    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() { other } else { self }
    }

    /// Worst status in the set; an empty set is Healthy.
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(iter: I) -> Self {
        iter.into_iter().fold(Self::Healthy, Self::worst)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Progressing => "Progressing",
            Self::Degraded => "Degraded",
            Self::Missing => "Missing",
            Self::Suspended => "Suspended",
            Self::Unknown => "Unknown",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Healthy" => Ok(Self::Healthy),
            "Progressing" => Ok(Self::Progressing),
            "Degraded" => Ok(Self::Degraded),
            "Missing" => Ok(Self::Missing),
            "Suspended" => Ok(Self::Suspended),
            "Unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

/// Health status plus an optional human readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthVerdict {
    pub fn new(status: HealthStatus) -> Self { Self { status, message: None } }

    pub fn with_message(status: HealthStatus, message: impl Into<String>) -> Self {
        Self { status, message: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "Synced",
            Self::OutOfSync => "OutOfSync",
        }
    }
}

/// State of one sync attempt. Running is the entry state; the others are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Succeeded,
    Failed,
    Error,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool { !matches!(self, Self::Running) }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Error => "Error",
        }
    }
}

impl FromStr for OperationPhase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown operation phase: {}", other)),
        }
    }
}

/// Lifecycle phase a hook resource runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookPhase {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreSync => "PreSync",
            Self::Sync => "Sync",
            Self::PostSync => "PostSync",
            Self::SyncFail => "SyncFail",
        }
    }
}

impl FromStr for HookPhase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PreSync" => Ok(Self::PreSync),
            "Sync" => Ok(Self::Sync),
            "PostSync" => Ok(Self::PostSync),
            "SyncFail" => Ok(Self::SyncFail),
            other => Err(format!("unknown hook phase: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    HookSucceeded,
    HookFailed,
    BeforeHookCreation,
}

impl FromStr for HookDeletePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "HookSucceeded" => Ok(Self::HookSucceeded),
            "HookFailed" => Ok(Self::HookFailed),
            "BeforeHookCreation" => Ok(Self::BeforeHookCreation),
            other => Err(format!("unknown hook delete policy: {}", other)),
        }
    }
}

/// One ledger entry: the outcome of a single operation on a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub resource: ResourceRef,
    pub operation: OperationKind,
    pub code: ResultCode,
    pub message: String,
    pub wave: SyncWave,
    pub hook_phase: Option<HookPhase>,
    /// Calls issued against the cluster, retries included.
    pub attempts: u32,
    /// Seconds since epoch when the entry was recorded.
    pub ts: i64,
}

pub mod prelude {
    pub use super::{
        Cluster, ClusterError, DeletePropagation, Diff, DiffEntry, DiffProvider, HealthStatus, HealthVerdict, HookDeletePolicy,
        HookPhase, LiveObject, Manifest, OperationKind, OperationPhase, OperationResult, RefreshType, ResourceRef, ResultCode,
        SyncStatus, SyncWave,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_uses_worst_case_precedence() {
        use HealthStatus::*;
        assert_eq!(HealthStatus::aggregate(Vec::new()), Healthy);
        assert_eq!(HealthStatus::aggregate([Healthy, Suspended]), Suspended);
        assert_eq!(HealthStatus::aggregate([Healthy, Unknown, Suspended]), Unknown);
        assert_eq!(HealthStatus::aggregate([Healthy, Missing, Unknown]), Missing);
        assert_eq!(HealthStatus::aggregate([Missing, Progressing]), Progressing);
        assert_eq!(HealthStatus::aggregate([Progressing, Degraded, Healthy]), Degraded);
    }

    #[test]
    fn refs_order_by_kind_then_name() {
        let mut refs = vec![
            ResourceRef::new("", "Pod", Some("ns"), "b"),
            ResourceRef::new("apps", "Deployment", Some("ns"), "z"),
            ResourceRef::new("", "Pod", Some("ns"), "a"),
        ];
        refs.sort();
        let names: Vec<_> = refs.iter().map(|r| format!("{}:{}", r.kind, r.name)).collect();
        assert_eq!(names, vec!["Deployment:z", "Pod:a", "Pod:b"]);
    }

    #[test]
    fn hook_phase_parses_trimmed_names() {
        assert_eq!(" PostSync".parse::<HookPhase>().unwrap(), HookPhase::PostSync);
        assert!("Later".parse::<HookPhase>().is_err());
    }
}
