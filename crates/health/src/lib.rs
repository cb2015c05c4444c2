//! Kairo health: per-kind assessors, worst-case aggregation and the wave gate.
//!
//! Assessment is pull-only. Callers re-poll live objects and hand them to the
//! registry; nothing here watches the cluster or keeps timers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kairo_core::{HealthStatus, HealthVerdict, LiveObject, ResourceRef};
use rustc_hash::FxHashMap;

mod builtin;

pub use builtin::{deployment_health, job_health, pod_health};

/// Maps a live object to a verdict. `None` means the kind has no assessable health.
pub trait HealthAssessor: Send + Sync {
    fn assess(&self, obj: &LiveObject) -> Option<HealthVerdict>;
}

impl<F> HealthAssessor for F
where
    F: Fn(&LiveObject) -> Option<HealthVerdict> + Send + Sync,
{
    fn assess(&self, obj: &LiveObject) -> Option<HealthVerdict> { self(obj) }
}

/// Assessors keyed by (group, kind).
#[derive(Clone, Default)]
pub struct HealthRegistry {
    by_kind: FxHashMap<(String, String), Arc<dyn HealthAssessor>>,
}

impl HealthRegistry {
    pub fn empty() -> Self { Self::default() }

    /// Registry preloaded with Deployment, Pod and Job assessors.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register("apps", "Deployment", deployment_health);
        r.register("", "Pod", pod_health);
        r.register("batch", "Job", job_health);
        r
    }

    /// Register (or replace) the assessor for a kind.
    pub fn register<A: HealthAssessor + 'static>(&mut self, group: &str, kind: &str, assessor: A) {
        self.by_kind.insert((group.to_string(), kind.to_string()), Arc::new(assessor));
    }

    pub fn has(&self, group: &str, kind: &str) -> bool { self.by_kind.contains_key(&(group.to_string(), kind.to_string())) }

    /// Health of one resource given its live object, or `None` when it does not exist.
    pub fn evaluate(&self, live: Option<&LiveObject>) -> HealthVerdict {
        let Some(obj) = live else { return HealthVerdict::new(HealthStatus::Missing) };
        if obj.deletion_timestamp().is_some() {
            return HealthVerdict::with_message(HealthStatus::Progressing, "Pending deletion");
        }
        self.by_kind
            .get(&(obj.group().to_string(), obj.kind().to_string()))
            .and_then(|a| a.assess(obj))
            .unwrap_or_else(|| HealthVerdict::new(HealthStatus::Healthy))
    }
}

/// Outcome of checking already-applied resources before the next wave starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Wait(String),
    Fail(String),
}

/// Degraded fails the gate, Missing waits, Progressing waits only when `require_healthy`.
pub fn gate<'a, I>(verdicts: I, require_healthy: bool) -> GateVerdict
where
    I: IntoIterator<Item = (&'a ResourceRef, &'a HealthVerdict)>,
{
    let mut waiting: Option<String> = None;
    for (r, v) in verdicts {
        match v.status {
            HealthStatus::Degraded => {
                let why = v.message.as_deref().unwrap_or("resource is degraded");
                return GateVerdict::Fail(format!("{} {} is Degraded: {}", r.kind, r.name, why));
            }
            HealthStatus::Missing if waiting.is_none() => {
                waiting = Some(format!("waiting for {} {} to appear", r.kind, r.name));
            }
            HealthStatus::Progressing if require_healthy && waiting.is_none() => {
                waiting = Some(format!("waiting for {} {} to become healthy", r.kind, r.name));
            }
            _ => {}
        }
    }
    match waiting {
        Some(w) => GateVerdict::Wait(w),
        None => GateVerdict::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairo_core::Manifest;

    fn cm(annos: serde_json::Value) -> LiveObject {
        Manifest::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm-1", "namespace": "ns", "annotations": annos}
        }))
        .unwrap()
    }

    #[test]
    fn unassessable_kinds_default_to_healthy_and_absent_is_missing() {
        let reg = HealthRegistry::with_builtins();
        assert_eq!(reg.evaluate(Some(&cm(serde_json::json!({})))).status, HealthStatus::Healthy);
        assert_eq!(reg.evaluate(None).status, HealthStatus::Missing);
    }

    #[test]
    fn pending_deletion_is_progressing() {
        let mut obj = cm(serde_json::json!({}));
        obj.raw_mut()["metadata"]["deletionTimestamp"] = serde_json::json!("2024-01-01T00:00:00Z");
        let v = HealthRegistry::empty().evaluate(Some(&obj));
        assert_eq!(v.status, HealthStatus::Progressing);
        assert_eq!(v.message.as_deref(), Some("Pending deletion"));
    }

    #[test]
    fn closures_override_per_kind() {
        let mut reg = HealthRegistry::empty();
        reg.register("", "ConfigMap", |o: &LiveObject| {
            let s = o.annotation("health").unwrap_or("Degraded");
            Some(HealthVerdict::new(s.parse().unwrap_or(HealthStatus::Unknown)))
        });
        assert_eq!(reg.evaluate(Some(&cm(serde_json::json!({})))).status, HealthStatus::Degraded);
        assert_eq!(reg.evaluate(Some(&cm(serde_json::json!({"health": "Healthy"})))).status, HealthStatus::Healthy);
    }

    #[test]
    fn gate_rules() {
        let a = ResourceRef::new("", "ConfigMap", Some("ns"), "a");
        let b = ResourceRef::new("", "ConfigMap", Some("ns"), "b");
        let healthy = HealthVerdict::new(HealthStatus::Healthy);
        let progressing = HealthVerdict::new(HealthStatus::Progressing);
        let missing = HealthVerdict::new(HealthStatus::Missing);
        let degraded = HealthVerdict::with_message(HealthStatus::Degraded, "boom");

        assert_eq!(gate([(&a, &healthy), (&b, &progressing)], false), GateVerdict::Pass);
        assert!(matches!(gate([(&a, &healthy), (&b, &progressing)], true), GateVerdict::Wait(_)));
        assert!(matches!(gate([(&a, &missing)], false), GateVerdict::Wait(_)));
        match gate([(&a, &missing), (&b, &degraded)], false) {
            GateVerdict::Fail(msg) => assert!(msg.contains("ConfigMap b is Degraded: boom"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }
}
