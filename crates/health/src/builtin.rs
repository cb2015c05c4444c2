//! Built-in assessors for workload kinds. Objects are decoded with k8s-openapi types;
//! an object that does not decode is reported Unknown rather than guessed at.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kairo_core::{HealthStatus, HealthVerdict, LiveObject};
use serde::de::DeserializeOwned;
use tracing::debug;

fn decode<T: DeserializeOwned>(obj: &LiveObject) -> Result<T, HealthVerdict> {
    serde_json::from_value::<T>(obj.raw().clone()).map_err(|e| {
        debug!(kind = %obj.kind(), name = %obj.name(), error = %e, "health decode failed");
        HealthVerdict::with_message(HealthStatus::Unknown, format!("cannot decode {}: {}", obj.kind(), e))
    })
}

pub fn deployment_health(obj: &LiveObject) -> Option<HealthVerdict> {
    let d: Deployment = match decode(obj) {
        Ok(d) => d,
        Err(v) => return Some(v),
    };
    let spec = d.spec.unwrap_or_default();
    if spec.paused.unwrap_or(false) {
        return Some(HealthVerdict::with_message(HealthStatus::Suspended, "Deployment is paused"));
    }
    let status = d.status.unwrap_or_default();
    let generation = d.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Some(HealthVerdict::with_message(
            HealthStatus::Progressing,
            "Waiting for rollout to finish: observed deployment generation less than desired generation",
        ));
    }
    // The controller stamps this condition once progressDeadlineSeconds elapses.
    let deadline_exceeded = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"));
    if deadline_exceeded {
        return Some(HealthVerdict::with_message(
            HealthStatus::Degraded,
            format!("Deployment {:?} exceeded its progress deadline", obj.name()),
        ));
    }
    let want = spec.replicas.unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if updated < want {
        return Some(HealthVerdict::with_message(
            HealthStatus::Progressing,
            format!("Waiting for rollout to finish: {} out of {} new replicas have been updated...", updated, want),
        ));
    }
    if total > updated {
        return Some(HealthVerdict::with_message(
            HealthStatus::Progressing,
            format!("Waiting for rollout to finish: {} old replicas are pending termination...", total - updated),
        ));
    }
    if available < updated {
        return Some(HealthVerdict::with_message(
            HealthStatus::Progressing,
            format!("Waiting for rollout to finish: {} of {} updated replicas are available...", available, updated),
        ));
    }
    Some(HealthVerdict::new(HealthStatus::Healthy))
}

pub fn pod_health(obj: &LiveObject) -> Option<HealthVerdict> {
    let p: Pod = match decode(obj) {
        Ok(p) => p,
        Err(v) => return Some(v),
    };
    let restart_always = p.spec.as_ref().and_then(|s| s.restart_policy.as_deref()).map_or(true, |r| r == "Always");
    let status = p.status.unwrap_or_default();
    let containers = status.container_statuses.unwrap_or_default();

    // Only long-running pods: a hook pod pulling a late image must not fail early.
    if restart_always {
        let errors: Vec<String> = containers
            .iter()
            .filter_map(|c| c.state.as_ref()?.waiting.as_ref())
            .filter(|w| {
                let r = w.reason.as_deref().unwrap_or_default();
                r.starts_with("Err") || r.ends_with("Error") || r.ends_with("BackOff")
            })
            .map(|w| w.message.clone().or_else(|| w.reason.clone()).unwrap_or_default())
            .collect();
        if !errors.is_empty() {
            return Some(HealthVerdict::with_message(HealthStatus::Degraded, errors.join(", ")));
        }
    }

    let message = status.message.clone().unwrap_or_default();
    let verdict = match status.phase.as_deref() {
        Some("Pending") => HealthVerdict::with_message(HealthStatus::Progressing, message),
        Some("Succeeded") => HealthVerdict::with_message(HealthStatus::Healthy, message),
        Some("Failed") => HealthVerdict::with_message(HealthStatus::Degraded, message),
        Some("Running") if restart_always && !containers.is_empty() && containers.iter().all(|c| c.ready) => {
            HealthVerdict::with_message(HealthStatus::Healthy, message)
        }
        Some("Running") => HealthVerdict::with_message(HealthStatus::Progressing, message),
        _ => HealthVerdict::with_message(HealthStatus::Unknown, message),
    };
    Some(verdict)
}

pub fn job_health(obj: &LiveObject) -> Option<HealthVerdict> {
    let j: Job = match decode(obj) {
        Ok(j) => j,
        Err(v) => return Some(v),
    };
    if j.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false) {
        return Some(HealthVerdict::with_message(HealthStatus::Suspended, "Job is suspended"));
    }
    let conditions = j.status.and_then(|s| s.conditions).unwrap_or_default();
    for c in conditions.iter().filter(|c| c.status == "True") {
        match c.type_.as_str() {
            "Failed" => {
                return Some(HealthVerdict::with_message(HealthStatus::Degraded, c.message.clone().unwrap_or_default()));
            }
            "Complete" => {
                return Some(HealthVerdict::with_message(HealthStatus::Healthy, c.message.clone().unwrap_or_default()));
            }
            _ => {}
        }
    }
    Some(HealthVerdict::new(HealthStatus::Progressing))
}
