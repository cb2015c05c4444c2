//! Resource graph builder: diff entries become pending operations keyed by wave.

use kairo_core::annotations::{self, HOOK, HOOK_DELETE_POLICY, SYNC_OPTIONS, SYNC_WAVE};
use kairo_core::{Diff, DiffEntry, HookDeletePolicy, HookPhase, LiveObject, Manifest, OperationKind, ResourceRef, SyncWave};
use tracing::{debug, warn};

/// Malformed ordering metadata. Never fatal; the resource falls back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanWarning {
    #[error("invalid sync wave {value:?} on {resource}; using wave 0")]
    InvalidWaveAnnotation { resource: ResourceRef, value: String },
    #[error("invalid hook annotation {value:?} on {resource}; ignored")]
    InvalidHookAnnotation { resource: ResourceRef, value: String },
}

/// One unit of work for the executor. Built once per attempt and consumed once.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub resource: ResourceRef,
    pub kind: OperationKind,
    pub wave: SyncWave,
    /// Desired manifest; None for prunes.
    pub manifest: Option<Manifest>,
    /// Last known live object, when there is one.
    pub live: Option<LiveObject>,
    pub hook_phase: Option<HookPhase>,
    pub delete_policies: Vec<HookDeletePolicy>,
    /// Prune only: keep the object and drop tracking instead of deleting.
    pub preserve: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Skip resources whose live state already matches instead of re-applying them.
    pub apply_out_of_sync_only: bool,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub operations: Vec<PendingOperation>,
    /// Ordered by (phase, wave, resource); excluded from the normal wave buckets.
    pub hooks: Vec<PendingOperation>,
    pub warnings: Vec<PlanWarning>,
}

/// Read the sync wave annotation. Absent means 0; a malformed value is 0 plus a warning.
pub fn parse_wave(obj: &Manifest) -> Result<SyncWave, PlanWarning> {
    match obj.annotation(SYNC_WAVE) {
        None => Ok(0),
        Some(v) => v.trim().parse::<SyncWave>().map_err(|_| PlanWarning::InvalidWaveAnnotation {
            resource: obj.reference(),
            value: v.to_string(),
        }),
    }
}

fn hook_phases(obj: &Manifest, warnings: &mut Vec<PlanWarning>) -> Vec<HookPhase> {
    let Some(value) = obj.annotation(HOOK) else { return Vec::new() };
    let mut out = Vec::new();
    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        match part.parse::<HookPhase>() {
            Ok(p) if !out.contains(&p) => out.push(p),
            Ok(_) => {}
            Err(_) => warnings.push(PlanWarning::InvalidHookAnnotation { resource: obj.reference(), value: part.trim().to_string() }),
        }
    }
    out
}

fn delete_policies(obj: &Manifest) -> Vec<HookDeletePolicy> {
    obj.annotation(HOOK_DELETE_POLICY)
        .map(|v| v.split(',').filter_map(|p| p.parse().ok()).collect())
        .unwrap_or_default()
}

fn is_preserved(obj: &LiveObject) -> bool {
    obj.annotation(SYNC_OPTIONS)
        .and_then(|v| annotations::sync_option(v, "Prune"))
        .map(|v| v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

fn wave_or_default(obj: &Manifest, warnings: &mut Vec<PlanWarning>) -> SyncWave {
    parse_wave(obj).unwrap_or_else(|w| {
        warn!(warning = %w, "malformed sync wave");
        warnings.push(w);
        0
    })
}

/// Build the pending operations for one attempt.
pub fn build(diff: &Diff, opts: BuildOptions) -> Graph {
    let mut g = Graph::default();

    let applies = diff
        .to_create
        .iter()
        .map(|e| (e, OperationKind::Create))
        .chain(diff.to_update.iter().map(|e| (e, OperationKind::Update)))
        .chain(diff.unchanged.iter().filter(|_| !opts.apply_out_of_sync_only).map(|e| (e, OperationKind::Update)));

    for (entry, kind) in applies {
        let Some(desired) = entry.desired.as_ref() else {
            debug!(resource = %entry.reference, "apply entry without desired manifest; skipping");
            continue;
        };
        let wave = wave_or_default(desired, &mut g.warnings);
        let phases = hook_phases(desired, &mut g.warnings);
        if phases.is_empty() && desired.annotation(HOOK).is_none() {
            g.operations.push(apply_op(entry, desired, kind, wave));
            continue;
        }
        for phase in phases {
            g.hooks.push(PendingOperation {
                resource: entry.reference.clone(),
                kind: OperationKind::Hook,
                wave,
                manifest: Some(desired.clone()),
                live: entry.live.clone(),
                hook_phase: Some(phase),
                delete_policies: delete_policies(desired),
                preserve: false,
            });
        }
    }

    for entry in diff.to_prune.iter() {
        let Some(live) = entry.live.as_ref() else {
            debug!(resource = %entry.reference, "prune entry without live object; skipping");
            continue;
        };
        if live.annotation(HOOK).is_some() {
            debug!(resource = %entry.reference, "hook resources are never pruned");
            continue;
        }
        let wave = wave_or_default(live, &mut g.warnings);
        g.operations.push(PendingOperation {
            resource: entry.reference.clone(),
            kind: OperationKind::Prune,
            wave,
            manifest: None,
            live: Some(live.clone()),
            hook_phase: None,
            delete_policies: Vec::new(),
            preserve: is_preserved(live),
        });
    }

    g.hooks.sort_by(|a, b| a.hook_phase.cmp(&b.hook_phase).then(a.wave.cmp(&b.wave)).then_with(|| a.resource.cmp(&b.resource)));
    g
}

fn apply_op(entry: &DiffEntry, desired: &Manifest, kind: OperationKind, wave: SyncWave) -> PendingOperation {
    PendingOperation {
        resource: entry.reference.clone(),
        kind,
        wave,
        manifest: Some(desired.clone()),
        live: entry.live.clone(),
        hook_phase: None,
        delete_policies: Vec::new(),
        preserve: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, annos: serde_json::Value) -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "annotations": annos}
        }))
        .unwrap()
    }

    fn entry(m: &Manifest, desired: bool) -> DiffEntry {
        DiffEntry { reference: m.reference(), desired: desired.then(|| m.clone()), live: (!desired).then(|| m.clone()) }
    }

    #[test]
    fn missing_wave_defaults_to_zero() {
        assert_eq!(parse_wave(&cm("a", json!({}))).unwrap(), 0);
        assert_eq!(parse_wave(&cm("a", json!({SYNC_WAVE: " -3 "}))).unwrap(), -3);
    }

    #[test]
    fn malformed_wave_is_a_warning_not_a_failure() {
        let bad = cm("bad", json!({SYNC_WAVE: "one"}));
        let diff = Diff { to_create: vec![entry(&bad, true)], ..Default::default() };
        let g = build(&diff, BuildOptions::default());
        assert_eq!(g.operations.len(), 1);
        assert_eq!(g.operations[0].wave, 0);
        assert!(matches!(g.warnings.as_slice(), [PlanWarning::InvalidWaveAnnotation { value, .. }] if value == "one"));
    }

    #[test]
    fn hooks_are_extracted_once_per_phase() {
        let hook = cm("migrate", json!({HOOK: "PreSync,PostSync", HOOK_DELETE_POLICY: "HookSucceeded"}));
        let plain = cm("plain", json!({}));
        let diff = Diff { to_create: vec![entry(&hook, true), entry(&plain, true)], ..Default::default() };
        let g = build(&diff, BuildOptions::default());
        assert_eq!(g.operations.len(), 1);
        assert_eq!(g.operations[0].resource.name, "plain");
        let phases: Vec<_> = g.hooks.iter().map(|h| h.hook_phase.unwrap()).collect();
        assert_eq!(phases, vec![HookPhase::PreSync, HookPhase::PostSync]);
        assert_eq!(g.hooks[0].delete_policies, vec![HookDeletePolicy::HookSucceeded]);
    }

    #[test]
    fn unknown_hook_phase_warns() {
        let hook = cm("h", json!({HOOK: "Later"}));
        let diff = Diff { to_create: vec![entry(&hook, true)], ..Default::default() };
        let g = build(&diff, BuildOptions::default());
        assert!(g.hooks.is_empty());
        assert!(g.operations.is_empty());
        assert_eq!(g.warnings.len(), 1);
    }

    #[test]
    fn prune_reads_wave_from_live_and_honours_preserve() {
        let keep = cm("keep", json!({SYNC_WAVE: "2", SYNC_OPTIONS: "Prune=false"}));
        let gone = cm("gone", json!({SYNC_WAVE: "1"}));
        let diff = Diff { to_prune: vec![entry(&keep, false), entry(&gone, false)], ..Default::default() };
        let g = build(&diff, BuildOptions::default());
        let by_name = |n: &str| g.operations.iter().find(|o| o.resource.name == n).unwrap();
        assert_eq!(by_name("keep").wave, 2);
        assert!(by_name("keep").preserve);
        assert_eq!(by_name("gone").wave, 1);
        assert!(!by_name("gone").preserve);
        assert!(g.operations.iter().all(|o| o.kind == OperationKind::Prune && o.manifest.is_none()));
    }

    #[test]
    fn unchanged_resources_are_reapplied_unless_out_of_sync_only() {
        let same = cm("same", json!({}));
        let diff = Diff { unchanged: vec![entry(&same, true)], ..Default::default() };
        assert_eq!(build(&diff, BuildOptions::default()).operations[0].kind, OperationKind::Update);
        assert!(build(&diff, BuildOptions { apply_out_of_sync_only: true }).operations.is_empty());
    }
}
