//! Desired-vs-live comparison. A resource drifts when a field the desired manifest
//! sets is missing or different in the live object, or when a field the last apply
//! set has since been dropped from the desired manifest. Server-populated fields on
//! the live side never count.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use anyhow::Result;
use kairo_core::annotations::{LAST_APPLIED, TRACKING_LABEL};
use kairo_core::{Cluster, ClusterError, Diff, DiffEntry, DiffProvider, LiveObject, Manifest, RefreshType, ResourceRef};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

const SERVER_FIELDS: &[&str] = &[
    "/status",
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/deletionTimestamp",
    "/metadata/managedFields",
];

/// Field paths, as JSON pointers, on which desired and live disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    /// Set in desired but absent or different in live.
    pub changed: Vec<String>,
    /// Set by the last apply but no longer in desired.
    pub dropped: Vec<String>,
}

impl Drift {
    pub fn is_empty(&self) -> bool { self.changed.is_empty() && self.dropped.is_empty() }
}

fn escape(key: &str) -> String { key.replace('~', "~0").replace('/', "~1") }

fn changed_paths(desired: &Json, live: Option<&Json>, path: &str, out: &mut Vec<String>) {
    if SERVER_FIELDS.contains(&path) {
        return;
    }
    match (desired, live) {
        (Json::Object(d), Some(Json::Object(l))) => {
            for (k, dv) in d {
                changed_paths(dv, l.get(k), &format!("{}/{}", path, escape(k)), out);
            }
        }
        (Json::Array(d), Some(Json::Array(l))) if d.len() == l.len() => {
            for (i, (dv, lv)) in d.iter().zip(l).enumerate() {
                changed_paths(dv, Some(lv), &format!("{}/{}", path, i), out);
            }
        }
        (d, Some(l)) if d == l => {}
        _ => out.push(path.to_string()),
    }
}

fn dropped_paths(previous: &Json, desired: &Json, path: &str, out: &mut Vec<String>) {
    let (Json::Object(p), Json::Object(d)) = (previous, desired) else { return };
    for (k, pv) in p {
        let at = format!("{}/{}", path, escape(k));
        match d.get(k) {
            Some(dv) => dropped_paths(pv, dv, &at, out),
            None => out.push(at),
        }
    }
}

/// Compare one desired manifest with its live object. Fields only the live side has
/// are ignored unless the last apply recorded on the object set them.
pub fn drift(desired: &Manifest, live: &LiveObject) -> Drift {
    let mut out = Drift::default();
    changed_paths(desired.raw(), Some(live.raw()), "", &mut out.changed);
    match live.annotation(LAST_APPLIED).map(serde_json::from_str::<Json>) {
        Some(Ok(previous)) => dropped_paths(&previous, desired.raw(), "", &mut out.dropped),
        Some(Err(e)) => debug!(resource = %live.reference(), error = %e, "unreadable last-applied annotation"),
        None => {}
    }
    out.changed.sort();
    out.dropped.sort();
    out
}

pub fn in_sync(desired: &Manifest, live: &LiveObject) -> bool { drift(desired, live).is_empty() }

/// Pair desired manifests with tracked live objects. A desired manifest without a
/// namespace matches a live object in `default_ns`.
pub fn compare(desired: Vec<Manifest>, live: Vec<LiveObject>, default_ns: Option<&str>) -> Diff {
    let mut by_ref: HashMap<ResourceRef, LiveObject> = live.into_iter().map(|o| (o.reference(), o)).collect();
    let mut diff = Diff::default();
    for m in desired {
        let mut reference = m.reference();
        if reference.namespace.is_none() && !by_ref.contains_key(&reference) {
            if let Some(ns) = default_ns {
                let candidate = ResourceRef { namespace: Some(ns.to_string()), ..reference.clone() };
                if by_ref.contains_key(&candidate) { reference = candidate; }
            }
        }
        match by_ref.remove(&reference) {
            None => diff.to_create.push(DiffEntry { reference, desired: Some(m), live: None }),
            // An object being deleted has to be recreated once it is gone.
            Some(l) if l.deletion_timestamp().is_some() => {
                diff.to_update.push(DiffEntry { reference, desired: Some(m), live: Some(l) })
            }
            Some(l) => {
                let d = drift(&m, &l);
                if d.is_empty() {
                    diff.unchanged.push(DiffEntry { reference, desired: Some(m), live: Some(l) });
                } else {
                    debug!(resource = %reference, changed = ?d.changed, dropped = ?d.dropped, "out of sync");
                    diff.to_update.push(DiffEntry { reference, desired: Some(m), live: Some(l) });
                }
            }
        }
    }
    let mut leftovers: Vec<_> = by_ref.into_iter().collect();
    leftovers.sort_by(|a, b| a.0.cmp(&b.0));
    for (reference, l) in leftovers {
        diff.to_prune.push(DiffEntry { reference, desired: None, live: Some(l) });
    }
    diff
}

/// Where desired manifests come from.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn load(&self, refresh: RefreshType) -> Result<Vec<Manifest>>;
}

/// Manifests read from a directory. Normal refreshes reuse the parsed set unless a
/// file changed; hard refreshes always re-read.
pub struct DirSource {
    dir: PathBuf,
    cache: Mutex<Option<(Vec<(PathBuf, Option<SystemTime>, u64)>, Vec<Manifest>)>>,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into(), cache: Mutex::new(None) } }

    fn fingerprint(&self) -> Result<Vec<(PathBuf, Option<SystemTime>, u64)>> {
        let mut out = Vec::new();
        for p in crate::load::manifest_files(&self.dir)? {
            let meta = std::fs::metadata(&p)?;
            out.push((p, meta.modified().ok(), meta.len()));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ManifestSource for DirSource {
    async fn load(&self, refresh: RefreshType) -> Result<Vec<Manifest>> {
        let fp = self.fingerprint()?;
        let mut cache = self.cache.lock().map_err(|_| anyhow::anyhow!("manifest cache poisoned"))?;
        if refresh == RefreshType::Normal {
            if let Some((prev, manifests)) = cache.as_ref() {
                if *prev == fp {
                    debug!(dir = %self.dir.display(), "manifest cache hit");
                    return Ok(manifests.clone());
                }
            }
        }
        let manifests = crate::load::load_dir(&self.dir)?;
        *cache = Some((fp, manifests.clone()));
        Ok(manifests)
    }
}

/// In-memory manifests that can be edited between refreshes.
#[derive(Default)]
pub struct StaticSource {
    manifests: RwLock<Vec<Manifest>>,
}

impl StaticSource {
    pub fn new(manifests: Vec<Manifest>) -> Self { Self { manifests: RwLock::new(manifests) } }

    pub fn set(&self, manifests: Vec<Manifest>) {
        if let Ok(mut g) = self.manifests.write() { *g = manifests; }
    }

    /// Edit the manifest with the given kind and name in place.
    pub fn edit(&self, kind: &str, name: &str, f: impl FnOnce(&mut Manifest)) -> bool {
        let Ok(mut g) = self.manifests.write() else { return false };
        match g.iter_mut().find(|m| m.kind() == kind && m.name() == name) {
            Some(m) => {
                f(m);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, kind: &str, name: &str) {
        if let Ok(mut g) = self.manifests.write() { g.retain(|m| !(m.kind() == kind && m.name() == name)); }
    }
}

#[async_trait::async_trait]
impl ManifestSource for StaticSource {
    async fn load(&self, _refresh: RefreshType) -> Result<Vec<Manifest>> {
        self.manifests.read().map(|g| g.clone()).map_err(|_| anyhow::anyhow!("manifest source poisoned"))
    }
}

#[async_trait::async_trait]
impl<S: ManifestSource + ?Sized> ManifestSource for Arc<S> {
    async fn load(&self, refresh: RefreshType) -> Result<Vec<Manifest>> { (**self).load(refresh).await }
}

/// `DiffProvider` comparing a manifest source with the objects tracked for one application.
pub struct ManifestDiffer<S> {
    source: S,
    cluster: Arc<dyn Cluster>,
    instance: String,
    default_ns: Option<String>,
}

impl<S: ManifestSource> ManifestDiffer<S> {
    pub fn new(source: S, cluster: Arc<dyn Cluster>, instance: &str, default_ns: Option<&str>) -> Self {
        Self { source, cluster, instance: instance.to_string(), default_ns: default_ns.map(|s| s.to_string()) }
    }
}

#[async_trait::async_trait]
impl<S: ManifestSource> DiffProvider for ManifestDiffer<S> {
    async fn diff(&self, refresh: RefreshType) -> Result<Diff> {
        let mut desired = self.source.load(refresh).await?;
        if let Some(ns) = self.default_ns.as_deref() {
            for m in desired.iter_mut().filter(|m| m.namespace().is_none()) {
                match self.cluster.namespaced(m.group(), m.kind()).await {
                    Ok(true) => m.set_namespace(ns),
                    Ok(false) => {}
                    Err(e @ (ClusterError::Transient(_) | ClusterError::Unreachable(_))) => return Err(e.into()),
                    // Unknown kinds fail at apply time with a per-resource message.
                    Err(e) => debug!(kind = %m.kind(), error = %e, "namespace scope unknown"),
                }
            }
        }
        let live = self.cluster.list_tracked(TRACKING_LABEL, &self.instance).await?;
        Ok(compare(desired, live, self.default_ns.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(v: Json) -> Manifest { Manifest::from_value(v).unwrap() }

    #[test]
    fn drift_reports_changed_paths() {
        let desired = m(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "labels": {"tier/role": "web"}},
            "data": {"k": "v", "n": "1"}
        }));
        let live = m(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "uid": "1", "labels": {"tier/role": "db"}},
            "data": {"k": "v"},
            "status": {"x": 1}
        }));
        let d = drift(&desired, &live);
        assert_eq!(d.changed, vec!["/data/n", "/metadata/labels/tier~1role"]);
        assert!(d.dropped.is_empty());
    }

    #[test]
    fn field_dropped_since_last_apply_is_drift() {
        let applied = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "annotations": {"example.com/owner": "team-a"}},
            "data": {"k": "v"}
        });
        let mut live = m(applied.clone());
        live.set_annotation(LAST_APPLIED, &applied.to_string());
        let desired = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}, "data": {"k": "v"}}));

        let d = drift(&desired, &live);
        assert!(d.changed.is_empty());
        assert_eq!(d.dropped, vec!["/metadata/annotations"]);
        assert!(!in_sync(&desired, &live));

        // Without a record of the last apply, extra live fields are not drift.
        let mut unrecorded = m(applied);
        unrecorded.set_annotation("example.com/other", "x");
        assert!(in_sync(&desired, &unrecorded));
    }

    #[test]
    fn live_extras_do_not_make_out_of_sync() {
        let desired = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}, "data": {"k": "v"}}));
        let live = m(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "ns", "uid": "1", "resourceVersion": "9", "labels": {"x": "y"}},
            "data": {"k": "v"}
        }));
        assert!(in_sync(&desired, &live));
        let changed = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}, "data": {"k": "w"}}));
        assert!(!in_sync(&changed, &live));
    }

    #[test]
    fn compare_sorts_into_buckets() {
        let keep = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "keep", "namespace": "ns"}}));
        let create = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "new"}}));
        let stale = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "old", "namespace": "ns"}}));
        let unqualified_keep = m(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "keep"}}));
        let diff = compare(vec![unqualified_keep, create], vec![keep, stale], Some("ns"));
        assert_eq!(diff.unchanged.len(), 1);
        assert_eq!(diff.unchanged[0].reference.namespace.as_deref(), Some("ns"));
        assert_eq!(diff.to_create.len(), 1);
        assert_eq!(diff.to_prune.len(), 1);
        assert_eq!(diff.to_prune[0].reference.name, "old");
        assert!(diff.is_out_of_sync());
    }
}
