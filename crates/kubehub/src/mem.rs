//! In-memory cluster. Models the parts of API server behavior the engine depends on:
//! server-populated metadata, generations, finalizers blocking deletion, and label
//! based tracking. Tests drive it with fault injection and a simulated controller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kairo_core::{Cluster, ClusterError, DeletePropagation, LiveObject, Manifest, ResourceRef};
use serde_json::{json, Value as Json};
use tracing::trace;

/// Kinds stored without a namespace.
const CLUSTER_SCOPED: &[&str] =
    &["Namespace", "Node", "PersistentVolume", "ClusterRole", "ClusterRoleBinding", "CustomResourceDefinition", "StorageClass"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Apply,
    Delete,
    Get,
    Untrack,
    List,
}

/// Reacts to an applied object the way a controller would, typically by writing status.
pub type Controller = Arc<dyn Fn(&mut Json) + Send + Sync>;

struct Fault {
    call: Call,
    kind: String,
    name: String,
    remaining: u32,
    error: ClusterError,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceRef, Json>,
    faults: Vec<Fault>,
    calls: Vec<(Call, ResourceRef)>,
    unreachable: Option<String>,
    controller: Option<Controller>,
    revision: u64,
}

pub struct MemCluster {
    inner: Mutex<Inner>,
    default_ns: String,
}

impl Default for MemCluster {
    fn default() -> Self { Self::new() }
}

impl MemCluster {
    pub fn new() -> Self { Self::with_namespace("default") }

    pub fn with_namespace(ns: &str) -> Self { Self { inner: Mutex::new(Inner::default()), default_ns: ns.to_string() } }

    pub fn default_namespace(&self) -> &str { &self.default_ns }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the others.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn key(&self, r: &ResourceRef) -> ResourceRef {
        if CLUSTER_SCOPED.contains(&r.kind.as_str()) {
            return ResourceRef { namespace: None, ..r.clone() };
        }
        match r.namespace {
            Some(_) => r.clone(),
            None => ResourceRef { namespace: Some(self.default_ns.clone()), ..r.clone() },
        }
    }

    fn find_key(inner: &Inner, kind: &str, name: &str) -> Option<ResourceRef> {
        inner.objects.keys().find(|k| k.is(kind, name)).cloned()
    }

    /// Install a controller run after every successful apply.
    pub fn set_controller(&self, controller: Option<Controller>) { self.lock().controller = controller; }

    /// Fail the next `times` calls of `call` against kind/name with `error`.
    pub fn fail(&self, call: Call, kind: &str, name: &str, times: u32, error: ClusterError) {
        self.lock().faults.push(Fault { call, kind: kind.to_string(), name: name.to_string(), remaining: times, error });
    }

    /// Make every call fail with Unreachable until cleared with `None`.
    pub fn set_unreachable(&self, reason: Option<&str>) { self.lock().unreachable = reason.map(|s| s.to_string()); }

    /// Seed a live object directly, bypassing the call log and controller.
    pub fn insert(&self, manifest: Manifest) {
        let key = self.key(&manifest.reference());
        let mut inner = self.lock();
        inner.revision += 1;
        let rv = inner.revision;
        let mut raw = manifest.into_raw();
        stamp_new(&mut raw, &key, rv);
        inner.objects.insert(key, raw);
    }

    /// Mutate a stored object in place. Returns false when absent.
    pub fn patch(&self, kind: &str, name: &str, f: impl FnOnce(&mut Json)) -> bool {
        let mut inner = self.lock();
        let Some(key) = Self::find_key(&inner, kind, name) else { return false };
        match inner.objects.get_mut(&key) {
            Some(obj) => {
                f(obj);
                true
            }
            None => false,
        }
    }

    /// Clear finalizers; an object already marked for deletion disappears.
    pub fn remove_finalizers(&self, kind: &str, name: &str) {
        let mut inner = self.lock();
        let Some(key) = Self::find_key(&inner, kind, name) else { return };
        let deleting = match inner.objects.get_mut(&key) {
            Some(obj) => {
                if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.remove("finalizers");
                }
                obj.pointer("/metadata/deletionTimestamp").is_some()
            }
            None => false,
        };
        if deleting {
            inner.objects.remove(&key);
        }
    }

    pub fn object(&self, kind: &str, name: &str) -> Option<LiveObject> {
        let inner = self.lock();
        let key = Self::find_key(&inner, kind, name)?;
        inner.objects.get(&key).and_then(|v| Manifest::from_value(v.clone()).ok())
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool { Self::find_key(&self.lock(), kind, name).is_some() }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Mutating calls in the order they reached the cluster.
    pub fn calls(&self) -> Vec<(Call, ResourceRef)> { self.lock().calls.clone() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    fn enter(&self, inner: &mut Inner, call: Call, r: &ResourceRef) -> Result<(), ClusterError> {
        if let Some(reason) = inner.unreachable.as_ref() {
            return Err(ClusterError::Unreachable(reason.clone()));
        }
        if matches!(call, Call::Apply | Call::Delete | Call::Untrack) {
            inner.calls.push((call, r.clone()));
        }
        let hit = inner.faults.iter_mut().find(|f| f.call == call && f.remaining > 0 && r.is(&f.kind, &f.name));
        if let Some(fault) = hit {
            fault.remaining -= 1;
            trace!(resource = %r, ?call, "injected fault");
            return Err(fault.error.clone());
        }
        Ok(())
    }
}

fn meta_mut(obj: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    obj.get_mut("metadata").and_then(|m| m.as_object_mut())
}

fn stamp_new(raw: &mut Json, key: &ResourceRef, rv: u64) {
    if let Some(meta) = meta_mut(raw) {
        if let Some(ns) = key.namespace.as_ref() {
            meta.insert("namespace".into(), json!(ns));
        }
        meta.entry("uid").or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
        meta.entry("generation").or_insert(json!(1));
        meta.entry("creationTimestamp").or_insert_with(|| json!(now()));
        meta.insert("resourceVersion".into(), json!(rv.to_string()));
    }
}

fn now() -> String { chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true) }

/// Everything except metadata and status; a change here bumps the generation.
fn spec_of(obj: &Json) -> Json {
    let mut v = obj.clone();
    if let Some(o) = v.as_object_mut() {
        o.remove("metadata");
        o.remove("status");
    }
    v
}

const PRESERVED_META: &[&str] = &["uid", "creationTimestamp", "deletionTimestamp", "generation"];

#[async_trait::async_trait]
impl Cluster for MemCluster {
    async fn apply(&self, manifest: &Manifest) -> Result<ResourceRef, ClusterError> {
        let key = self.key(&manifest.reference());
        let mut inner = self.lock();
        self.enter(&mut inner, Call::Apply, &key)?;
        inner.revision += 1;
        let rv = inner.revision;
        let mut raw = manifest.raw().clone();
        match inner.objects.get(&key) {
            None => stamp_new(&mut raw, &key, rv),
            Some(prev) => {
                let changed = spec_of(prev) != spec_of(&raw);
                let prev_meta = prev.get("metadata").and_then(|m| m.as_object()).cloned().unwrap_or_default();
                if let Some(meta) = meta_mut(&mut raw) {
                    if let Some(ns) = key.namespace.as_ref() {
                        meta.insert("namespace".into(), json!(ns));
                    }
                    for field in PRESERVED_META {
                        if let Some(v) = prev_meta.get(*field) {
                            meta.insert((*field).to_string(), v.clone());
                        }
                    }
                    if !meta.contains_key("finalizers") {
                        if let Some(f) = prev_meta.get("finalizers") {
                            meta.insert("finalizers".into(), f.clone());
                        }
                    }
                    if changed {
                        let g = prev_meta.get("generation").and_then(|g| g.as_i64()).unwrap_or(1);
                        meta.insert("generation".into(), json!(g + 1));
                    }
                    meta.insert("resourceVersion".into(), json!(rv.to_string()));
                }
                if let (Some(status), Some(o)) = (prev.get("status"), raw.as_object_mut()) {
                    o.insert("status".into(), status.clone());
                }
            }
        }
        if let Some(ctrl) = inner.controller.clone() {
            ctrl(&mut raw);
        }
        inner.objects.insert(key.clone(), raw);
        Ok(key)
    }

    async fn delete(&self, reference: &ResourceRef, _propagation: DeletePropagation) -> Result<(), ClusterError> {
        let key = self.key(reference);
        let mut inner = self.lock();
        self.enter(&mut inner, Call::Delete, &key)?;
        let Some(obj) = inner.objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(key.to_string()));
        };
        let blocked = obj.pointer("/metadata/finalizers").and_then(|f| f.as_array()).map_or(false, |f| !f.is_empty());
        if blocked {
            if let Some(meta) = meta_mut(obj) {
                meta.entry("deletionTimestamp").or_insert_with(|| json!(now()));
            }
        } else {
            inner.objects.remove(&key);
        }
        Ok(())
    }

    async fn get(&self, reference: &ResourceRef) -> Result<Option<LiveObject>, ClusterError> {
        let key = self.key(reference);
        let mut inner = self.lock();
        self.enter(&mut inner, Call::Get, &key)?;
        match inner.objects.get(&key) {
            Some(v) => Manifest::from_value(v.clone()).map(Some).map_err(|e| ClusterError::Rejected(e.to_string())),
            None => Ok(None),
        }
    }

    async fn untrack(&self, reference: &ResourceRef, label: &str) -> Result<(), ClusterError> {
        let key = self.key(reference);
        let mut inner = self.lock();
        self.enter(&mut inner, Call::Untrack, &key)?;
        let Some(obj) = inner.objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(key.to_string()));
        };
        if let Some(labels) = obj.pointer_mut("/metadata/labels").and_then(|l| l.as_object_mut()) {
            labels.remove(label);
        }
        Ok(())
    }

    async fn list_tracked(&self, label: &str, instance: &str) -> Result<Vec<LiveObject>, ClusterError> {
        let inner = self.lock();
        if let Some(reason) = inner.unreachable.as_ref() {
            return Err(ClusterError::Unreachable(reason.clone()));
        }
        inner
            .objects
            .values()
            .filter(|v| v.pointer("/metadata/labels").and_then(|l| l.get(label)).and_then(|s| s.as_str()) == Some(instance))
            .map(|v| Manifest::from_value(v.clone()).map_err(|e| ClusterError::Rejected(e.to_string())))
            .collect()
    }

    async fn namespaced(&self, _group: &str, kind: &str) -> Result<bool, ClusterError> {
        if let Some(reason) = self.lock().unreachable.as_ref() {
            return Err(ClusterError::Unreachable(reason.clone()));
        }
        Ok(!CLUSTER_SCOPED.contains(&kind))
    }
}

/// Controller that reports workloads as finished and ready as soon as they are applied.
pub fn ready_controller() -> Controller {
    Arc::new(|obj: &mut Json| {
        let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
        let generation = obj.pointer("/metadata/generation").cloned().unwrap_or(json!(1));
        let status = match kind.as_str() {
            "Pod" => json!({
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": "True"}],
                "containerStatuses": [{"name": "main", "ready": true, "restartCount": 0, "image": "", "imageID": ""}]
            }),
            "Deployment" => {
                let replicas = obj.pointer("/spec/replicas").and_then(|r| r.as_i64()).unwrap_or(1);
                json!({
                    "observedGeneration": generation,
                    "replicas": replicas,
                    "updatedReplicas": replicas,
                    "readyReplicas": replicas,
                    "availableReplicas": replicas
                })
            }
            "Job" => json!({"succeeded": 1, "conditions": [{"type": "Complete", "status": "True"}]}),
            _ => return,
        };
        if let Some(o) = obj.as_object_mut() {
            o.insert("status".into(), status);
        }
    })
}
