//! Kairo kubehub: cluster collaborators. `KubeCluster` talks to a real API server
//! through kube dynamic objects; `MemCluster` is an in-memory stand-in.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use futures::{stream, StreamExt};
use kairo_core::{Cluster, ClusterError, DeletePropagation, LiveObject, Manifest, ResourceRef};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{verbs, Discovery, Scope},
    Client,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod mem;

pub use mem::{ready_controller, Call, Controller, MemCluster};

const FIELD_MANAGER: &str = "kairo";

/// Map kube client errors onto the engine's transient/terminal split.
pub fn classify(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ClusterError::NotFound(ae.message),
            409 | 429 | 500..=599 => ClusterError::Transient(format!("{} ({})", ae.message, ae.code)),
            _ => ClusterError::Rejected(format!("{} ({})", ae.message, ae.code)),
        },
        e @ (kube::Error::HyperError(_) | kube::Error::Service(_)) => ClusterError::Transient(e.to_string()),
        other => ClusterError::Rejected(other.to_string()),
    }
}

#[derive(Debug, Clone)]
struct Served {
    ar: ApiResource,
    namespaced: bool,
    listable: bool,
}

/// Cluster collaborator backed by the current kubeconfig context.
pub struct KubeCluster {
    client: Client,
    served: RwLock<Option<HashMap<(String, String), Served>>>,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(|e| ClusterError::Unreachable(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self { Self { client, served: RwLock::new(None) } }

    pub fn default_namespace(&self) -> &str { self.client.default_namespace() }

    async fn discovery(&self) -> Result<HashMap<(String, String), Served>, ClusterError> {
        if let Some(s) = self.served.read().await.as_ref() {
            return Ok(s.clone());
        }
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(classify)?;
        let mut out = HashMap::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let served = Served {
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    listable: caps.supports_operation(verbs::LIST),
                    ar: ar.clone(),
                };
                out.insert((ar.group.clone(), ar.kind.clone()), served);
            }
        }
        info!(kinds = out.len(), "discovery cached");
        *self.served.write().await = Some(out.clone());
        Ok(out)
    }

    async fn resolve(&self, group: &str, kind: &str) -> Result<Served, ClusterError> {
        self.discovery()
            .await?
            .remove(&(group.to_string(), kind.to_string()))
            .ok_or_else(|| ClusterError::Rejected(format!("kind not served: {}/{}", group, kind)))
    }

    fn api(&self, served: &Served, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        if !served.namespaced {
            return Api::all_with(self.client.clone(), ar);
        }
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::default_namespaced_with(self.client.clone(), ar),
        }
    }

    fn to_live(mut obj: DynamicObject, ar: &ApiResource) -> Result<LiveObject, ClusterError> {
        // List items come back without type information.
        if obj.types.is_none() {
            obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
        }
        let mut raw = serde_json::to_value(&obj).map_err(|e| ClusterError::Rejected(e.to_string()))?;
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
        Manifest::from_value(raw).map_err(|e| ClusterError::Rejected(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn apply(&self, manifest: &Manifest) -> Result<ResourceRef, ClusterError> {
        let served = self.resolve(manifest.group(), manifest.kind()).await?;
        // Apply at the manifest's own version, not the preferred one.
        let gvk = GroupVersionKind::gvk(manifest.group(), manifest.version(), manifest.kind());
        let ar = ApiResource::from_gvk_with_plural(&gvk, &served.ar.plural);
        let api = self.api(&served, &ar, manifest.namespace());
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = api.patch(manifest.name(), &pp, &Patch::Apply(manifest.raw())).await.map_err(classify)?;
        debug!(kind = %manifest.kind(), name = %manifest.name(), rv = ?obj.metadata.resource_version, "applied");
        let ns = obj.metadata.namespace.clone();
        Ok(ResourceRef::new(manifest.group(), manifest.kind(), ns.as_deref(), manifest.name()))
    }

    async fn delete(&self, reference: &ResourceRef, propagation: DeletePropagation) -> Result<(), ClusterError> {
        let served = self.resolve(&reference.group, &reference.kind).await?;
        let api = self.api(&served, &served.ar, reference.namespace.as_deref());
        let policy = match propagation {
            DeletePropagation::Foreground => PropagationPolicy::Foreground,
            DeletePropagation::Background => PropagationPolicy::Background,
            DeletePropagation::Orphan => PropagationPolicy::Orphan,
        };
        let dp = DeleteParams { propagation_policy: Some(policy), ..Default::default() };
        api.delete(&reference.name, &dp).await.map_err(classify)?;
        Ok(())
    }

    async fn get(&self, reference: &ResourceRef) -> Result<Option<LiveObject>, ClusterError> {
        let served = self.resolve(&reference.group, &reference.kind).await?;
        let api = self.api(&served, &served.ar, reference.namespace.as_deref());
        match api.get_opt(&reference.name).await.map_err(classify)? {
            Some(obj) => Ok(Some(Self::to_live(obj, &served.ar)?)),
            None => Ok(None),
        }
    }

    async fn untrack(&self, reference: &ResourceRef, label: &str) -> Result<(), ClusterError> {
        let served = self.resolve(&reference.group, &reference.kind).await?;
        let api = self.api(&served, &served.ar, reference.namespace.as_deref());
        let patch = serde_json::json!({"metadata": {"labels": {label: null}}});
        api.patch(&reference.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(classify)?;
        Ok(())
    }

    async fn list_tracked(&self, label: &str, instance: &str) -> Result<Vec<LiveObject>, ClusterError> {
        let served = self.discovery().await?;
        let lp = ListParams::default().labels(&format!("{}={}", label, instance));
        let listable: Vec<Served> = served.into_values().filter(|s| s.listable).collect();
        let results: Vec<Result<Vec<LiveObject>, ClusterError>> = stream::iter(listable)
            .map(|s| {
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &s.ar);
                let lp = lp.clone();
                async move {
                    match api.list(&lp).await {
                        Ok(list) => list.items.into_iter().map(|o| Self::to_live(o, &s.ar)).collect(),
                        // Kinds we may not list are simply not tracked.
                        Err(kube::Error::Api(ae)) if ae.code == 403 || ae.code == 405 => {
                            debug!(kind = %s.ar.kind, code = ae.code, "skipping unlistable kind");
                            Ok(Vec::new())
                        }
                        Err(e) => Err(classify(e)),
                    }
                }
            })
            .buffer_unordered(8)
            .collect()
            .await;
        let mut out = Vec::new();
        for r in results {
            out.extend(r?);
        }
        Ok(out)
    }

    async fn namespaced(&self, group: &str, kind: &str) -> Result<bool, ClusterError> {
        Ok(self.resolve(group, kind).await?.namespaced)
    }
}
