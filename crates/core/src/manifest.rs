use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ResourceRef;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest missing {0}")]
    Missing(&'static str),
    #[error("manifest is not an object")]
    NotAnObject,
}

/// A Kubernetes object as raw JSON, desired or live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    raw: Json,
}

/// Live objects share the manifest representation; the name marks intent.
pub type LiveObject = Manifest;

impl Manifest {
    /// Wrap a JSON object after checking it carries apiVersion, kind and metadata.name.
    pub fn from_value(raw: Json) -> Result<Self, ManifestError> {
        if !raw.is_object() { return Err(ManifestError::NotAnObject); }
        if raw.get("apiVersion").and_then(|v| v.as_str()).is_none() { return Err(ManifestError::Missing("apiVersion")); }
        if raw.get("kind").and_then(|v| v.as_str()).is_none() { return Err(ManifestError::Missing("kind")); }
        if raw.pointer("/metadata/name").and_then(|v| v.as_str()).is_none() { return Err(ManifestError::Missing("metadata.name")); }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &Json { &self.raw }
    pub fn raw_mut(&mut self) -> &mut Json { &mut self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    fn str_at(&self, ptr: &str) -> Option<&str> { self.raw.pointer(ptr).and_then(|v| v.as_str()) }

    pub fn api_version(&self) -> &str { self.str_at("/apiVersion").unwrap_or_default() }

    /// API group; empty for the core group.
    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        let av = self.api_version();
        match av.split_once('/') {
            Some((_, v)) => v,
            None => av,
        }
    }

    pub fn kind(&self) -> &str { self.str_at("/kind").unwrap_or_default() }
    pub fn name(&self) -> &str { self.str_at("/metadata/name").unwrap_or_default() }
    pub fn namespace(&self) -> Option<&str> { self.str_at("/metadata/namespace") }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.group(), self.kind(), self.namespace(), self.name())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("labels")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn deletion_timestamp(&self) -> Option<&str> { self.str_at("/metadata/deletionTimestamp") }

    pub fn finalizers(&self) -> Vec<&str> {
        self.raw
            .pointer("/metadata/finalizers")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default()
    }

    fn metadata_map(&mut self, field: &str) -> Option<&mut serde_json::Map<String, Json>> {
        let meta = self.raw.as_object_mut()?.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        let entry = meta.as_object_mut()?.entry(field).or_insert_with(|| Json::Object(Default::default()));
        if entry.is_null() { *entry = Json::Object(Default::default()); }
        entry.as_object_mut()
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(meta) = self.raw.pointer_mut("/metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".to_string(), Json::String(namespace.to_string()));
        }
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        if let Some(labels) = self.metadata_map("labels") {
            labels.insert(key.to_string(), Json::String(value.to_string()));
        }
    }

    pub fn remove_label(&mut self, key: &str) -> bool {
        self.metadata_map("labels").map(|labels| labels.remove(key).is_some()).unwrap_or(false)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        if let Some(annos) = self.metadata_map("annotations") {
            annos.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}
