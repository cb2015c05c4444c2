//! YAML/JSON manifest loading with size and complexity budgets.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use kairo_core::Manifest;
use serde::Deserialize;
use serde_json::Value as Json;

/// Caps applied to every manifest file before it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadLimits {
    /// Size of one file in bytes.
    pub max_bytes: usize,
    /// JSON values in one document, containers included.
    pub max_nodes: usize,
}

impl Default for LoadLimits {
    fn default() -> Self { Self { max_bytes: 1 << 20, max_nodes: 100_000 } }
}

impl LoadLimits {
    /// Defaults overridden by `KAIRO_MAX_YAML_BYTES` and `KAIRO_MAX_YAML_NODES`.
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok());
        let d = Self::default();
        Self {
            max_bytes: read("KAIRO_MAX_YAML_BYTES").unwrap_or(d.max_bytes),
            max_nodes: read("KAIRO_MAX_YAML_NODES").unwrap_or(d.max_nodes),
        }
    }
}

/// Number of values in `v`, counting stops at `cap`.
fn count_nodes(v: &Json, cap: usize) -> usize {
    let mut seen = 0;
    let mut stack = vec![v];
    while let Some(node) = stack.pop() {
        seen += 1;
        if seen >= cap {
            break;
        }
        match node {
            Json::Object(map) => stack.extend(map.values()),
            Json::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    seen
}

fn push_document(out: &mut Vec<Manifest>, json: Json, i: usize) -> Result<()> {
    if json.get("kind").and_then(|k| k.as_str()) != Some("List") {
        out.push(Manifest::from_value(json).with_context(|| format!("document {}", i))?);
        return Ok(());
    }
    let Json::Object(mut list) = json else { return Ok(()) };
    if let Some(Json::Array(items)) = list.remove("items") {
        for item in items {
            out.push(Manifest::from_value(item).with_context(|| format!("document {}: list item", i))?);
        }
    }
    Ok(())
}

/// Parse a (multi-document) YAML stream into manifests under explicit limits.
pub fn parse_manifests_with(yaml: &str, limits: &LoadLimits) -> Result<Vec<Manifest>> {
    if yaml.len() > limits.max_bytes {
        bail!("manifest file is {} bytes; the limit is {}", yaml.len(), limits.max_bytes);
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if count_nodes(&json, limits.max_nodes) >= limits.max_nodes {
            bail!("document {} has {} or more values; the limit is {}", i, limits.max_nodes, limits.max_nodes);
        }
        push_document(&mut out, json, i)?;
    }
    Ok(out)
}

/// Parse a (multi-document) YAML stream into manifests. Empty documents are skipped;
/// `kind: List` documents are flattened into their items.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Manifest>> { parse_manifests_with(yaml, &LoadLimits::from_env()) }

fn is_manifest_file(p: &Path) -> bool {
    matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

/// Manifest files under `dir` (recursive), sorted for a stable load order.
pub fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).with_context(|| format!("reading {}", d.display()))? {
            let p = entry?.path();
            if p.is_dir() {
                stack.push(p);
            } else if is_manifest_file(&p) {
                out.push(p);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Load every manifest under `dir`.
pub fn load_dir(dir: &Path) -> Result<Vec<Manifest>> {
    let limits = LoadLimits::from_env();
    let mut out = Vec::new();
    for p in manifest_files(dir)? {
        let text = std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
        out.extend(parse_manifests_with(&text, &limits).with_context(|| format!("in {}", p.display()))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_and_lists() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Pod\n  metadata:\n    name: b\n";
        let ms = parse_manifests(y).unwrap();
        let names: Vec<_> = ms.iter().map(|m| format!("{}/{}", m.kind(), m.name())).collect();
        assert_eq!(names, vec!["ConfigMap/a", "Pod/b"]);
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e = format!("{:#}", parse_manifests("kind: Foo\nmetadata:\n  name: x\n").unwrap_err());
        assert!(e.contains("missing apiVersion"), "e={}", e);
        let e = format!("{:#}", parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err());
        assert!(e.contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn limits_reject_large_or_deep_documents() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v\n";
        let roomy = LoadLimits::default();
        assert_eq!(parse_manifests_with(y, &roomy).unwrap().len(), 1);

        let small = LoadLimits { max_bytes: 16, ..roomy };
        let e = parse_manifests_with(y, &small).unwrap_err().to_string();
        assert!(e.contains("the limit is 16"), "e={}", e);

        // root, apiVersion, kind, metadata, name, data, k
        assert_eq!(count_nodes(&serde_json::to_value(serde_yaml::from_str::<serde_yaml::Value>(y).unwrap()).unwrap(), 100), 7);
        let shallow = LoadLimits { max_nodes: 7, ..roomy };
        assert!(parse_manifests_with(y, &shallow).is_err());
        let enough = LoadLimits { max_nodes: 8, ..roomy };
        assert!(parse_manifests_with(y, &enough).is_ok());
    }
}
