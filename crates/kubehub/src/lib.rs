//! Keel kubehub: the cluster object store the engine reads references from and writes status to.
//!
//! Objects travel as raw JSON (`apiVersion`/`kind`/`metadata` + body). Two stores are provided:
//! [`KubeStore`] over a live cluster via kube-rs dynamic objects, and [`MemoryStore`] for tests
//! and offline CLI use.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use base64::Engine as _;
use keel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Address of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    pub fn config_map(namespace: Option<&str>, name: &str) -> Self { Self::new("v1", "ConfigMap", namespace, name) }
    pub fn secret(namespace: Option<&str>, name: &str) -> Self { Self::new("v1", "Secret", namespace, name) }

    /// Key of a raw object; `apiVersion`, `kind` and `metadata.name` are required.
    pub fn from_object(obj: &Json) -> Result<Self> {
        let field = |ptr: &str| obj.pointer(ptr).and_then(Json::as_str);
        let missing = |what: &str| Error::configuration("object", format!("object missing {}", what));
        Ok(Self {
            api_version: field("/apiVersion").ok_or_else(|| missing("apiVersion"))?.to_string(),
            kind: field("/kind").ok_or_else(|| missing("kind"))?.to_string(),
            namespace: field("/metadata/namespace").map(|s| s.to_string()),
            name: field("/metadata/name").ok_or_else(|| missing("metadata.name"))?.to_string(),
        })
    }

    /// `group` part of `apiVersion` (empty for the core group).
    pub fn group(&self) -> &str { self.api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("") }

    pub fn version(&self) -> &str { self.api_version.rsplit_once('/').map(|(_, v)| v).unwrap_or(&self.api_version) }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version, self.kind) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Kind + optional namespace + optional label selector (`k=v,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub labels: Option<String>,
}

impl ListSelector {
    pub fn kind(api_version: &str, kind: &str) -> Self {
        Self { api_version: api_version.to_string(), kind: kind.to_string(), ..Default::default() }
    }

    pub fn in_namespace(mut self, ns: &str) -> Self { self.namespace = Some(ns.to_string()); self }

    pub fn with_labels(mut self, sel: &str) -> Self { self.labels = Some(sel.to_string()); self }
}

/// CRUD over cluster objects. `get` on a missing object is `Error::NotFound`; a stale write is
/// `Error::Conflict`; everything else is `Error::Store`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Json>;

    async fn create(&self, obj: Json) -> Result<Json>;

    async fn update(&self, obj: Json) -> Result<Json>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    async fn list(&self, selector: &ListSelector) -> Result<Vec<Json>>;

    /// Bytes stored under `field` of a ConfigMap or Secret. Secret payloads are base64 on the
    /// wire and returned decoded.
    async fn get_field(&self, key: &ObjectKey, field: &str) -> Result<Vec<u8>> {
        let obj = self.get(key).await?;
        extract_field(key, &obj, field)
    }
}

pub(crate) fn extract_field(key: &ObjectKey, obj: &Json, field: &str) -> Result<Vec<u8>> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let decode = |s: &str| {
        b64.decode(s.trim())
            .map_err(|e| Error::configuration("object", format!("{} key {}: invalid base64: {}", key, field, e)))
    };
    if key.kind == "Secret" {
        if let Some(s) = obj.pointer("/stringData").and_then(|d| d.get(field)).and_then(Json::as_str) {
            return Ok(s.as_bytes().to_vec());
        }
        if let Some(s) = obj.pointer("/data").and_then(|d| d.get(field)).and_then(Json::as_str) {
            return decode(s);
        }
    } else {
        if let Some(s) = obj.pointer("/data").and_then(|d| d.get(field)).and_then(Json::as_str) {
            return Ok(s.as_bytes().to_vec());
        }
        if let Some(s) = obj.pointer("/binaryData").and_then(|d| d.get(field)).and_then(Json::as_str) {
            return decode(s);
        }
    }
    Err(Error::not_found(key.kind.clone(), object_name(key), Some(field)))
}

pub(crate) fn object_name(key: &ObjectKey) -> String {
    match &key.namespace {
        Some(ns) => format!("{}/{}", ns, key.name),
        None => key.name.clone(),
    }
}

/// Equality-only label selector match (`a=b,c=d`; bare `a` means "has label").
pub(crate) fn labels_match(obj: &Json, selector: Option<&str>) -> bool {
    let Some(sel) = selector.filter(|s| !s.trim().is_empty()) else { return true };
    let labels = obj.pointer("/metadata/labels").and_then(Json::as_object);
    sel.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        let Some(labels) = labels else { return false };
        match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).and_then(Json::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        }
    })
}
