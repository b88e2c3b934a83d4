//! In-memory object store used by tests and by the CLI when no cluster is involved.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use base64::Engine as _;
use keel_core::{Error, Result};
use serde_json::{json, Value as Json};

use crate::{labels_match, object_name, ListSelector, ObjectKey, ObjectStore};

/// Objects keyed by [`ObjectKey`]; `resourceVersion` is bumped on every write and checked on
/// update when the incoming object carries one.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, Json>>,
    rv: AtomicU64,
    updates: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Seed an object without going through `create` bookkeeping.
    pub fn insert(&self, obj: Json) -> Result<()> {
        let key = ObjectKey::from_object(&obj)?;
        self.write().insert(key, obj);
        Ok(())
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Result<()> {
        let data: serde_json::Map<String, Json> = data.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
        self.insert(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": data,
        }))
    }

    /// Values are stored base64-encoded, as the API server does.
    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) -> Result<()> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let data: serde_json::Map<String, Json> = data.iter().map(|(k, v)| (k.to_string(), json!(b64.encode(v)))).collect();
        self.insert(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": name, "namespace": namespace },
            "data": data,
        }))
    }

    /// Number of successful `update` calls so far.
    pub fn update_count(&self) -> usize { self.updates.load(Ordering::Relaxed) }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<Json> {
        self.objects.read().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ObjectKey, Json>> {
        self.objects.write().unwrap_or_else(|p| p.into_inner())
    }

    fn stamp(&self, obj: &mut Json) {
        let rv = self.rv.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.insert("resourceVersion".into(), json!(rv.to_string()));
        }
    }
}

fn resource_version(obj: &Json) -> Option<&str> { obj.pointer("/metadata/resourceVersion").and_then(Json::as_str) }

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Json> {
        self.snapshot(key).ok_or_else(|| Error::not_found(key.kind.clone(), object_name(key), None))
    }

    async fn create(&self, mut obj: Json) -> Result<Json> {
        let key = ObjectKey::from_object(&obj)?;
        let mut objects = self.write();
        if objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }
        self.stamp(&mut obj);
        objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, mut obj: Json) -> Result<Json> {
        let key = ObjectKey::from_object(&obj)?;
        let mut objects = self.write();
        let current = objects.get(&key).ok_or_else(|| Error::not_found(key.kind.clone(), object_name(&key), None))?;
        if let Some(rv) = resource_version(&obj) {
            if resource_version(current) != Some(rv) {
                return Err(Error::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        self.stamp(&mut obj);
        objects.insert(key, obj.clone());
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(key.kind.clone(), object_name(key), None))
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<Json>> {
        let objects = self.objects.read().unwrap_or_else(|p| p.into_inner());
        Ok(objects
            .iter()
            .filter(|(k, _)| k.api_version == selector.api_version && k.kind == selector.kind)
            .filter(|(k, _)| selector.namespace.is_none() || k.namespace == selector.namespace)
            .filter(|(_, v)| labels_match(v, selector.labels.as_deref()))
            .map(|(_, v)| v.clone())
            .collect())
    }
}
