//! kube-rs backed object store using dynamic objects.

use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use keel_core::{Error, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{object_name, ListSelector, ObjectKey, ObjectStore};

pub struct KubeStore {
    client: Client,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, resources: Mutex::new(FxHashMap::default()) } }

    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client").map_err(Error::Store)?;
        Ok(Self::new(client))
    }

    async fn resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool)> {
        let cache_key = format!("{}/{}", api_version, kind);
        if let Some(hit) = self.resources.lock().unwrap_or_else(|p| p.into_inner()).get(&cache_key) {
            return Ok(hit.clone());
        }
        let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let t0 = Instant::now();
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| map_kube_err(e, kind, &cache_key, None))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %cache_key, namespaced, took_ms = %t0.elapsed().as_millis(), "kube: resource discovered");
        self.resources
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(cache_key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resource(api_version, kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        })
    }
}

fn map_kube_err(e: kube::Error, kind: &str, name: &str, key: Option<&str>) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name, key),
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(format!("{} {}: {}", kind, name, ae.message)),
        other => Error::Store(anyhow!(other)),
    }
}

fn to_dynamic(obj: Json) -> Result<DynamicObject> {
    serde_json::from_value(obj).context("decoding object").map_err(Error::Store)
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    let mut v = serde_json::to_value(obj).context("encoding object").map_err(Error::Store)?;
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
    Ok(v)
}

fn observe(op: &'static str, t0: Instant) {
    histogram!("kube_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    counter!("kube_request_total", 1u64, "op" => op);
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Json> {
        let t0 = Instant::now();
        let api = self.api_for(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
        let obj = api.get(&key.name).await.map_err(|e| map_kube_err(e, &key.kind, &object_name(key), None))?;
        observe("get", t0);
        to_json(&obj)
    }

    async fn create(&self, obj: Json) -> Result<Json> {
        let t0 = Instant::now();
        let key = ObjectKey::from_object(&obj)?;
        let api = self.api_for(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_err(e, &key.kind, &object_name(&key), None))?;
        observe("create", t0);
        info!(object = %key, took_ms = %t0.elapsed().as_millis(), "kube: created");
        to_json(&created)
    }

    async fn update(&self, obj: Json) -> Result<Json> {
        let t0 = Instant::now();
        let key = ObjectKey::from_object(&obj)?;
        let api = self.api_for(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
        let replaced = api
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_err(e, &key.kind, &object_name(&key), None))?;
        observe("update", t0);
        debug!(object = %key, took_ms = %t0.elapsed().as_millis(), "kube: updated");
        to_json(&replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let t0 = Instant::now();
        let api = self.api_for(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
        api.delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(e, &key.kind, &object_name(key), None))?;
        observe("delete", t0);
        info!(object = %key, "kube: deleted");
        Ok(())
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<Json>> {
        let t0 = Instant::now();
        let api = match selector.namespace.as_deref() {
            Some(ns) => self.api_for(&selector.api_version, &selector.kind, Some(ns)).await?,
            None => {
                let (ar, _) = self.resource(&selector.api_version, &selector.kind).await?;
                Api::all_with(self.client.clone(), &ar)
            }
        };
        let mut lp = ListParams::default();
        if let Some(l) = selector.labels.as_deref() {
            lp = lp.labels(l);
        }
        let list = api
            .list(&lp)
            .await
            .map_err(|e| map_kube_err(e, &selector.kind, "(list)", None))?;
        observe("list", t0);
        list.items.iter().map(to_json).collect()
    }
}
