#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use keel_config::MemoryProfiles;
use keel_core::{DesiredState, Operation, RetryableError};
use keel_engine::{Component, ComponentContext, Registry};
use keel_kubehub::MemoryStore;
use serde_json::json;

pub const RETRY_DELAY: Duration = Duration::from_millis(750);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

/// Scriptable component: records every hook call, can be made unready, or told to fail
/// (fatally or with a retry signal) on one operation.
pub struct Fake {
    name: String,
    deps: Vec<String>,
    min_version: Option<String>,
    ready: AtomicBool,
    fail: Mutex<Option<Operation>>,
    retry: Mutex<Option<Operation>>,
    calls: Mutex<Vec<Operation>>,
}

impl Fake {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deps: Vec::new(),
            min_version: None,
            ready: AtomicBool::new(true),
            fail: Mutex::new(None),
            retry: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn requires_version(mut self, v: &str) -> Self {
        self.min_version = Some(v.to_string());
        self
    }

    pub fn unready(self) -> Self {
        self.set_ready(false);
        self
    }

    pub fn set_ready(&self, ready: bool) { self.ready.store(ready, Ordering::SeqCst) }
    pub fn fail_on(&self, op: Option<Operation>) { *lock(&self.fail) = op }
    pub fn retry_on(&self, op: Option<Operation>) { *lock(&self.retry) = op }
    pub fn calls(&self) -> Vec<Operation> { lock(&self.calls).clone() }
    pub fn count(&self, op: Operation) -> usize { lock(&self.calls).iter().filter(|&&c| c == op).count() }

    fn hit(&self, op: Operation) -> anyhow::Result<()> {
        lock(&self.calls).push(op);
        if *lock(&self.fail) == Some(op) {
            anyhow::bail!("{} exploded", op);
        }
        if *lock(&self.retry) == Some(op) {
            return Err(RetryableError::new(self.name.clone()).with_delay(RETRY_DELAY).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Component for Fake {
    fn name(&self) -> &str { &self.name }
    fn dependencies(&self) -> &[String] { &self.deps }
    fn min_version(&self) -> Option<&str> { self.min_version.as_deref() }

    async fn is_ready(&self, _ctx: &ComponentContext<'_>) -> bool { self.ready.load(Ordering::SeqCst) }

    async fn pre_install(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::PreInstall) }
    async fn install(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::Install) }
    async fn post_install(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::PostInstall) }
    async fn pre_upgrade(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::PreUpgrade) }
    async fn upgrade(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::Upgrade) }
    async fn post_upgrade(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::PostUpgrade) }
    async fn reconcile(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { self.hit(Operation::Reconcile) }
}

/// Resource `keel/main` enabling `enabled` and disabling `disabled`.
pub fn resource(enabled: &[&str], disabled: &[&str], version: Option<&str>) -> DesiredState {
    let mut components = serde_json::Map::new();
    for name in enabled {
        components.insert(name.to_string(), json!({ "enabled": true }));
    }
    for name in disabled {
        components.insert(name.to_string(), json!({ "enabled": false }));
    }
    let mut spec = json!({ "components": components });
    if let Some(v) = version {
        spec["version"] = json!(v);
    }
    serde_json::from_value(json!({
        "apiVersion": keel_core::API_VERSION,
        "kind": keel_core::KIND,
        "metadata": { "name": "main", "namespace": "keel", "generation": 1 },
        "spec": spec,
    }))
    .unwrap()
}

pub fn profiles() -> MemoryProfiles { MemoryProfiles::new().with("prod", json!({})) }

/// Object store holding `desired` so status writes have something to update.
pub fn store_with(desired: &DesiredState) -> MemoryStore {
    let store = MemoryStore::new();
    store.insert(serde_json::to_value(desired).unwrap()).unwrap();
    store
}

pub fn registry(components: &[Arc<Fake>]) -> Registry {
    let mut reg = Registry::new();
    for c in components {
        reg.register(c.clone()).unwrap();
    }
    reg
}
