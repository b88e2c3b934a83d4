use async_trait::async_trait;
use keel_config::OverrideResolver;
use keel_core::{EffectiveState, Error, InstallArg, OverrideSource, Result};
use keel_kubehub::ObjectStore;
use keel_merge::{merge_all, merge_overrides, MergeOptions};
use keel_persist::{LastApplied, Store};
use serde_json::{Map, Value as Json};
use tracing::debug;

/// One independently lifecycled unit of the platform.
///
/// Hooks must be idempotent: the engine re-invokes them with the same inputs until they
/// succeed. A hook signals "not done yet" by returning a [`keel_core::RetryableError`] (or
/// `Error::Retryable`) through its `anyhow::Error`; anything else is a fatal failure for this pass.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(&self) -> &[String] { &[] }

    /// Minimum installed platform version required before this component may install.
    fn min_version(&self) -> Option<&str> { None }

    fn is_enabled(&self, effective: &EffectiveState) -> bool { effective.is_component_enabled(self.name(), false) }

    /// Current operational health, independent of lifecycle state.
    async fn is_ready(&self, ctx: &ComponentContext<'_>) -> bool;

    async fn pre_install(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }
    async fn install(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }
    async fn post_install(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }
    async fn pre_upgrade(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }
    async fn upgrade(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }
    async fn post_upgrade(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }

    /// Steady-state hook run on every pass while the component is Ready.
    async fn reconcile(&self, _ctx: &ComponentContext<'_>) -> anyhow::Result<()> { Ok(()) }
}

/// What a hook gets to see: the effective state plus handles to the outside world.
pub struct ComponentContext<'a> {
    effective: &'a EffectiveState,
    store: &'a dyn ObjectStore,
    history: Option<&'a dyn Store>,
    merge: MergeOptions,
    record_history: bool,
}

impl<'a> ComponentContext<'a> {
    pub fn new(effective: &'a EffectiveState, store: &'a dyn ObjectStore) -> Self {
        Self { effective, store, history: None, merge: MergeOptions::default(), record_history: true }
    }

    pub fn with_history(mut self, history: &'a dyn Store) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_merge_options(mut self, merge: MergeOptions) -> Self {
        self.merge = merge;
        self
    }

    /// Read previously-applied values but never write new rows.
    pub fn without_recording(mut self) -> Self {
        self.record_history = false;
        self
    }

    pub fn effective(&self) -> &EffectiveState { self.effective }
    pub fn store(&self) -> &dyn ObjectStore { self.store }
    pub fn namespace(&self) -> Option<&str> { self.effective.resource().metadata.namespace.as_deref() }
    pub fn merge_options(&self) -> &MergeOptions { &self.merge }

    /// The component's override sources resolved to documents, lowest precedence first.
    pub async fn resolve_overrides(&self, component: &str) -> Result<Vec<Json>> {
        let mut resolver = OverrideResolver::new(self.store, self.namespace());
        if let Some(h) = self.history {
            resolver = resolver.with_history(h);
        }
        let mut docs = resolver.resolve_documents(self.effective.overrides(component)).await?;
        if let Some(spec) = self.effective.component(component) {
            let args = install_args_values(&spec.install_args);
            if !args.is_null() {
                docs.push(args);
            }
        }
        Ok(docs)
    }

    /// Authoritative settings for `component`: `baseline` < previously-applied values <
    /// overrides.
    ///
    /// Only the user layers (overrides and install arguments) are recorded as the new
    /// previously-applied values, so a changed baseline always shows through.
    pub async fn merged_values(&self, component: &str, baseline: &Json) -> Result<Json> {
        let overrides = self.resolve_overrides(component).await?;
        let live = match self.history {
            Some(h) => OverrideResolver::new(self.store, self.namespace())
                .with_history(h)
                .resolve_documents(&[OverrideSource::LastApplied { component: component.to_string() }])
                .await?
                .into_iter()
                .next(),
            None => None,
        };
        let merged = merge_overrides(baseline, live.as_ref(), &overrides, &self.merge)?;
        if let (Some(h), true) = (self.history, self.record_history) {
            let applied = merge_all(&overrides, &self.merge)?;
            if applied != live.unwrap_or(Json::Null) {
                let generation = self.effective.resource().metadata.generation;
                let row = LastApplied::new(component, generation, &applied).map_err(Error::Persist)?;
                h.put_last(row).map_err(Error::Persist)?;
                debug!(component = %component, generation, "applied values recorded");
            }
        }
        Ok(merged)
    }
}

/// Install arguments as a document: `a.b.c=v` becomes `{a: {b: {c: v}}}`. Values are typed
/// as YAML scalars unless `setString` is set.
pub fn install_args_values(args: &[InstallArg]) -> Json {
    let mut root = Map::new();
    for arg in args.iter().filter(|a| !a.name.is_empty()) {
        let value = if arg.set_string {
            Json::String(arg.value.clone())
        } else {
            match keel_merge::parse_document(arg.value.as_bytes()) {
                Ok(v @ (Json::Bool(_) | Json::Number(_) | Json::String(_))) => v,
                _ => Json::String(arg.value.clone()),
            }
        };
        let mut parts = arg.name.split('.').peekable();
        let mut node = &mut root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.insert(part.to_string(), value);
                break;
            }
            let entry = node.entry(part.to_string()).or_insert_with(|| Json::Object(Map::new()));
            if !entry.is_object() {
                *entry = Json::Object(Map::new());
            }
            node = match entry.as_object_mut() {
                Some(m) => m,
                None => break,
            };
        }
    }
    if root.is_empty() { Json::Null } else { Json::Object(root) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arg(name: &str, value: &str, set_string: bool) -> InstallArg {
        InstallArg { name: name.into(), value: value.into(), set_string }
    }

    #[test]
    fn install_args_nest_and_type_values() {
        let v = install_args_values(&[
            arg("replicas", "3", false),
            arg("image.tag", "1.0", true),
            arg("image.pull", "true", false),
            arg("label", "a: b", false),
        ]);
        assert_eq!(v, json!({ "replicas": 3, "image": { "tag": "1.0", "pull": true }, "label": "a: b" }));
        assert!(install_args_values(&[]).is_null());
    }
}
