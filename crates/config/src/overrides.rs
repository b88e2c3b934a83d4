use keel_core::{Error, OverrideSource, Result};
use keel_kubehub::{ObjectKey, ObjectStore};
use keel_persist::Store;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Resolves ranked override sources into payloads, preserving order.
///
/// References are looked up in `namespace` (the resource's namespace). An optional reference
/// that cannot be fetched is skipped with a warning; a required one fails the resolution.
pub struct OverrideResolver<'a> {
    store: &'a dyn ObjectStore,
    history: Option<&'a dyn Store>,
    namespace: Option<String>,
}

impl<'a> OverrideResolver<'a> {
    pub fn new(store: &'a dyn ObjectStore, namespace: Option<&str>) -> Self {
        Self { store, history: None, namespace: namespace.map(|s| s.to_string()) }
    }

    /// Enable the previously-applied values source.
    pub fn with_history(mut self, history: &'a dyn Store) -> Self {
        self.history = Some(history);
        self
    }

    pub async fn resolve(&self, sources: &[OverrideSource]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(sources.len());
        for source in sources {
            if let Some(bytes) = self.resolve_one(source).await? {
                out.push(bytes);
            }
        }
        Ok(out)
    }

    /// [`resolve`](Self::resolve) followed by parsing each payload. Empty payloads are dropped.
    pub async fn resolve_documents(&self, sources: &[OverrideSource]) -> Result<Vec<Json>> {
        let mut docs = Vec::new();
        for bytes in self.resolve(sources).await? {
            let doc = keel_merge::parse_document(&bytes)?;
            if !doc.is_null() {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn resolve_one(&self, source: &OverrideSource) -> Result<Option<Vec<u8>>> {
        let ns = self.namespace.as_deref();
        let (key, r) = match source {
            OverrideSource::Values(v) => {
                let bytes = serde_json::to_vec(v)
                    .map_err(|e| Error::configuration("overrides", format!("encoding inline values: {}", e)))?;
                return Ok(Some(bytes));
            }
            OverrideSource::LastApplied { component } => return self.last_applied(component),
            OverrideSource::ConfigMapRef(r) => (ObjectKey::config_map(ns, &r.name), r),
            OverrideSource::SecretRef(r) => (ObjectKey::secret(ns, &r.name), r),
        };
        match self.store.get_field(&key, &r.key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if r.is_optional() => {
                warn!(source = %key, key = %r.key, error = %e, "optional override source skipped");
                counter!("override_skipped_total", 1u64);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn last_applied(&self, component: &str) -> Result<Option<Vec<u8>>> {
        let Some(history) = self.history else { return Ok(None) };
        let rows = history.get_last(component, Some(1)).map_err(Error::Persist)?;
        match rows.into_iter().next() {
            Some(row) => {
                let values = row.values().map_err(Error::Persist)?;
                let bytes = serde_json::to_vec(&values)
                    .map_err(|e| Error::configuration("overrides", format!("encoding applied values: {}", e)))?;
                Ok(Some(bytes))
            }
            None => {
                debug!(component = %component, "no previously applied values");
                Ok(None)
            }
        }
    }
}
