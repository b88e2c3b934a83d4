use keel_core::{DesiredState, Error, Result};
use keel_kubehub::{ObjectKey, ObjectStore};
use serde_json::Value as Json;
use tracing::debug;

/// Write `desired.status` back onto the stored resource with a single `update`.
///
/// Only the status block is replaced; the stored spec is left as the user last wrote it.
/// The new `resourceVersion` is copied back into `desired`.
pub async fn persist_status(store: &dyn ObjectStore, desired: &mut DesiredState) -> Result<()> {
    let key = ObjectKey::new(
        &desired.api_version,
        &desired.kind,
        desired.metadata.namespace.as_deref(),
        &desired.metadata.name,
    );
    let mut current = store.get(&key).await?;
    let status = serde_json::to_value(&desired.status)
        .map_err(|e| Error::configuration("status", format!("encoding status: {}", e)))?;
    match current.as_object_mut() {
        Some(obj) => {
            obj.insert("status".to_string(), status);
        }
        None => return Err(Error::configuration("status", format!("{} is not an object", key))),
    }
    let updated = store.update(current).await?;
    if let Some(rv) = updated.pointer("/metadata/resourceVersion").and_then(Json::as_str) {
        desired.metadata.resource_version = Some(rv.to_string());
    }
    debug!(resource = %key, components = desired.status.components.len(), "status persisted");
    Ok(())
}
