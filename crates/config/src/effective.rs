use std::time::Instant;

use keel_core::{DesiredState, EffectiveState, Error, Result, BASE_PROFILE, DEFAULT_PROFILE};
use keel_merge::{strategic_merge, strip_status, MergeOptions};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use crate::ProfileStore;

/// Profiles named by the resource (`spec.profile` may be a comma separated list), in
/// application order. Falls back to `default`.
pub fn profile_names(desired: &DesiredState, default: &str) -> Vec<String> {
    let names: Vec<String> = desired
        .spec
        .profile
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() { vec![default.to_string()] } else { names }
}

fn as_configuration(e: Error) -> Error {
    match e {
        Error::MergeConflict { .. } => Error::configuration("effective-state", e.to_string()),
        other => other,
    }
}

fn profile_layer(mut doc: Json) -> Json {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("metadata");
    }
    strip_status(doc)
}

fn component_overrides(doc: &Json) -> Vec<(String, Vec<Json>)> {
    doc.pointer("/spec/components")
        .and_then(Json::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(name, c)| {
                    c.get("overrides")
                        .and_then(Json::as_array)
                        .filter(|a| !a.is_empty())
                        .map(|a| (name.clone(), a.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Strategic merge of `upper` onto `lower`, except that per-component `overrides` lists from
/// both sides are concatenated (lower first) instead of the upper list replacing the lower.
fn merge_layer(lower: &Json, upper: &Json, opts: &MergeOptions) -> Result<Json> {
    let mut merged = strategic_merge(lower, upper, opts)?;
    let upper_ov: FxHashMap<String, Vec<Json>> = component_overrides(upper).into_iter().collect();
    for (name, mut combined) in component_overrides(lower) {
        let Some(up) = upper_ov.get(&name) else { continue };
        combined.extend(up.iter().cloned());
        let slot = merged
            .get_mut("spec")
            .and_then(|s| s.get_mut("components"))
            .and_then(|c| c.get_mut(&name))
            .and_then(Json::as_object_mut);
        if let Some(component) = slot {
            component.insert("overrides".to_string(), Json::Array(combined));
        }
    }
    Ok(merged)
}

/// Effective state = base profile (if present) + named profiles + user resource, last wins.
///
/// Pure: `desired` is not touched and status never reaches the result. A missing named
/// profile, an unparsable profile or a structural merge conflict is `Error::Configuration`.
pub fn effective_state(desired: &DesiredState, profiles: &dyn ProfileStore, opts: &MergeOptions) -> Result<EffectiveState> {
    effective_state_with_default(desired, profiles, opts, DEFAULT_PROFILE)
}

/// [`effective_state`] with a configurable fallback profile name.
pub fn effective_state_with_default(
    desired: &DesiredState,
    profiles: &dyn ProfileStore,
    opts: &MergeOptions,
    default_profile: &str,
) -> Result<EffectiveState> {
    let t0 = Instant::now();
    let mut acc = match profiles.load_profile(BASE_PROFILE) {
        Ok(doc) => profile_layer(doc),
        Err(e) if e.is_not_found() => Json::Null,
        Err(e) => return Err(e),
    };
    let names = profile_names(desired, default_profile);
    for name in names.iter().filter(|n| n.as_str() != BASE_PROFILE) {
        let doc = profiles.load_profile(name).map_err(|e| {
            if e.is_not_found() {
                Error::configuration("profile", format!("profile {} does not exist", name))
            } else {
                e
            }
        })?;
        acc = merge_layer(&acc, &profile_layer(doc), opts).map_err(as_configuration)?;
    }

    let user = serde_json::to_value(desired)
        .map_err(|e| Error::configuration("effective-state", format!("encoding resource: {}", e)))?;
    let merged = merge_layer(&acc, &strip_status(user), opts).map_err(as_configuration)?;
    let cr: DesiredState = serde_json::from_value(merged)
        .map_err(|e| Error::configuration("effective-state", format!("decoding merged resource: {}", e)))?;
    debug!(profiles = ?names, took_ms = %t0.elapsed().as_millis(), "effective state computed");
    Ok(EffectiveState::from_merged(cr))
}
