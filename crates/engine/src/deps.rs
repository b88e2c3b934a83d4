use futures::future::{BoxFuture, FutureExt};
use keel_core::{Error, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::{Component, ComponentContext, Registry};

/// Dependency name -> "enabled, ready, and so is everything below it", filled once per
/// name per resolution.
pub type ReadinessCache = FxHashMap<String, bool>;

/// True when every dependency of `component`, direct or transitive, is enabled and reports
/// ready. Readiness is the dependency's own predicate, not its lifecycle state.
///
/// The whole transitive graph is walked so a cycle anywhere below `component` (including a
/// self-dependency) is reported as `Error::DependencyCycle`; an unregistered name is
/// `Error::MissingDependency`.
pub async fn dependencies_satisfied(component: &dyn Component, registry: &Registry, ctx: &ComponentContext<'_>) -> Result<bool> {
    if component.dependencies().is_empty() {
        return Ok(true);
    }
    let mut visited = FxHashSet::default();
    visited.insert(component.name().to_string());
    let mut cache = ReadinessCache::default();
    trace_dependencies(component, registry, ctx, &mut visited, &mut cache).await?;
    let missing: Vec<&str> = component
        .dependencies()
        .iter()
        .filter(|d| !cache.get(d.as_str()).copied().unwrap_or(false))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        debug!(component = %component.name(), waiting_for = ?missing, "dependencies not ready");
    }
    Ok(missing.is_empty())
}

/// Depth-first walk of `component`'s dependencies.
///
/// `visited` holds the names on the active path (the caller seeds it with the entry
/// component); `cache` records the readiness of every dependency already resolved, so
/// shared sub-graphs are evaluated once.
pub fn trace_dependencies<'a, 'c: 'a>(
    component: &'a dyn Component,
    registry: &'a Registry,
    ctx: &'a ComponentContext<'c>,
    visited: &'a mut FxHashSet<String>,
    cache: &'a mut ReadinessCache,
) -> BoxFuture<'a, Result<()>> {
    async move {
        for dep in component.dependencies() {
            if cache.contains_key(dep.as_str()) {
                continue;
            }
            if dep == component.name() || visited.contains(dep.as_str()) {
                return Err(Error::DependencyCycle { component: component.name().to_string(), dependency: dep.clone() });
            }
            let Some(found) = registry.find(dep) else {
                return Err(Error::MissingDependency { component: component.name().to_string(), dependency: dep.clone() });
            };
            visited.insert(dep.clone());
            trace_dependencies(found.as_ref(), registry, ctx, &mut *visited, &mut *cache).await?;
            visited.remove(dep.as_str());
            let below = found.dependencies().iter().all(|d| cache.get(d.as_str()).copied().unwrap_or(false));
            let ready = below && found.is_enabled(ctx.effective()) && found.is_ready(ctx).await;
            cache.insert(dep.clone(), ready);
        }
        Ok(())
    }
    .boxed()
}
