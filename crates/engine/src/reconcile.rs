use std::time::{Duration, Instant};

use keel_config::{effective_state_with_default, EngineSettings, ProfileStore};
use keel_core::version::{is_older, version_at_least};
use keel_core::{
    ComponentStatusDetails, ConditionType, DesiredState, EffectiveState, Error, Operation, Result, RetryableError, State,
};
use keel_kubehub::ObjectStore;
use keel_persist::Store;
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::{dependencies_satisfied, persist_status, Component, ComponentContext, Registry, RequeuePolicy};

/// Result of driving one component one step.
#[derive(Debug)]
pub enum Outcome {
    /// Nothing left to do for this component in this pass.
    Complete,
    /// Progress was made or is pending; call again later.
    Requeue(RetryableError),
}

impl Outcome {
    pub fn is_complete(&self) -> bool { matches!(self, Outcome::Complete) }
}

fn requeue(component: &str, op: Operation) -> Outcome {
    Outcome::Requeue(RetryableError::new(component).with_operation(op))
}

/// Map a hook result: retry signals become `Some`, fatal errors propagate.
fn hook_result(component: &str, op: Operation, res: anyhow::Result<()>) -> Result<Option<RetryableError>> {
    match res {
        Ok(()) => Ok(None),
        Err(e) => match Error::hook(component, op, e) {
            Error::Retryable(mut r) => {
                if r.operation.is_none() {
                    r.operation = Some(op);
                }
                Ok(Some(r))
            }
            other => Err(other),
        },
    }
}

macro_rules! run_hook {
    ($component:expr, $op:expr, $call:expr) => {{
        let (name, op): (&str, Operation) = ($component.name(), $op);
        if let Some(r) = hook_result(name, op, $call.await)? {
            debug!(component = %name, operation = %op, "hook asked to retry");
            return Ok(Outcome::Requeue(r));
        }
    }};
}

fn transition(status: &mut ComponentStatusDetails, to: State, condition: ConditionType, message: &str) {
    let from = status.state;
    status.state = to;
    status.append_condition(condition, Some(message.to_string()));
    counter!("component_transition_total", 1u64);
    info!(component = %status.name, from = %from, to = %to, "component transition");
}

fn upgrade_due(status: &ComponentStatusDetails, effective: &EffectiveState) -> Result<bool> {
    match (status.version.as_deref(), effective.target_version()) {
        (Some(current), Some(target)) => is_older(current, target),
        // installed before any target was set
        (None, Some(_)) => Ok(true),
        (_, None) => Ok(false),
    }
}

/// Drive `component` one step through its lifecycle.
///
/// `status` is the component's entry in the resource status block and is updated in place.
/// `installed_version` is the platform version recorded on the resource (gates install of
/// components that declare a minimum version). A fatal error records an `InstallFailed` or
/// `UpgradeFailed` condition (replacing an earlier one of the same type) and leaves the state
/// as it was; the condition is dropped once the install or upgrade completes.
pub async fn reconcile_one(
    component: &dyn Component,
    ctx: &ComponentContext<'_>,
    registry: &Registry,
    status: &mut ComponentStatusDetails,
    installed_version: Option<&str>,
) -> Result<Outcome> {
    let state = status.state;
    match step(component, ctx, registry, status, installed_version).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            let op = failed_operation(&e, state);
            let upgrading = state == State::Upgrading
                || matches!(op, Operation::PreUpgrade | Operation::Upgrade | Operation::PostUpgrade);
            let kind = if upgrading { ConditionType::UpgradeFailed } else { ConditionType::InstallFailed };
            // latest failure wins
            status.clear_conditions(|t| t == kind);
            status.append_condition(kind, Some(e.to_string()));
            counter!("reconcile_fatal_total", 1u64);
            error!(component = %component.name(), operation = %op, state = ?state, error = %e, "component reconcile failed");
            Err(e)
        }
    }
}

fn failed_operation(e: &Error, state: State) -> Operation {
    match e {
        Error::Hook { operation, .. } => *operation,
        Error::DependencyCycle { .. } | Error::MissingDependency { .. } => Operation::Dependencies,
        Error::NotFound { .. } | Error::MergeConflict { .. } => Operation::Overrides,
        _ => match state {
            State::Disabled => Operation::PreInstall,
            State::PreInstalling | State::Installing => Operation::Install,
            State::Upgrading => Operation::Upgrade,
            State::Ready => Operation::Reconcile,
        },
    }
}

async fn step(
    component: &dyn Component,
    ctx: &ComponentContext<'_>,
    registry: &Registry,
    status: &mut ComponentStatusDetails,
    installed_version: Option<&str>,
) -> Result<Outcome> {
    let name = component.name();
    let effective = ctx.effective();
    if !component.is_enabled(effective) {
        if status.state != State::Disabled {
            debug!(component = %name, state = %status.state, "component disabled in effective state, leaving as is");
        }
        return Ok(Outcome::Complete);
    }

    match status.state {
        State::Disabled => {
            if let (Some(min), Some(installed)) = (component.min_version(), installed_version) {
                if !version_at_least(installed, min)? {
                    info!(component = %name, min_version = %min, installed = %installed, "install waits for platform upgrade");
                    return Ok(Outcome::Complete);
                }
            }
            transition(status, State::PreInstalling, ConditionType::PreInstall, "pre-install started");
            Ok(requeue(name, Operation::PreInstall))
        }
        State::PreInstalling => {
            if !dependencies_satisfied(component, registry, ctx).await? {
                debug!(component = %name, dependencies = ?component.dependencies(), "waiting for dependencies");
                return Ok(requeue(name, Operation::Dependencies));
            }
            run_hook!(component, Operation::PreInstall, component.pre_install(ctx));
            run_hook!(component, Operation::Install, component.install(ctx));
            transition(status, State::Installing, ConditionType::InstallStarted, "install started");
            Ok(requeue(name, Operation::Install))
        }
        State::Installing => {
            if !component.is_ready(ctx).await {
                debug!(component = %name, "installed, waiting for ready");
                return Ok(requeue(name, Operation::Install));
            }
            run_hook!(component, Operation::PostInstall, component.post_install(ctx));
            status.version = effective.target_version().or(installed_version).map(str::to_string);
            status.clear_conditions(|t| t == ConditionType::InstallFailed);
            transition(status, State::Ready, ConditionType::InstallComplete, "install complete");
            Ok(Outcome::Complete)
        }
        State::Upgrading => {
            if !component.is_ready(ctx).await {
                debug!(component = %name, "upgraded, waiting for ready");
                return Ok(requeue(name, Operation::Upgrade));
            }
            run_hook!(component, Operation::PostUpgrade, component.post_upgrade(ctx));
            status.version = effective.target_version().map(str::to_string);
            status.clear_conditions(|t| t == ConditionType::UpgradeFailed);
            transition(status, State::Ready, ConditionType::UpgradeComplete, "upgrade complete");
            Ok(Outcome::Complete)
        }
        State::Ready => {
            if upgrade_due(status, effective)? {
                run_hook!(component, Operation::PreUpgrade, component.pre_upgrade(ctx));
                run_hook!(component, Operation::Upgrade, component.upgrade(ctx));
                status.clear_conditions(ConditionType::is_upgrade);
                transition(status, State::Upgrading, ConditionType::UpgradeStarted, "upgrade started");
                return Ok(requeue(name, Operation::Upgrade));
            }
            if !component.is_ready(ctx).await {
                debug!(component = %name, "ready component reports not ready");
                return Ok(requeue(name, Operation::Reconcile));
            }
            run_hook!(component, Operation::Reconcile, component.reconcile(ctx));
            Ok(Outcome::Complete)
        }
    }
}

#[derive(Debug)]
pub struct ComponentFailure {
    pub component: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct PassResult {
    /// Set when at least one component asked to be called again.
    pub requeue_after: Option<Duration>,
    pub requeued: Vec<String>,
    pub failures: Vec<ComponentFailure>,
}

impl PassResult {
    /// Nothing pending and nothing failed.
    pub fn is_settled(&self) -> bool { self.requeue_after.is_none() && self.failures.is_empty() }
}

/// One reconciliation pass over every registered component.
pub struct Reconciler<'a> {
    registry: &'a Registry,
    profiles: &'a dyn ProfileStore,
    store: &'a dyn ObjectStore,
    history: Option<&'a dyn Store>,
    settings: EngineSettings,
    requeue: RequeuePolicy,
}

impl<'a> Reconciler<'a> {
    pub fn new(registry: &'a Registry, profiles: &'a dyn ProfileStore, store: &'a dyn ObjectStore) -> Self {
        Self { registry, profiles, store, history: None, settings: EngineSettings::default(), requeue: RequeuePolicy::default() }
    }

    pub fn with_history(mut self, history: &'a dyn Store) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.requeue = RequeuePolicy::from_settings(&settings);
        self.settings = settings;
        self
    }

    pub fn with_requeue_policy(mut self, policy: RequeuePolicy) -> Self {
        self.requeue = policy;
        self
    }

    /// Compute the effective state, visit components dependencies-first, then write the
    /// status block back once. Per-component fatal errors are collected, not returned; only
    /// failures that prevent the pass as a whole (effective state, status write) are `Err`.
    pub async fn reconcile_pass(&self, desired: &mut DesiredState) -> Result<PassResult> {
        let t0 = Instant::now();
        counter!("reconcile_pass_total", 1u64);
        let merge = self.settings.merge_options();
        let effective = effective_state_with_default(desired, self.profiles, &merge, &self.settings.default_profile)
            .map_err(|e| {
                error!(resource = %desired.metadata.name, operation = %Operation::Reconcile, error = %e, "effective state failed");
                e
            })?;

        let mut ctx = ComponentContext::new(&effective, self.store).with_merge_options(merge);
        if let Some(h) = self.history.filter(|_| !self.settings.disable_last_applied) {
            ctx = ctx.with_history(h);
        }

        let order = match self.registry.ordered() {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "dependency order unavailable, visiting in registration order");
                self.registry.iter().cloned().collect()
            }
        };

        let installed = desired.installed_version().map(str::to_string);
        let mut signals: Vec<RetryableError> = Vec::new();
        let mut result = PassResult::default();
        for component in order {
            let name = component.name().to_string();
            let status = desired.component_status_mut(&name);
            match reconcile_one(component.as_ref(), &ctx, self.registry, status, installed.as_deref()).await {
                Ok(Outcome::Complete) => {}
                Ok(Outcome::Requeue(r)) => {
                    debug!(component = %name, signal = %r, "requeue requested");
                    result.requeued.push(name);
                    signals.push(r);
                }
                Err(error) => result.failures.push(ComponentFailure { component: name, error }),
            }
        }

        if signals.is_empty() && result.failures.is_empty() {
            self.record_platform_version(desired, &effective);
        }

        if !desired.metadata.name.is_empty() {
            match persist_status(self.store, desired).await {
                Ok(()) => {}
                Err(Error::Conflict(msg)) => {
                    warn!(resource = %desired.metadata.name, conflict = %msg, "status write conflicted");
                    signals.push(
                        RetryableError::new(desired.metadata.name.clone())
                            .with_operation(Operation::Reconcile)
                            .with_cause(msg),
                    );
                }
                Err(e) => {
                    error!(resource = %desired.metadata.name, operation = %Operation::Reconcile, error = %e, "status write failed");
                    return Err(e);
                }
            }
        }

        result.requeue_after = self.requeue.next_delay(&signals);
        if result.requeue_after.is_some() {
            counter!("reconcile_requeue_total", 1u64);
        }
        histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            requeued = result.requeued.len(),
            failed = result.failures.len(),
            requeue_ms = ?result.requeue_after.map(|d| d.as_millis()),
            took_ms = %t0.elapsed().as_millis(),
            "reconcile pass done"
        );
        Ok(result)
    }

    /// Once every enabled component that has been installed is Ready, the target version
    /// becomes the installed platform version. Components still held by the version gate
    /// (Disabled) do not block this.
    fn record_platform_version(&self, desired: &mut DesiredState, effective: &EffectiveState) {
        let Some(target) = effective.target_version() else { return };
        if desired.installed_version() == Some(target) {
            return;
        }
        let settled = self.registry.iter().filter(|c| c.is_enabled(effective)).all(|c| {
            matches!(desired.component_status(c.name()).map(|s| s.state), Some(State::Ready) | Some(State::Disabled) | None)
        });
        if settled {
            info!(from = ?desired.installed_version(), to = %target, "platform version recorded");
            desired.status.version = Some(target.to_string());
        }
    }
}
