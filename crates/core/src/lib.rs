//! Keel core types: the desired-state resource, per-component status and the error taxonomy.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

mod error;
pub mod version;

pub use error::{Error, Operation, Result, RetryableError};

pub const API_VERSION: &str = "platform.keel.dev/v1alpha1";
pub const KIND: &str = "Platform";
/// Profile used when the resource does not name one.
pub const DEFAULT_PROFILE: &str = "prod";
/// Profile layered underneath every named profile when present.
pub const BASE_PROFILE: &str = "base";

fn default_api_version() -> String { API_VERSION.to_string() }
fn default_kind() -> String { KIND.to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub generation: i64,
}

/// The user-authored top-level resource. The engine only ever writes `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PlatformSpec,
    #[serde(default, skip_serializing_if = "PlatformStatus::is_empty")]
    pub status: PlatformStatus,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::default(),
            spec: PlatformSpec::default(),
            status: PlatformStatus::default(),
        }
    }
}

impl DesiredState {
    pub fn profile(&self) -> &str { self.spec.profile.as_deref().filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PROFILE) }

    /// Platform version recorded as installed, if any.
    pub fn installed_version(&self) -> Option<&str> { self.status.version.as_deref().filter(|v| !v.is_empty()) }

    pub fn component_status(&self, name: &str) -> Option<&ComponentStatusDetails> { self.status.components.get(name) }

    /// Status entry for `name`, created lazily in `Disabled`.
    pub fn component_status_mut(&mut self, name: &str) -> &mut ComponentStatusDetails {
        self.status
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentStatusDetails::new(name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Target platform version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentSpec>,
    /// Platform-wide settings the engine does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Json>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_args: Vec<InstallArg>,
    /// Ranked override sources; later entries win.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverrideSource>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Json>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallArg {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub set_string: bool,
}

/// One ranked source of component configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum OverrideSource {
    /// Inline document.
    Values(Json),
    ConfigMapRef(ValueRef),
    SecretRef(ValueRef),
    /// Values recorded the last time the component was applied. Engine-internal.
    #[serde(skip)]
    LastApplied { component: String },
}

/// Reference to one key of an external object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueRef {
    pub name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

impl ValueRef {
    pub fn is_optional(&self) -> bool { self.optional.unwrap_or(false) }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    /// Platform version currently installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentStatusDetails>,
}

impl PlatformStatus {
    pub fn is_empty(&self) -> bool { self.version.is_none() && self.components.is_empty() }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Disabled,
    PreInstalling,
    Installing,
    Upgrading,
    Ready,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { std::fmt::Debug::fmt(self, f) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionType {
    PreInstall,
    InstallStarted,
    InstallComplete,
    InstallFailed,
    UpgradeStarted,
    UpgradeComplete,
    UpgradeFailed,
}

impl ConditionType {
    pub fn is_upgrade(self) -> bool {
        matches!(self, ConditionType::UpgradeStarted | ConditionType::UpgradeComplete | ConditionType::UpgradeFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: String,
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn now(kind: ConditionType, message: Option<String>) -> Self {
        Self {
            r#type: kind,
            status: "True".to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            message,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatusDetails {
    pub name: String,
    #[serde(default)]
    pub state: State,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Platform version the component was last installed or upgraded at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ComponentStatusDetails {
    pub fn new(name: &str) -> Self { Self { name: name.to_string(), ..Default::default() } }

    pub fn has_condition(&self, kind: ConditionType) -> bool { self.conditions.iter().any(|c| c.r#type == kind) }

    /// Append a condition unless one of the same type is already recorded.
    /// Returns true when a condition was added.
    pub fn append_condition(&mut self, kind: ConditionType, message: Option<String>) -> bool {
        if self.has_condition(kind) { return false; }
        self.conditions.push(Condition::now(kind, message));
        true
    }

    /// Drop recorded conditions matching `pred` (used when a new upgrade cycle starts).
    pub fn clear_conditions(&mut self, pred: impl Fn(ConditionType) -> bool) {
        self.conditions.retain(|c| !pred(c.r#type));
    }

    pub fn condition_types(&self) -> SmallVec<[ConditionType; 4]> { self.conditions.iter().map(|c| c.r#type).collect() }
}

/// The merged view of profile defaults and the user spec.
///
/// Built only through [`EffectiveState::from_merged`], which discards status, so the
/// value can never carry or leak status back into the user resource.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveState(DesiredState);

impl EffectiveState {
    pub fn from_merged(mut cr: DesiredState) -> Self {
        cr.status = PlatformStatus::default();
        Self(cr)
    }

    pub fn resource(&self) -> &DesiredState { &self.0 }
    pub fn spec(&self) -> &PlatformSpec { &self.0.spec }
    pub fn profile(&self) -> &str { self.0.profile() }
    pub fn target_version(&self) -> Option<&str> { self.0.spec.version.as_deref().filter(|v| !v.is_empty()) }
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> { self.0.spec.components.get(name) }

    /// Enablement as declared in the merged spec, falling back to `default`.
    pub fn is_component_enabled(&self, name: &str, default: bool) -> bool {
        self.component(name).and_then(|c| c.enabled).unwrap_or(default)
    }

    pub fn overrides(&self, name: &str) -> &[OverrideSource] {
        self.component(name).map(|c| c.overrides.as_slice()).unwrap_or(&[])
    }
}

pub mod prelude {
    pub use super::{
        ComponentSpec, ComponentStatusDetails, Condition, ConditionType, DesiredState, EffectiveState, Error,
        OverrideSource, Operation, PlatformSpec, PlatformStatus, Result, RetryableError, State, ValueRef,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_condition_dedups_by_type() {
        let mut st = ComponentStatusDetails::new("istio");
        assert!(st.append_condition(ConditionType::PreInstall, None));
        assert!(st.append_condition(ConditionType::InstallStarted, None));
        assert!(!st.append_condition(ConditionType::PreInstall, Some("again".into())));
        assert_eq!(st.condition_types().as_slice(), &[ConditionType::PreInstall, ConditionType::InstallStarted]);
    }

    #[test]
    fn desired_state_parses_override_sources() {
        let cr: DesiredState = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "platform", "namespace": "default" },
            "spec": {
                "components": {
                    "ingress": {
                        "enabled": true,
                        "overrides": [
                            { "values": { "replicas": 2 } },
                            { "configMapRef": { "name": "ingress-cm", "key": "values.yaml", "optional": true } },
                            { "secretRef": { "name": "ingress-secret", "key": "values.yaml" } }
                        ]
                    }
                }
            }
        }))
        .unwrap();
        assert_eq!(cr.kind, KIND);
        assert_eq!(cr.profile(), DEFAULT_PROFILE);
        let ov = &cr.spec.components["ingress"].overrides;
        assert_eq!(ov.len(), 3);
        assert!(matches!(&ov[1], OverrideSource::ConfigMapRef(r) if r.is_optional()));
        assert!(matches!(&ov[2], OverrideSource::SecretRef(r) if !r.is_optional()));
    }

    #[test]
    fn effective_state_never_carries_status() {
        let mut cr = DesiredState::default();
        cr.status.version = Some("1.0.0".into());
        cr.component_status_mut("dns").state = State::Ready;
        let eff = EffectiveState::from_merged(cr);
        assert!(eff.resource().status.is_empty());
    }

    #[test]
    fn empty_fields_are_not_serialized() {
        let cr = DesiredState::default();
        let v = serde_json::to_value(&cr).unwrap();
        assert!(v.get("status").is_none());
        assert_eq!(v["spec"], serde_json::json!({}));
    }
}
