use keel_config::{effective_state, MemoryProfiles};
use keel_core::{DesiredState, Error, OverrideSource, State};
use keel_merge::MergeOptions;
use serde_json::json;

fn cr(v: serde_json::Value) -> DesiredState { serde_json::from_value(v).unwrap() }

fn profiles() -> MemoryProfiles {
    MemoryProfiles::new()
        .with("base", json!({
            "spec": { "components": {
                "dns": { "enabled": true, "overrides": [{ "values": { "layer": "base" } }] },
                "ingress": { "enabled": false }
            } }
        }))
        .with("prod", json!({
            "metadata": { "name": "from-profile" },
            "spec": { "components": {
                "ingress": { "enabled": true },
                "monitoring": { "enabled": true }
            } }
        }))
        .with("dev", json!({
            "spec": { "components": { "monitoring": { "enabled": false } } }
        }))
}

#[test]
fn base_then_named_profile_then_user() {
    let desired = cr(json!({
        "metadata": { "name": "main", "namespace": "keel" },
        "spec": { "components": { "ingress": { "enabled": false } } }
    }));
    let eff = effective_state(&desired, &profiles(), &MergeOptions::default()).unwrap();
    assert_eq!(eff.resource().metadata.name, "main");
    assert!(eff.is_component_enabled("dns", false));
    assert!(!eff.is_component_enabled("ingress", true));
    assert!(eff.is_component_enabled("monitoring", false));
}

#[test]
fn named_profile_replaces_default() {
    let desired = cr(json!({ "spec": { "profile": "dev" } }));
    let eff = effective_state(&desired, &profiles(), &MergeOptions::default()).unwrap();
    assert!(!eff.is_component_enabled("monitoring", true));
    // prod was not applied, so base's ingress setting stands
    assert!(!eff.is_component_enabled("ingress", true));
}

#[test]
fn status_is_stripped_and_input_untouched() {
    let mut desired = cr(json!({ "metadata": { "name": "main" } }));
    desired.status.version = Some("1.1.0".into());
    desired.component_status_mut("dns").state = State::Ready;
    let before = desired.clone();
    let eff = effective_state(&desired, &profiles(), &MergeOptions::default()).unwrap();
    assert!(eff.resource().status.is_empty());
    assert_eq!(desired, before);
}

#[test]
fn user_overrides_follow_profile_overrides() {
    let desired = cr(json!({
        "spec": { "components": { "dns": { "overrides": [{ "values": { "layer": "user" } }] } } }
    }));
    let eff = effective_state(&desired, &profiles(), &MergeOptions::default()).unwrap();
    let layers: Vec<_> = eff
        .overrides("dns")
        .iter()
        .map(|o| match o {
            OverrideSource::Values(v) => v["layer"].as_str().unwrap().to_string(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(layers, vec!["base", "user"]);
}

#[test]
fn missing_profile_is_configuration_error() {
    let desired = cr(json!({ "spec": { "profile": "edge" } }));
    let err = effective_state(&desired, &profiles(), &MergeOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }), "{err}");
    assert!(err.to_string().contains("edge"));
}

#[test]
fn missing_base_profile_is_fine() {
    let only_prod = MemoryProfiles::new().with("prod", json!({ "spec": { "components": { "dns": { "enabled": true } } } }));
    let eff = effective_state(&DesiredState::default(), &only_prod, &MergeOptions::default()).unwrap();
    assert!(eff.is_component_enabled("dns", false));
}

#[test]
fn type_conflict_is_configuration_error() {
    let clash = MemoryProfiles::new().with("prod", json!({ "spec": { "components": { "dns": { "zones": ["a"] } } } }));
    let desired = cr(json!({ "spec": { "components": { "dns": { "zones": { "a": true } } } } }));
    let err = effective_state(&desired, &clash, &MergeOptions::default()).unwrap_err();
    match err {
        Error::Configuration { message, .. } => assert!(message.contains(".spec.components.dns.zones"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
}
