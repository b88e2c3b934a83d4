mod common;

use std::sync::Arc;

use common::{profiles, registry, resource, Fake};
use keel_config::effective_state;
use keel_core::{EffectiveState, Error};
use keel_engine::{dependencies_satisfied, ComponentContext, Registry};
use keel_kubehub::MemoryStore;
use keel_merge::MergeOptions;

fn effective(names: &[&str]) -> EffectiveState {
    effective_state(&resource(names, &[], None), &profiles(), &MergeOptions::default()).unwrap()
}

async fn satisfied(reg: &Registry, name: &str, eff: &EffectiveState) -> Result<bool, Error> {
    let store = MemoryStore::new();
    let ctx = ComponentContext::new(eff, &store);
    dependencies_satisfied(reg.find(name).unwrap().as_ref(), reg, &ctx).await
}

#[tokio::test]
async fn no_dependencies_is_trivially_satisfied() {
    let reg = registry(&[Arc::new(Fake::new("solo").unready())]);
    assert!(satisfied(&reg, "solo", &effective(&[])).await.unwrap());
}

#[tokio::test]
async fn linear_chain() {
    let c = Arc::new(Fake::new("c"));
    let reg = registry(&[
        Arc::new(Fake::new("a").depends_on(&["b"])),
        Arc::new(Fake::new("b").depends_on(&["c"])),
        c.clone(),
    ]);
    let eff = effective(&["a", "b", "c"]);
    assert!(satisfied(&reg, "a", &eff).await.unwrap());

    // readiness is checked through the whole chain
    c.set_ready(false);
    assert!(!satisfied(&reg, "b", &eff).await.unwrap());
    assert!(!satisfied(&reg, "a", &eff).await.unwrap());
}

#[tokio::test]
async fn diamond_chain() {
    let d = Arc::new(Fake::new("d"));
    let reg = registry(&[
        Arc::new(Fake::new("a").depends_on(&["b", "c"])),
        Arc::new(Fake::new("b").depends_on(&["d"])),
        Arc::new(Fake::new("c").depends_on(&["d"])),
        d.clone(),
    ]);
    let eff = effective(&["a", "b", "c", "d"]);
    assert!(satisfied(&reg, "a", &eff).await.unwrap());
    d.set_ready(false);
    assert!(!satisfied(&reg, "a", &eff).await.unwrap());
}

#[tokio::test]
async fn disabled_dependency_is_not_satisfied() {
    let reg = registry(&[Arc::new(Fake::new("app").depends_on(&["db"])), Arc::new(Fake::new("db"))]);
    assert!(!satisfied(&reg, "app", &effective(&["app"])).await.unwrap());
}

#[tokio::test]
async fn cycle_detected_from_every_entry_point() {
    let reg = registry(&[
        Arc::new(Fake::new("a").depends_on(&["b"])),
        Arc::new(Fake::new("b").depends_on(&["c"])),
        Arc::new(Fake::new("c").depends_on(&["a"])),
        Arc::new(Fake::new("top").depends_on(&["b"])),
    ]);
    let eff = effective(&["a", "b", "c", "top"]);
    for entry in ["a", "b", "c", "top"] {
        let err = satisfied(&reg, entry, &eff).await.unwrap_err();
        match err {
            Error::DependencyCycle { dependency, .. } => {
                assert!(["a", "b", "c"].contains(&dependency.as_str()), "{entry}: {dependency}");
            }
            other => panic!("{entry}: unexpected {other:?}"),
        }
    }
    assert!(matches!(reg.ordered().unwrap_err(), Error::DependencyCycle { .. }));
}

#[tokio::test]
async fn self_dependency_is_a_cycle() {
    let reg = registry(&[Arc::new(Fake::new("loop").depends_on(&["loop"]))]);
    let err = satisfied(&reg, "loop", &effective(&["loop"])).await.unwrap_err();
    assert!(matches!(err, Error::DependencyCycle { ref component, ref dependency } if component == "loop" && dependency == "loop"));
}

#[tokio::test]
async fn unregistered_dependency_is_illegal_state() {
    let reg = registry(&[Arc::new(Fake::new("app").depends_on(&["ghost"]))]);
    let err = satisfied(&reg, "app", &effective(&["app"])).await.unwrap_err();
    assert!(matches!(err, Error::MissingDependency { ref dependency, .. } if dependency == "ghost"));
    assert!(err.to_string().starts_with("illegal state"));
    assert!(matches!(reg.ordered().unwrap_err(), Error::MissingDependency { .. }));
}

#[test]
fn registry_orders_dependencies_first_and_rejects_duplicates() {
    let mut reg = registry(&[
        Arc::new(Fake::new("app").depends_on(&["db", "cache"])),
        Arc::new(Fake::new("cache").depends_on(&["db"])),
        Arc::new(Fake::new("db")),
        Arc::new(Fake::new("extra")),
    ]);
    let order: Vec<String> = reg.ordered().unwrap().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(order, vec!["db", "cache", "app", "extra"]);

    let err = reg.register(Arc::new(Fake::new("db"))).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(reg.len(), 4);
    assert!(reg.find("cache").is_some());
    assert!(reg.find("nope").is_none());
}
