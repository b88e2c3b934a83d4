use std::sync::Arc;

use keel_core::{Error, Result};
use rustc_hash::FxHashMap;

use crate::Component;

/// Named collection of components. Built once at start-up and passed down explicitly;
/// read-only during reconciliation.
#[derive(Default, Clone)]
pub struct Registry {
    components: Vec<Arc<dyn Component>>,
    index: FxHashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Duplicate names are a configuration error.
    pub fn register(&mut self, component: Arc<dyn Component>) -> Result<()> {
        let name = component.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::configuration("registry", format!("component {} registered twice", name)));
        }
        self.index.insert(name, self.components.len());
        self.components.push(component);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Component>> { self.index.get(name).map(|&i| &self.components[i]) }

    pub fn len(&self) -> usize { self.components.len() }
    pub fn is_empty(&self) -> bool { self.components.is_empty() }

    /// Registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Component>> { self.components.iter() }

    /// Dependencies before dependents, ties broken by registration order.
    pub fn ordered(&self) -> Result<Vec<Arc<dyn Component>>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark { New, Active, Done }

        fn visit(reg: &Registry, i: usize, marks: &mut [Mark], out: &mut Vec<Arc<dyn Component>>) -> Result<()> {
            marks[i] = Mark::Active;
            let c = &reg.components[i];
            for dep in c.dependencies() {
                let Some(&j) = reg.index.get(dep.as_str()) else {
                    return Err(Error::MissingDependency { component: c.name().to_string(), dependency: dep.clone() });
                };
                match marks[j] {
                    Mark::Done => {}
                    Mark::Active => {
                        return Err(Error::DependencyCycle { component: c.name().to_string(), dependency: dep.clone() });
                    }
                    Mark::New => visit(reg, j, marks, out)?,
                }
            }
            marks[i] = Mark::Done;
            out.push(c.clone());
            Ok(())
        }

        let mut marks = vec![Mark::New; self.components.len()];
        let mut out = Vec::with_capacity(self.components.len());
        for i in 0..self.components.len() {
            if marks[i] == Mark::New {
                visit(self, i, &mut marks, &mut out)?;
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.components.iter().map(|c| c.name())).finish()
    }
}

impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
