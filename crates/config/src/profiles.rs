use std::path::{Path, PathBuf};

use keel_core::{Error, Result};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

/// Source of named baseline documents. A profile is resource-shaped (`spec: {...}`).
pub trait ProfileStore: Send + Sync {
    /// `Error::NotFound` when no profile of that name exists.
    fn load_profile(&self, name: &str) -> Result<Json>;
}

/// Profiles stored as `<dir>/<name>.yaml`.
#[derive(Debug, Clone)]
pub struct DirProfiles {
    dir: PathBuf,
}

impl DirProfiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn dir(&self) -> &Path { &self.dir }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ProfileStore for DirProfiles {
    fn load_profile(&self, name: &str) -> Result<Json> {
        if !valid_name(name) {
            return Err(Error::configuration("profile", format!("invalid profile name {:?}", name)));
        }
        let path = self.dir.join(format!("{}.yaml", name));
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("profile", name, None));
            }
            Err(e) => {
                return Err(Error::configuration("profile", format!("reading {}: {}", path.display(), e)));
            }
        };
        debug!(profile = %name, path = %path.display(), bytes = bytes.len(), "profile loaded");
        keel_merge::parse_document(&bytes).map_err(|e| Error::configuration("profile", format!("{}: {}", name, e)))
    }
}

/// In-memory profiles for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfiles {
    profiles: FxHashMap<String, Json>,
}

impl MemoryProfiles {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: &str, doc: Json) -> Self {
        self.profiles.insert(name.to_string(), doc);
        self
    }
}

impl ProfileStore for MemoryProfiles {
    fn load_profile(&self, name: &str) -> Result<Json> {
        self.profiles.get(name).cloned().ok_or_else(|| Error::not_found("profile", name, None))
    }
}
