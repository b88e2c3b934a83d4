use std::path::PathBuf;
use std::time::Duration;

use keel_core::DEFAULT_PROFILE;
use keel_merge::MergeOptions;

/// Engine knobs read from `KEEL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub profile_dir: PathBuf,
    pub default_profile: String,
    pub requeue_min: Duration,
    pub requeue_max: Duration,
    /// `None` means the persist crate's default location.
    pub db_path: Option<String>,
    pub merge_keys: Vec<String>,
    pub disable_last_applied: bool,
    pub metrics_addr: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from("./profiles"),
            default_profile: DEFAULT_PROFILE.to_string(),
            requeue_min: Duration::from_secs(3),
            requeue_max: Duration::from_secs(5),
            db_path: None,
            merge_keys: vec!["name".to_string()],
            disable_last_applied: false,
            metrics_addr: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> { std::env::var(key).ok().filter(|s| !s.trim().is_empty()) }

fn env_secs(key: &str) -> Option<u64> { env_string(key).and_then(|s| s.trim().parse::<u64>().ok()) }

fn env_flag(key: &str) -> bool {
    env_string(key).map(|s| matches!(s.trim(), "1" | "true" | "yes" | "on")).unwrap_or(false)
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let requeue_min = env_secs("KEEL_REQUEUE_MIN_SECS").map(Duration::from_secs).unwrap_or(d.requeue_min);
        // max never below min
        let requeue_max = env_secs("KEEL_REQUEUE_MAX_SECS").map(Duration::from_secs).unwrap_or(d.requeue_max).max(requeue_min);
        let merge_keys = env_string("KEEL_MERGE_KEYS")
            .map(|s| s.split(',').map(str::trim).filter(|k| !k.is_empty()).map(str::to_string).collect::<Vec<_>>())
            .filter(|v| !v.is_empty())
            .unwrap_or(d.merge_keys);
        Self {
            profile_dir: env_string("KEEL_PROFILE_DIR").map(PathBuf::from).unwrap_or(d.profile_dir),
            default_profile: env_string("KEEL_DEFAULT_PROFILE").unwrap_or(d.default_profile),
            requeue_min,
            requeue_max,
            db_path: env_string("KEEL_DB_PATH"),
            merge_keys,
            disable_last_applied: env_flag("KEEL_DISABLE_LASTAPPLIED"),
            metrics_addr: env_string("KEEL_METRICS_ADDR"),
        }
    }

    pub fn merge_options(&self) -> MergeOptions { MergeOptions::with_keys(self.merge_keys.iter().cloned()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = EngineSettings::default();
        assert_eq!(s.requeue_min, Duration::from_secs(3));
        assert_eq!(s.requeue_max, Duration::from_secs(5));
        assert_eq!(s.default_profile, "prod");
        assert_eq!(s.merge_options(), MergeOptions::default());
    }
}
