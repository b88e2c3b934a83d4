//! Semantic-version helpers used by the version gate and the upgrade path.

use semver::Version;

use crate::{Error, Result};

/// Parse `1.2.3` or `v1.2.3`. Malformed strings are a configuration error.
pub fn parse_version(s: &str) -> Result<Version> {
    let trimmed = s.trim();
    let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(raw).map_err(|e| Error::configuration("version", format!("invalid version {:?}: {}", s, e)))
}

/// True when `actual >= required`.
pub fn version_at_least(actual: &str, required: &str) -> Result<bool> {
    Ok(parse_version(actual)? >= parse_version(required)?)
}

/// True when `current < target`.
pub fn is_older(current: &str, target: &str) -> Result<bool> {
    Ok(parse_version(current)? < parse_version(target)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_compares_semver_not_strings() {
        assert!(!version_at_least("1.1.0", "1.2.0").unwrap());
        assert!(version_at_least("1.2.0", "1.2.0").unwrap());
        assert!(version_at_least("v1.10.0", "1.2.0").unwrap());
        assert!(is_older("1.9.9", "1.10.0").unwrap());
    }

    #[test]
    fn malformed_version_is_configuration_error() {
        let e = parse_version("one.two").unwrap_err();
        assert!(matches!(e, Error::Configuration { .. }), "{e}");
    }
}
