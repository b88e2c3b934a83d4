//! Error taxonomy shared by every keel crate.
//!
//! `Retryable` is a signal, not a failure: it means "call again later with the same
//! inputs". Every other variant is terminal for the current pass.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lifecycle step or engine activity an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PreInstall,
    Install,
    PostInstall,
    PreUpgrade,
    Upgrade,
    PostUpgrade,
    Reconcile,
    Dependencies,
    Overrides,
    Monitor,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::PreInstall => "pre-install",
            Operation::Install => "install",
            Operation::PostInstall => "post-install",
            Operation::PreUpgrade => "pre-upgrade",
            Operation::Upgrade => "upgrade",
            Operation::PostUpgrade => "post-upgrade",
            Operation::Reconcile => "reconcile",
            Operation::Dependencies => "dependencies",
            Operation::Overrides => "overrides",
            Operation::Monitor => "monitor",
        };
        f.write_str(s)
    }
}

/// "Not done yet" signal carrying where it came from and an optional re-check delay.
#[derive(Debug)]
pub struct RetryableError {
    pub component: String,
    pub operation: Option<Operation>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub delay: Option<Duration>,
}

impl RetryableError {
    pub fn new(component: impl Into<String>) -> Self {
        Self { component: component.into(), operation: None, cause: None, delay: None }
    }

    pub fn with_operation(mut self, op: Operation) -> Self { self.operation = Some(op); self }

    pub fn with_cause(mut self, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self { self.delay = Some(delay); self }
}

impl fmt::Display for RetryableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry component {}", self.component)?;
        if let Some(op) = self.operation { write!(f, " during {}", op)?; }
        if let Some(d) = self.delay { write!(f, " after {}ms", d.as_millis())?; }
        if let Some(c) = &self.cause { write!(f, ": {}", c)?; }
        Ok(())
    }
}

impl std::error::Error for RetryableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_deref().map(|k| format!(" (key {})", k)).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Retryable(#[from] RetryableError),

    /// A dependency name reappeared on the active traversal stack.
    #[error("illegal state: dependency cycle detected at {dependency} (reached from {component})")]
    DependencyCycle { component: String, dependency: String },

    #[error("illegal state: component {component} declares dependency {dependency} which is not registered")]
    MissingDependency { component: String, dependency: String },

    /// Bad profile, bad version string, undecodable document.
    #[error("configuration error [{context}]: {message}")]
    Configuration { context: String, message: String },

    /// Overlay and base disagree on the structural type of a field.
    #[error("merge conflict at {path}: cannot merge {overlay} into {base}")]
    MergeConflict { path: String, base: &'static str, overlay: &'static str },

    #[error("not found: {kind} {name}{}", key_suffix(.key))]
    NotFound { kind: String, name: String, key: Option<String> },

    /// Transient write conflict reported by the object store.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{operation} failed for component {component}: {source}")]
    Hook {
        component: String,
        operation: Operation,
        #[source]
        source: anyhow::Error,
    },

    #[error("background operation already running for component {component}")]
    MonitorBusy { component: String },

    #[error("no background operation running for component {component}")]
    MonitorNotRunning { component: String },

    #[error("object store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("persist error: {0}")]
    Persist(#[source] anyhow::Error),
}

impl Error {
    /// Shorthand for a bare retry signal from `component`.
    pub fn retry(component: impl Into<String>) -> Self { Error::Retryable(RetryableError::new(component)) }

    pub fn configuration(context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration { context: context.into(), message: message.into() }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>, key: Option<&str>) -> Self {
        Error::NotFound { kind: kind.into(), name: name.into(), key: key.map(|k| k.to_string()) }
    }

    /// Attribute a failure to a hook. Retry signals and already-typed keel errors pass
    /// through untouched so a hook can `?` engine primitives freely.
    pub fn hook(component: &str, operation: Operation, err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(e) => e,
            Err(err) => match err.downcast::<RetryableError>() {
                Ok(r) => Error::Retryable(r),
                Err(source) => Error::Hook { component: component.to_string(), operation, source },
            },
        }
    }

    pub fn is_retryable(&self) -> bool { matches!(self, Error::Retryable(_)) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }

    pub fn as_retryable(&self) -> Option<&RetryableError> {
        match self { Error::Retryable(r) => Some(r), _ => None }
    }

    /// Delay suggested by a retry signal, if any.
    pub fn retry_delay(&self) -> Option<Duration> { self.as_retryable().and_then(|r| r.delay) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_display_names_component_and_operation() {
        let r = RetryableError::new("istio").with_operation(Operation::Install).with_delay(Duration::from_secs(2));
        assert_eq!(r.to_string(), "retry component istio during install after 2000ms");
        let e: Error = r.into();
        assert!(e.is_retryable());
        assert_eq!(e.retry_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn hook_passes_through_typed_errors() {
        let e = Error::hook("dns", Operation::Install, anyhow::Error::new(Error::retry("dns")));
        assert!(e.is_retryable());
        let e = Error::hook("dns", Operation::Install, anyhow::anyhow!("boom"));
        match e {
            Error::Hook { component, operation, .. } => {
                assert_eq!(component, "dns");
                assert_eq!(operation, Operation::Install);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn not_found_mentions_key() {
        let e = Error::not_found("ConfigMap", "ns/values", Some("overrides.yaml"));
        assert_eq!(e.to_string(), "not found: ConfigMap ns/values (key overrides.yaml)");
    }
}
