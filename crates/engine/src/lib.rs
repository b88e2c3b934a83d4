//! Keel engine: sequences and retries arbitrary components toward the desired state.
//!
//! A pass computes the effective state, visits registered components in dependency order,
//! drives each one step through its lifecycle with [`reconcile_one`], and writes the status
//! block back through the object store. Work that is not finished surfaces as a requeue delay
//! rather than an error.

#![forbid(unsafe_code)]

mod component;
mod deps;
mod monitor;
mod reconcile;
mod registry;
mod requeue;
mod status;

pub use component::{install_args_values, Component, ComponentContext};
pub use deps::{dependencies_satisfied, trace_dependencies, ReadinessCache};
pub use monitor::Monitor;
pub use reconcile::{reconcile_one, ComponentFailure, Outcome, PassResult, Reconciler};
pub use registry::Registry;
pub use requeue::RequeuePolicy;
pub use status::persist_status;
