//! Keel config: where component configuration comes from.
//!
//! * [`ProfileStore`] loads named baseline documents.
//! * [`effective_state`] layers profiles and the user resource into an [`EffectiveState`].
//! * [`OverrideResolver`] turns ranked override sources into payloads.
//! * [`EngineSettings`] carries the env-driven knobs.

#![forbid(unsafe_code)]

mod effective;
mod overrides;
mod profiles;
mod settings;

pub use effective::{effective_state, effective_state_with_default, profile_names};
pub use overrides::OverrideResolver;
pub use profiles::{DirProfiles, MemoryProfiles, ProfileStore};
pub use settings::EngineSettings;

pub use keel_core::EffectiveState;
