//! Configuration manifest for the Meridian control plane.
//!
//! The manifest is a YAML (or JSON — a YAML subset) document with named
//! sections: `identity`, `model` / `fallbackChain`, `executionLimits`,
//! `pairing`, and `gateway`. Loading validates value ranges; the
//! [`watcher`] module hot-reloads the file with debouncing and retains the
//! last good configuration across bad reloads.
//!
//! Environment variables carry only credentials and bootstrap endpoints;
//! everything else lives here.

pub mod error;
pub mod types;
pub mod validate;
pub mod watcher;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    DetectedAction, GatewaySection, IdentityConfig, IdentityProfile, LaneCapacities,
    LimitsSection, LoopDetectionSection, Manifest, ModelEntry, PairingSection,
};
pub use watcher::{ConfigWatcher, WatchEvent};
