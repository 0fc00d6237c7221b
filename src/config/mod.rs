//! Session and bypass configuration
//!
//! Provides:
//! - Defaults matching the engine's wire behavior
//! - JSON loading with millisecond durations
//! - Validation before a session is built

#[allow(clippy::module_inception)]
pub mod config;

pub use config::{BypassConfig, ConfigError, SessionConfig};
