//! # fleet-settings
//!
//! Configuration for the fleet hub, loaded from three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`FleetSettings::default()`]
//! 2. **Settings file**: `$FLEET_CONFIG` or `~/.fleet/settings.json`,
//!    deep-merged over defaults
//! 3. **Environment variables**: `FLEET_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and passed down explicitly.
//!
//! ```no_run
//! let settings = fleet_settings::load_settings().unwrap_or_default();
//! println!("device port: {}", settings.device.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{
    DeviceSettings, FleetSettings, LoggingSettings, ObserverSettings, MAX_INTERVAL_SECS,
};
