//! # nbe-settings
//!
//! Configuration for the NBE master, loaded from three layers (in priority
//! order):
//! 1. **Compiled defaults** ([`NbeSettings::default()`])
//! 2. **User file** `~/.nbe/settings.json`, deep-merged over defaults
//! 3. **Environment variables**, `NBE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, nbe_home, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<NbeSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads `~/.nbe/settings.json` with env var overrides and
/// caches the result. If loading fails, compiled defaults are used.
pub fn get_settings() -> &'static NbeSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// Returns the value back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: NbeSettings) -> std::result::Result<(), NbeSettings> {
    SETTINGS.set(settings)
}
