//! # chronicle-settings
//!
//! Configuration for chronicle versioning stores.
//!
//! Later layers win:
//!
//! 1. [`ChronicleSettings::default()`]
//! 2. `~/.chronicle/settings.json`, merged key by key over the defaults
//! 3. `CHRONICLE_*` environment variables
//!
//! # Usage
//!
//! ```no_run
//! use chronicle_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("audit table: {}", settings.versioning.audit_table);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<ChronicleSettings> = OnceLock::new();

/// Process-wide settings, loaded on first use.
///
/// A missing or unreadable settings file falls back to the defaults.
pub fn get_settings() -> &'static ChronicleSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Install `settings` as the process-wide value before anything reads it.
///
/// # Errors
///
/// Hands `settings` back when the value was already set or read.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: ChronicleSettings) -> std::result::Result<(), ChronicleSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
