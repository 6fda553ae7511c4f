//! Layered settings loading.
//!
//! The defaults are serialized to JSON, the user file is merged over them
//! with [`deep_merge`], the result is deserialized, `CHRONICLE_*` variables
//! are applied on top and the whole is validated.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ChronicleSettings, VersioningStrategy};

/// `~/.chronicle/settings.json`, with `/tmp` standing in for an unset `HOME`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".chronicle").join("settings.json")
}

/// [`load_settings_from_path`] on [`settings_path`].
///
/// # Errors
///
/// As [`load_settings_from_path`].
pub fn load_settings() -> Result<ChronicleSettings> {
    load_settings_from_path(&settings_path())
}

/// Defaults, merged with the file at `path` when it exists, then with the
/// environment.
///
/// # Errors
///
/// The file is unreadable or not JSON, a field has the wrong shape, or the
/// merged settings fail [`ChronicleSettings::validate`].
pub fn load_settings_from_path(path: &Path) -> Result<ChronicleSettings> {
    let mut layered = serde_json::to_value(ChronicleSettings::default())?;
    if path.is_file() {
        debug!(path = %path.display(), "merging settings file");
        let user: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        layered = deep_merge(layered, user);
    } else {
        debug!(path = %path.display(), "no settings file");
    }

    let mut settings: ChronicleSettings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Merge `overlay` into `base`.
///
/// Objects merge key by key. Any other overlay value replaces the base
/// value outright, except `null`, which leaves it untouched.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Overlay the `CHRONICLE_*` variables onto `settings`.
///
/// A variable that does not parse, or falls outside its range, is skipped
/// with a warning.
pub fn apply_env_overrides(settings: &mut ChronicleSettings) {
    if let Some(strategy) = env_value("CHRONICLE_STRATEGY", VersioningStrategy::parse) {
        settings.versioning.strategy = strategy;
    }
    if let Some(path) = env_value("CHRONICLE_DB_PATH", non_empty) {
        settings.database.path = Some(path);
    }
    if let Some(size) = env_value("CHRONICLE_POOL_SIZE", |raw| parse_bounded(raw, 1_u32, 256)) {
        settings.database.pool_size = size;
    }
    if let Some(ms) = env_value("CHRONICLE_BUSY_TIMEOUT_MS", |raw| parse_bounded(raw, 0_u64, 600_000)) {
        settings.database.busy_timeout_ms = ms;
    }
    if let Some(level) = env_value("CHRONICLE_LOG_LEVEL", non_empty) {
        settings.logging.level = level;
    }
    if let Some(json) = env_value("CHRONICLE_LOG_JSON", parse_flag) {
        settings.logging.json = json;
    }
}

/// Parse `raw` and keep it only inside `min..=max`.
pub fn parse_bounded<T: FromStr + PartialOrd>(raw: &str, min: T, max: T) -> Option<T> {
    raw.trim().parse().ok().filter(|n| (min..=max).contains(n))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_owned())
}

fn env_value<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() && !raw.is_empty() {
        warn!(key = name, value = %raw, "ignoring unusable environment override");
    }
    parsed
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
