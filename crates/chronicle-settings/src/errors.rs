//! Settings error types.

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON.
    #[error("malformed settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but breaks a constraint, such as an empty table name.
    #[error("invalid setting: {0}")]
    InvalidValue(String),
}

/// Shorthand for settings results.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
