//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a partial JSON file only has to name the values it changes.

mod database;
mod versioning;

pub use database::*;
pub use versioning::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for a chronicle store.
///
/// Loaded from `~/.chronicle/settings.json` with defaults applied for
/// missing fields. Environment variables can override specific values.
///
/// # JSON Format
///
/// ```json
/// {
///   "versioning": { "strategy": "subquery", "auditTable": "transaction" },
///   "database": { "path": "/var/lib/app/history.db" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChronicleSettings {
    /// Table naming and validity strategy.
    pub versioning: VersioningSettings,
    /// Connection pool and pragma settings.
    pub database: DatabaseSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl ChronicleSettings {
    /// Check that every configured identifier is usable as a `SQLite` name
    /// and that numeric limits are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let v = &self.versioning;
        for (field, value) in [
            ("versioning.auditTable", v.audit_table.as_str()),
            ("versioning.versionTableSuffix", v.version_table_suffix.as_str()),
            ("versioning.auditIdColumn", v.audit_id_column.as_str()),
            ("versioning.endAuditIdColumn", v.end_audit_id_column.as_str()),
            ("versioning.operationTypeColumn", v.operation_type_column.as_str()),
            ("versioning.changesTable", v.changes_table.as_str()),
            ("versioning.metaTable", v.meta_table.as_str()),
        ] {
            if !is_identifier(value) {
                return Err(SettingsError::InvalidValue(format!(
                    "{field} is not a valid identifier: {value:?}"
                )));
            }
        }
        if self.database.pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "database.poolSize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// ASCII letters, digits and underscores, not starting with a digit.
fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per event instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
