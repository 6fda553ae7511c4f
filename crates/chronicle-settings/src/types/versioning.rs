//! Versioning strategy and table naming.

use serde::{Deserialize, Serialize};

/// How validity intervals of version rows are maintained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersioningStrategy {
    /// Version tables carry an `end_audit_id` column that is closed at
    /// write time.
    #[default]
    Validity,
    /// Append-only version tables; the current row is found with a
    /// max-`audit_id` subquery at read time.
    Subquery,
}

impl VersioningStrategy {
    /// Parse a strategy name (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "validity" => Some(Self::Validity),
            "subquery" => Some(Self::Subquery),
            _ => None,
        }
    }

    /// Whether version tables carry an end marker.
    pub fn tracks_validity(self) -> bool {
        matches!(self, Self::Validity)
    }
}

/// Table and column naming for the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersioningSettings {
    /// Validity strategy.
    pub strategy: VersioningStrategy,
    /// Name of the audit table.
    pub audit_table: String,
    /// Suffix appended to an entity table's name to form its version table.
    pub version_table_suffix: String,
    /// Column on version rows referencing the creating audit.
    pub audit_id_column: String,
    /// Column on version rows referencing the superseding audit.
    pub end_audit_id_column: String,
    /// Column on version rows holding the operation code.
    pub operation_type_column: String,
    /// Table used by the changes tracker.
    pub changes_table: String,
    /// Table used by the meta store.
    pub meta_table: String,
}

impl Default for VersioningSettings {
    fn default() -> Self {
        Self {
            strategy: VersioningStrategy::Validity,
            audit_table: "audit".to_string(),
            version_table_suffix: "_version".to_string(),
            audit_id_column: "audit_id".to_string(),
            end_audit_id_column: "end_audit_id".to_string(),
            operation_type_column: "operation_type".to_string(),
            changes_table: "audit_changes".to_string(),
            meta_table: "audit_meta".to_string(),
        }
    }
}
