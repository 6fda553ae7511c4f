//! Database row types for the audit trail tables.

use std::collections::BTreeMap;
use std::fmt;

use chronicle_core::{AuditId, EntityKey, Operation};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

/// Row from the audit table.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditRow {
    /// Store-assigned id.
    pub id: AuditId,
    /// RFC 3339 creation timestamp.
    pub issued_at: String,
    /// User reference, typed like the user table's key.
    pub user_id: Option<Value>,
}

impl fmt::Display for AuditRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Audit id={}, issued_at='{}'>", self.id, self.issued_at)
    }
}

/// Row from the changes table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditChangesRow {
    /// Audit id.
    pub audit_id: AuditId,
    /// Entity type name.
    pub entity_name: String,
}

/// Row from the meta table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMetaRow {
    /// Audit id.
    pub audit_id: AuditId,
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Row from a version table.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionRow {
    /// Entity key.
    pub key: EntityKey,
    /// Tracked column values by column name, key columns included.
    pub values: BTreeMap<String, Value>,
    /// Audit that created this row.
    pub audit_id: AuditId,
    /// Audit that superseded it. Always `None` under the subquery strategy.
    pub end_audit_id: Option<AuditId>,
    /// Operation marker.
    pub operation: Operation,
}

impl VersionRow {
    /// Value of a tracked column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Whether no later row has closed this one.
    pub fn is_open(&self) -> bool {
        self.end_audit_id.is_none()
    }

    /// Whether this row was current at `audit`: `audit_id <= audit < end`.
    pub fn covers(&self, audit: AuditId) -> bool {
        self.audit_id <= audit && self.end_audit_id.is_none_or(|end| audit < end)
    }
}
