//! Changes repository: which entity types each audit touched.
//!
//! Rows are keyed by `(audit_id, entity_name)`; there is at most one row per
//! pair no matter how many entities of the type changed.

use chronicle_core::AuditId;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::errors::Result;
use crate::schema::quote_ident;
use crate::sqlite::row_types::AuditChangesRow;

/// Changes repository. Stateless, every method takes `&Connection`.
pub struct ChangesRepo;

impl ChangesRepo {
    /// Record that `audit_id` touched `entity` unless already recorded.
    /// Returns whether a row was inserted.
    pub fn ensure(conn: &Connection, table: &str, audit_id: AuditId, entity: &str) -> Result<bool> {
        let existing: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE audit_id = ?1 AND entity_name = ?2",
                    quote_ident(table)
                ),
                params![audit_id, entity],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }
        let _ = conn.execute(
            &format!(
                "INSERT INTO {} (audit_id, entity_name) VALUES (?1, ?2)",
                quote_ident(table)
            ),
            params![audit_id, entity],
        )?;
        Ok(true)
    }

    /// Entity type names touched by one audit, sorted.
    pub fn for_audit(conn: &Connection, table: &str, audit_id: AuditId) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT entity_name FROM {} WHERE audit_id = ?1 ORDER BY entity_name",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map(params![audit_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Audits that touched `entity`, oldest first.
    pub fn audits_touching(conn: &Connection, table: &str, entity: &str) -> Result<Vec<AuditId>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT audit_id FROM {} WHERE entity_name = ?1 ORDER BY audit_id",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map(params![entity], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Audits that touched none of `entities`, oldest first.
    pub fn audits_not_touching(
        conn: &Connection,
        audit_table: &str,
        table: &str,
        entities: &[&str],
    ) -> Result<Vec<AuditId>> {
        let sql = if entities.is_empty() {
            format!("SELECT id FROM {} ORDER BY id", quote_ident(audit_table))
        } else {
            let placeholders: Vec<String> = (1..=entities.len()).map(|i| format!("?{i}")).collect();
            format!(
                "SELECT a.id FROM {audit} a
                 WHERE NOT EXISTS (
                   SELECT 1 FROM {changes} c
                   WHERE c.audit_id = a.id AND c.entity_name IN ({list})
                 )
                 ORDER BY a.id",
                audit = quote_ident(audit_table),
                changes = quote_ident(table),
                list = placeholders.join(", ")
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(entities.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every row, ordered by audit then entity name.
    pub fn list(conn: &Connection, table: &str) -> Result<Vec<AuditChangesRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT audit_id, entity_name FROM {} ORDER BY audit_id, entity_name",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AuditChangesRow {
                    audit_id: row.get(0)?,
                    entity_name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
