//! Meta repository: free-form key/value tags on audits.

use chronicle_core::AuditId;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;
use crate::schema::quote_ident;
use crate::sqlite::row_types::AuditMetaRow;

/// Meta repository. Stateless, every method takes `&Connection`.
pub struct MetaRepo;

impl MetaRepo {
    /// Value of `key` on `audit_id`.
    pub fn get(conn: &Connection, table: &str, audit_id: AuditId, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row(
                &format!(
                    "SELECT value FROM {} WHERE audit_id = ?1 AND key = ?2",
                    quote_ident(table)
                ),
                params![audit_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Create or overwrite `key`.
    pub fn upsert(
        conn: &Connection,
        table: &str,
        audit_id: AuditId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let _ = conn.execute(
            &format!(
                "INSERT INTO {} (audit_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (audit_id, key) DO UPDATE SET value = excluded.value",
                quote_ident(table)
            ),
            params![audit_id, key, value],
        )?;
        Ok(())
    }

    /// Delete `key`. Returns whether it existed.
    pub fn delete(conn: &Connection, table: &str, audit_id: AuditId, key: &str) -> Result<bool> {
        let changed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE audit_id = ?1 AND key = ?2",
                quote_ident(table)
            ),
            params![audit_id, key],
        )?;
        Ok(changed > 0)
    }

    /// Delete every key of an audit. Returns the number removed.
    pub fn delete_all(conn: &Connection, table: &str, audit_id: AuditId) -> Result<usize> {
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE audit_id = ?1", quote_ident(table)),
            params![audit_id],
        )?;
        Ok(changed)
    }

    /// All tags of an audit, sorted by key.
    pub fn list(conn: &Connection, table: &str, audit_id: AuditId) -> Result<Vec<AuditMetaRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT audit_id, key, value FROM {} WHERE audit_id = ?1 ORDER BY key",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map(params![audit_id], |row| {
                Ok(AuditMetaRow {
                    audit_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Audits tagged with `key = value`, oldest first.
    pub fn audits_tagged(conn: &Connection, table: &str, key: &str, value: &str) -> Result<Vec<AuditId>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT audit_id FROM {} WHERE key = ?1 AND value = ?2 ORDER BY audit_id",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map(params![key, value], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
