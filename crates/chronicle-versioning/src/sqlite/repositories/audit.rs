//! Audit repository: one row per captured transaction.

use chronicle_core::AuditId;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;
use crate::schema::quote_ident;
use crate::sqlite::row_types::AuditRow;

/// Audit repository. Stateless, every method takes `&Connection`.
pub struct AuditRepo;

impl AuditRepo {
    /// Insert a new audit stamped with the current time. The id comes from
    /// the table's `AUTOINCREMENT` sequence.
    pub fn create(conn: &Connection, table: &str, user_id: Option<&Value>) -> Result<AuditRow> {
        let issued_at = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            &format!(
                "INSERT INTO {} (issued_at, user_id) VALUES (?1, ?2)",
                quote_ident(table)
            ),
            params![issued_at, user_id],
        )?;
        Ok(AuditRow {
            id: AuditId::new(conn.last_insert_rowid()),
            issued_at,
            user_id: user_id.cloned(),
        })
    }

    /// Get an audit by id.
    pub fn get(conn: &Connection, table: &str, id: AuditId) -> Result<Option<AuditRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, issued_at, user_id FROM {} WHERE id = ?1",
                    quote_ident(table)
                ),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All audits, oldest first.
    pub fn list(conn: &Connection, table: &str) -> Result<Vec<AuditRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, issued_at, user_id FROM {} ORDER BY id",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recent `limit` audits, newest first.
    pub fn latest(conn: &Connection, table: &str, limit: u32) -> Result<Vec<AuditRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, issued_at, user_id FROM {} ORDER BY id DESC LIMIT ?1",
            quote_ident(table)
        ))?;
        let rows = stmt
            .query_map(params![limit], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Set the user of an existing audit. Returns whether the audit exists.
    pub fn set_user(
        conn: &Connection,
        table: &str,
        id: AuditId,
        user_id: Option<&Value>,
    ) -> Result<bool> {
        let changed = conn.execute(
            &format!("UPDATE {} SET user_id = ?1 WHERE id = ?2", quote_ident(table)),
            params![user_id, id],
        )?;
        Ok(changed > 0)
    }

    /// Delete an audit. Dependent rows cascade. Returns whether it existed.
    pub fn delete(conn: &Connection, table: &str, id: AuditId) -> Result<bool> {
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)),
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Number of audits.
    pub fn count(conn: &Connection, table: &str) -> Result<i64> {
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
        let user_id: Value = row.get(2)?;
        Ok(AuditRow {
            id: row.get(0)?,
            issued_at: row.get(1)?,
            user_id: match user_id {
                Value::Null => None,
                other => Some(other),
            },
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
