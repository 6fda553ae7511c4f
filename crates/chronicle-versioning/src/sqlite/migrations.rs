//! Schema application for the audit trail.
//!
//! The [`Schema`] is applied object by object (audit table, plugin tables,
//! version tables) inside a single transaction. Each object is recorded in
//! the `schema_version` table so re-running is idempotent and a schema that
//! gains a new entity only creates the new version table.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::errors::{Result, VersioningError};
use crate::schema::Schema;

/// Name of the bookkeeping table.
pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

/// One recorded schema object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedObject {
    /// Object (table) name.
    pub name: String,
    /// When it was created.
    pub applied_at: String,
    /// Description recorded at creation.
    pub description: Option<String>,
}

/// Create every schema object not yet recorded. Returns how many were
/// created.
///
/// # Errors
///
/// Returns [`VersioningError::Schema`] if any DDL fails; nothing is applied
/// in that case.
pub fn apply_schema(conn: &Connection, schema: &Schema) -> Result<usize> {
    ensure_version_table(conn)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| VersioningError::Schema(format!("failed to begin schema transaction: {e}")))?;

    let mut applied = 0;
    for object in schema.objects() {
        let recorded: Option<String> = tx
            .query_row(
                "SELECT name FROM schema_version WHERE name = ?1",
                params![object.name],
                |row| row.get(0),
            )
            .optional()?;
        if recorded.is_some() {
            debug!(object = %object.name, "schema object already applied, skipping");
            continue;
        }

        info!(object = %object.name, description = %object.description, "applying schema object");
        tx.execute_batch(&object.sql).map_err(|e| {
            VersioningError::Schema(format!("creating {} failed: {e}", object.name))
        })?;
        let _ = tx.execute(
            "INSERT INTO schema_version (name, applied_at, description) VALUES (?1, datetime('now'), ?2)",
            params![object.name, object.description],
        )?;
        applied += 1;
    }

    tx.commit()
        .map_err(|e| VersioningError::Schema(format!("failed to commit schema: {e}")))?;

    if applied > 0 {
        info!(applied, "schema applied");
    }
    Ok(applied)
}

/// List recorded schema objects in application order.
pub fn applied_objects(conn: &Connection) -> Result<Vec<AppliedObject>> {
    ensure_version_table(conn)?;
    let mut stmt = conn.prepare(
        "SELECT name, applied_at, description FROM schema_version ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AppliedObject {
                name: row.get(0)?,
                applied_at: row.get(1)?,
                description: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           name        TEXT PRIMARY KEY,
           applied_at  TEXT NOT NULL,
           description TEXT
         );",
    )
    .map_err(|e| VersioningError::Schema(format!("failed to create schema_version table: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::plugins::{AuditChangesPlugin, AuditMetaPlugin, PluginCollection};
    use crate::schema::{EntityDef, SchemaBuilder};
    use chronicle_settings::VersioningSettings;
    use std::sync::Arc;

    fn open_memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn schema(entities: &[&str]) -> Schema {
        let mut plugins = PluginCollection::new();
        plugins.add(Arc::new(AuditChangesPlugin::new()));
        plugins.add(Arc::new(AuditMetaPlugin::new()));
        let mut builder = SchemaBuilder::new(VersioningSettings::default());
        for name in entities {
            builder = builder.entity(
                EntityDef::new(*name, name.to_lowercase())
                    .key("id", "INTEGER")
                    .column("name", "TEXT"),
            );
        }
        builder.build(&plugins).unwrap().0
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect()
    }

    #[test]
    fn apply_creates_all_tables() {
        let conn = open_memory();
        let applied = apply_schema(&conn, &schema(&["Article"])).unwrap();
        assert_eq!(applied, 4);

        let tables = table_names(&conn);
        for expected in [
            "article_version",
            "audit",
            "audit_changes",
            "audit_meta",
            "schema_version",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn apply_is_idempotent() {
        let conn = open_memory();
        let s = schema(&["Article"]);
        apply_schema(&conn, &s).unwrap();
        assert_eq!(apply_schema(&conn, &s).unwrap(), 0);
        assert_eq!(applied_objects(&conn).unwrap().len(), 4);
    }

    #[test]
    fn new_entity_only_adds_its_table() {
        let conn = open_memory();
        apply_schema(&conn, &schema(&["Article"])).unwrap();
        let applied = apply_schema(&conn, &schema(&["Article", "Tag"])).unwrap();
        assert_eq!(applied, 1);
        assert!(table_names(&conn).iter().any(|t| t == "tag_version"));
    }

    #[test]
    fn objects_recorded_in_order() {
        let conn = open_memory();
        apply_schema(&conn, &schema(&["Article"])).unwrap();
        let names: Vec<String> = applied_objects(&conn)
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(
            names,
            vec!["audit", "audit_changes", "audit_meta", "article_version"]
        );
    }
}
