//! Free-form key/value tags on audits.
//!
//! [`AuditMetaPlugin`] only owns the `audit_meta` table; reads and writes go
//! through a [`MetaMap`] bound to one audit, which behaves like a map whose
//! every operation is a statement against the open connection.

use std::collections::BTreeMap;

use chronicle_core::AuditId;
use rusqlite::Connection;

use crate::errors::Result;
use crate::plugins::VersioningPlugin;
use crate::schema::{AuxiliaryTable, Schema, quote_ident};
use crate::sqlite::repositories::MetaRepo;

/// Registers the meta table.
#[derive(Clone, Debug)]
pub struct AuditMetaPlugin {
    table: String,
}

impl AuditMetaPlugin {
    /// Plugin name, also the owner of its auxiliary table.
    pub const NAME: &'static str = "audit_meta";

    /// Use the default `audit_meta` table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(Self::NAME)
    }

    /// Use a custom table name.
    #[must_use]
    pub fn with_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Table the plugin owns.
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Default for AuditMetaPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VersioningPlugin for AuditMetaPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn after_build_audit_table(&self, schema: &mut Schema) -> Result<()> {
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} (\n  \
               {audit_id},\n  \
               \"key\" VARCHAR(255) NOT NULL,\n  \
               \"value\" TEXT NOT NULL,\n  \
               PRIMARY KEY (\"audit_id\", \"key\")\n\
             );",
            name = quote_ident(&self.table),
            audit_id = schema.audit_table().foreign_key("audit_id", false, "CASCADE"),
        );
        let _ = schema.register_auxiliary(AuxiliaryTable {
            name: self.table.clone(),
            owner: Self::NAME.to_string(),
            create_sql,
        });
        Ok(())
    }
}

/// Map view over the tags of one audit.
#[derive(Clone, Copy, Debug)]
pub struct MetaMap<'c> {
    conn: &'c Connection,
    table: &'c str,
    audit_id: AuditId,
}

impl<'c> MetaMap<'c> {
    /// Bind to `audit_id` in `table`.
    pub fn new(conn: &'c Connection, table: &'c str, audit_id: AuditId) -> Self {
        Self {
            conn,
            table,
            audit_id,
        }
    }

    /// Audit the map is bound to.
    pub fn audit_id(&self) -> AuditId {
        self.audit_id
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        MetaRepo::get(self.conn, self.table, self.audit_id, key)
    }

    /// Create or overwrite `key`. Returns the previous value.
    pub fn insert(&self, key: &str, value: &str) -> Result<Option<String>> {
        let previous = self.get(key)?;
        MetaRepo::upsert(self.conn, self.table, self.audit_id, key, value)?;
        Ok(previous)
    }

    /// Delete `key`. Returns the removed value.
    pub fn remove(&self, key: &str) -> Result<Option<String>> {
        let previous = self.get(key)?;
        if previous.is_some() {
            let _ = MetaRepo::delete(self.conn, self.table, self.audit_id, key)?;
        }
        Ok(previous)
    }

    /// Whether `key` is set.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.to_map()?.into_keys().collect())
    }

    /// Number of keys.
    pub fn len(&self) -> Result<usize> {
        Ok(MetaRepo::list(self.conn, self.table, self.audit_id)?.len())
    }

    /// Whether no keys are set.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// `(key, value)` pairs in key order.
    pub fn iter(&self) -> Result<std::collections::btree_map::IntoIter<String, String>> {
        Ok(self.to_map()?.into_iter())
    }

    /// Snapshot of every assigned key.
    pub fn to_map(&self) -> Result<BTreeMap<String, String>> {
        Ok(MetaRepo::list(self.conn, self.table, self.audit_id)?
            .into_iter()
            .map(|row| (row.key, row.value))
            .collect())
    }

    /// Replace the whole map: keys absent from `map` are deleted, the rest
    /// are created or overwritten.
    pub fn assign<K, V>(&self, map: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let wanted: BTreeMap<String, String> = map
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        for existing in self.keys()? {
            if !wanted.contains_key(&existing) {
                let _ = MetaRepo::delete(self.conn, self.table, self.audit_id, &existing)?;
            }
        }
        for (key, value) in &wanted {
            MetaRepo::upsert(self.conn, self.table, self.audit_id, key, value)?;
        }
        Ok(())
    }

    /// Delete every key. Returns the number removed.
    pub fn clear(&self) -> Result<usize> {
        MetaRepo::delete_all(self.conn, self.table, self.audit_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
