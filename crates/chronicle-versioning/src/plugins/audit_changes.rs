//! Records which entity types each audit touched.

use std::collections::HashSet;

use chronicle_core::AuditId;
use rusqlite::Connection;
use tracing::debug;

use crate::errors::Result;
use crate::plugins::VersioningPlugin;
use crate::schema::{AuxiliaryTable, EntityDef, Schema, VersionTable, quote_ident};
use crate::sqlite::repositories::ChangesRepo;
use crate::unit_of_work::UnitOfWork;

/// `(audit, entity)` pairs already written in the current transaction.
#[derive(Debug, Default)]
struct EnsuredPairs(HashSet<(AuditId, String)>);

/// Writes one `(audit_id, entity_name)` row per entity type changed by a
/// transaction.
#[derive(Clone, Debug)]
pub struct AuditChangesPlugin {
    table: String,
}

impl AuditChangesPlugin {
    /// Plugin name, also the owner of its auxiliary table.
    pub const NAME: &'static str = "audit_changes";

    /// Use the default `audit_changes` table.
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

    /// Table the plugin writes to.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn register(&self, schema: &mut Schema) {
        let name = quote_ident(&self.table);
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} (\n  \
               {audit_id},\n  \
               \"entity_name\" VARCHAR(255) NOT NULL,\n  \
               PRIMARY KEY (\"audit_id\", \"entity_name\")\n\
             );\n\
             CREATE INDEX IF NOT EXISTS {index} ON {name} (\"entity_name\");",
            audit_id = schema.audit_table().foreign_key("audit_id", false, "CASCADE"),
            index = quote_ident(&format!("ix_{}_entity_name", self.table)),
        );
        let _ = schema.register_auxiliary(AuxiliaryTable {
            name: self.table.clone(),
            owner: Self::NAME.to_string(),
            create_sql,
        });
    }
}

impl Default for AuditChangesPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VersioningPlugin for AuditChangesPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn after_build_audit_table(&self, schema: &mut Schema) -> Result<()> {
        self.register(schema);
        Ok(())
    }

    fn after_build_models(&self, schema: &mut Schema) -> Result<()> {
        self.register(schema);
        Ok(())
    }

    fn after_version_table_built(
        &self,
        _entity: &EntityDef,
        version_table: &mut VersionTable,
    ) -> Result<()> {
        version_table.set_metadata(Self::NAME, self.table.clone());
        Ok(())
    }

    fn before_create_version_objects(&self, uow: &mut UnitOfWork, conn: &Connection) -> Result<()> {
        let audit_id = uow.current_audit_id()?;
        let entities = uow.entities();
        let ensured = uow.plugin_state::<EnsuredPairs>()?;
        for entity in entities {
            let pair = (audit_id, entity);
            if ensured.0.contains(&pair) {
                continue;
            }
            let inserted = ChangesRepo::ensure(conn, &self.table, audit_id, &pair.1)?;
            debug!(audit_id = %audit_id, entity = %pair.1, inserted, "audit change recorded");
            let _ = ensured.0.insert(pair);
        }
        Ok(())
    }

    fn after_commit(&self, uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        let _ = uow.clear_plugin_state::<EnsuredPairs>();
        Ok(())
    }

    fn after_rollback(&self, uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        let _ = uow.clear_plugin_state::<EnsuredPairs>();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::plugins::PluginCollection;
    use crate::schema::SchemaBuilder;
    use crate::sqlite::repositories::AuditRepo;
    use chronicle_core::{EntityKey, KeyPart};
    use chronicle_settings::VersioningSettings;
    use rusqlite::types::Value;
    use std::sync::Arc;

    fn schema_with(plugin: AuditChangesPlugin) -> Schema {
        let mut plugins = PluginCollection::new();
        plugins.add(Arc::new(plugin));
        SchemaBuilder::new(VersioningSettings::default())
            .entity(EntityDef::new("Article", "article").key("id", "INTEGER"))
            .build(&plugins)
            .unwrap()
            .0
    }

    fn setup() -> (Connection, UnitOfWork) {
        let schema = schema_with(AuditChangesPlugin::new());
        let conn = Connection::open_in_memory().unwrap();
        for object in schema.objects() {
            conn.execute_batch(&object.sql).unwrap();
        }
        let audit = AuditRepo::create(&conn, "audit", None).unwrap();
        let mut uow = UnitOfWork::new();
        uow.set_current_audit(Some(audit));
        (conn, uow)
    }

    fn touch(uow: &mut UnitOfWork, entity: &str, id: i64) {
        let key = EntityKey::new(vec![KeyPart::Integer(id)]);
        uow.record(entity, &key, None, Some(vec![Value::Integer(id)]));
        uow.build_version_objects();
    }

    #[test]
    fn registers_table_once_across_both_hooks() {
        let schema = schema_with(AuditChangesPlugin::new());
        assert_eq!(schema.auxiliary_tables().len(), 1);
        let table = schema.auxiliary_for(AuditChangesPlugin::NAME).unwrap();
        assert!(table.create_sql.contains("ON DELETE CASCADE"));
        assert!(table.create_sql.contains("PRIMARY KEY (\"audit_id\", \"entity_name\")"));
    }

    #[test]
    fn version_tables_carry_metadata() {
        let schema = schema_with(AuditChangesPlugin::with_table("touched"));
        let vt = schema.version_table("Article").unwrap();
        assert_eq!(vt.metadata().get("audit_changes").map(String::as_str), Some("touched"));
    }

    #[test]
    fn one_row_per_entity_type() {
        let (conn, mut uow) = setup();
        touch(&mut uow, "Article", 1);
        touch(&mut uow, "Article", 2);
        touch(&mut uow, "Tag", 1);

        let plugin = AuditChangesPlugin::new();
        plugin.before_create_version_objects(&mut uow, &conn).unwrap();
        plugin.before_create_version_objects(&mut uow, &conn).unwrap();

        let rows = ChangesRepo::list(&conn, "audit_changes").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_name, "Article");
        assert_eq!(rows[1].entity_name, "Tag");
    }

    #[test]
    fn cache_cleared_after_finalize() {
        let (conn, mut uow) = setup();
        touch(&mut uow, "Article", 1);
        let plugin = AuditChangesPlugin::new();
        plugin.before_create_version_objects(&mut uow, &conn).unwrap();
        assert!(uow.clear_plugin_state::<EnsuredPairs>());

        plugin.before_create_version_objects(&mut uow, &conn).unwrap();
        plugin.after_commit(&mut uow, &conn).unwrap();
        assert!(!uow.clear_plugin_state::<EnsuredPairs>());
    }

    #[test]
    fn requires_current_audit() {
        let conn = Connection::open_in_memory().unwrap();
        let mut uow = UnitOfWork::new();
        touch(&mut uow, "Article", 1);
        assert!(AuditChangesPlugin::new()
            .before_create_version_objects(&mut uow, &conn)
            .is_err());
    }
}
