//! Schema definitions for the audit trail.
//!
//! The [`SchemaBuilder`] turns entity declarations into a [`Schema`]: the
//! shared audit table, one version table per tracked entity, and any
//! auxiliary tables plugins register against the audit table. Auxiliary
//! tables reference the audit table through [`AuditTable::foreign_key`], so
//! they always carry the audit primary key's column type.
//!
//! Nothing here touches a database except [`UserTable::from_connection`];
//! DDL is applied by [`crate::sqlite::migrations::apply_schema`].

use std::collections::BTreeMap;

use chronicle_settings::{VersioningSettings, VersioningStrategy};
use rusqlite::Connection;
use tracing::debug;

use crate::errors::{Result, VersioningError};
use crate::plugins::PluginCollection;

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A column name and its declared SQL type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type, copied verbatim into DDL.
    pub sql_type: String,
}

impl ColumnDef {
    /// Create a column definition.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// A tracked entity type and its primary table.
///
/// ```ignore
/// let article = EntityDef::new("Article", "article")
///     .key("id", "INTEGER")
///     .column("name", "TEXT")
///     .column("content", "TEXT");
/// ```
#[derive(Clone, Debug)]
pub struct EntityDef {
    name: String,
    table: String,
    key_columns: Vec<ColumnDef>,
    columns: Vec<ColumnDef>,
}

impl EntityDef {
    /// Declare an entity type backed by `table`.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            key_columns: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Add a primary-key column.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.key_columns.push(ColumnDef::new(name, sql_type));
        self
    }

    /// Add a tracked non-key column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.columns.push(ColumnDef::new(name, sql_type));
        self
    }

    /// Entity type name, as recorded in the changes table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Primary-key columns in declaration order.
    pub fn key_columns(&self) -> &[ColumnDef] {
        &self.key_columns
    }

    /// Tracked non-key columns.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    fn validate(&self, settings: &VersioningSettings) -> Result<()> {
        if self.key_columns.is_empty() {
            return Err(VersioningError::Schema(format!(
                "entity '{}' declares no key columns",
                self.name
            )));
        }
        let reserved = [
            settings.audit_id_column.as_str(),
            settings.end_audit_id_column.as_str(),
            settings.operation_type_column.as_str(),
        ];
        let mut seen = Vec::with_capacity(self.key_columns.len() + self.columns.len());
        for col in self.key_columns.iter().chain(&self.columns) {
            if reserved.contains(&col.name.as_str()) {
                return Err(VersioningError::Schema(format!(
                    "entity '{}' column '{}' collides with a version column",
                    self.name, col.name
                )));
            }
            if seen.contains(&col.name.as_str()) {
                return Err(VersioningError::Schema(format!(
                    "entity '{}' declares column '{}' twice",
                    self.name, col.name
                )));
            }
            seen.push(col.name.as_str());
        }
        Ok(())
    }
}

/// The table audits record their user against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserTable {
    /// User table name.
    pub table: String,
    /// Primary-key column name.
    pub column: String,
    /// Primary-key column type, copied onto `audit.user_id`.
    pub sql_type: String,
}

impl UserTable {
    /// Describe a user table explicitly.
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        sql_type: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            sql_type: sql_type.into(),
        }
    }

    /// Read the primary-key column of an existing table.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Schema`] if the table is missing or its key
    /// is not exactly one column.
    pub fn from_connection(conn: &Connection, table: &str) -> Result<Self> {
        let columns = table_info(conn, table)?;
        if columns.is_empty() {
            return Err(VersioningError::Schema(format!("table '{table}' not found")));
        }
        let mut pk: Vec<_> = columns.into_iter().filter(|c| c.pk > 0).collect();
        if pk.len() != 1 {
            return Err(VersioningError::Schema(format!(
                "user table '{table}' must have a single-column primary key, found {}",
                pk.len()
            )));
        }
        let col = pk.remove(0);
        Ok(Self::new(table, col.name, col.sql_type))
    }
}

/// One row of `PRAGMA table_info`.
#[derive(Clone, Debug)]
pub(crate) struct TableColumn {
    pub name: String,
    pub sql_type: String,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk: i64,
}

pub(crate) fn table_info(conn: &Connection, table: &str) -> Result<Vec<TableColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TableColumn {
                name: row.get(1)?,
                sql_type: row.get(2)?,
                pk: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The shared audit table.
#[derive(Clone, Debug)]
pub struct AuditTable {
    name: String,
    user: Option<UserTable>,
}

impl AuditTable {
    /// Primary-key column name.
    pub const ID_COLUMN: &'static str = "id";
    /// Primary-key column type. `AUTOINCREMENT` requires `INTEGER`.
    pub const ID_SQL_TYPE: &'static str = "INTEGER";

    fn new(name: &str, user: Option<UserTable>) -> Self {
        Self {
            name: name.to_string(),
            user,
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured user table, if any.
    pub fn user(&self) -> Option<&UserTable> {
        self.user.as_ref()
    }

    /// Column definition for `column` referencing this table's id.
    ///
    /// ```ignore
    /// schema.audit_table().foreign_key("audit_id", false, "CASCADE")
    /// // "audit_id" INTEGER NOT NULL REFERENCES "audit"("id") ON DELETE CASCADE
    /// ```
    pub fn foreign_key(&self, column: &str, nullable: bool, on_delete: &str) -> String {
        format!(
            "{} {}{} REFERENCES {}({}) ON DELETE {on_delete}",
            quote_ident(column),
            Self::ID_SQL_TYPE,
            if nullable { "" } else { " NOT NULL" },
            quote_ident(&self.name),
            quote_ident(Self::ID_COLUMN),
        )
    }

    fn create_sql(&self) -> String {
        let user_column = match &self.user {
            Some(user) => format!(
                "\"user_id\" {} REFERENCES {}({})",
                user.sql_type,
                quote_ident(&user.table),
                quote_ident(&user.column)
            ),
            None => "\"user_id\"".to_string(),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n  \
               {id} {ty} PRIMARY KEY AUTOINCREMENT,\n  \
               \"issued_at\" TEXT NOT NULL,\n  \
               {user_column}\n\
             );",
            table = quote_ident(&self.name),
            id = quote_ident(Self::ID_COLUMN),
            ty = Self::ID_SQL_TYPE,
        )
    }
}

/// The version table of one tracked entity type.
#[derive(Clone, Debug)]
pub struct VersionTable {
    name: String,
    entity: String,
    key_columns: Vec<ColumnDef>,
    columns: Vec<ColumnDef>,
    audit_id_column: String,
    end_audit_id_column: Option<String>,
    operation_type_column: String,
    metadata: BTreeMap<String, String>,
}

impl VersionTable {
    fn for_entity(entity: &EntityDef, settings: &VersioningSettings) -> Self {
        Self {
            name: format!("{}{}", entity.table, settings.version_table_suffix),
            entity: entity.name.clone(),
            key_columns: entity.key_columns.clone(),
            columns: entity.columns.clone(),
            audit_id_column: settings.audit_id_column.clone(),
            end_audit_id_column: match settings.strategy {
                VersioningStrategy::Validity => Some(settings.end_audit_id_column.clone()),
                VersioningStrategy::Subquery => None,
            },
            operation_type_column: settings.operation_type_column.clone(),
            metadata: BTreeMap::new(),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity type this table versions.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Entity key columns.
    pub fn key_columns(&self) -> &[ColumnDef] {
        &self.key_columns
    }

    /// Tracked non-key columns.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Creating-audit column.
    pub fn audit_id_column(&self) -> &str {
        &self.audit_id_column
    }

    /// Superseding-audit column; `None` under the subquery strategy.
    pub fn end_audit_id_column(&self) -> Option<&str> {
        self.end_audit_id_column.as_deref()
    }

    /// Operation code column.
    pub fn operation_type_column(&self) -> &str {
        &self.operation_type_column
    }

    /// Plugin-attached metadata.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Attach a metadata entry, replacing any previous value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.metadata.insert(key.into(), value.into());
    }

    fn create_sql(&self, audit: &AuditTable) -> String {
        let mut lines: Vec<String> = self
            .key_columns
            .iter()
            .map(|c| format!("{} {} NOT NULL", quote_ident(&c.name), c.sql_type))
            .collect();
        lines.extend(
            self.columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type)),
        );
        lines.push(audit.foreign_key(&self.audit_id_column, false, "CASCADE"));
        if let Some(end) = &self.end_audit_id_column {
            lines.push(audit.foreign_key(end, true, "SET NULL"));
        }
        lines.push(format!(
            "{} SMALLINT NOT NULL",
            quote_ident(&self.operation_type_column)
        ));
        let pk: Vec<String> = self
            .key_columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .chain(std::iter::once(quote_ident(&self.audit_id_column)))
            .collect();
        lines.push(format!("PRIMARY KEY ({})", pk.join(", ")));

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n);",
            quote_ident(&self.name),
            lines.join(",\n  ")
        );
        if let Some(trigger) = self.relink_trigger_sql() {
            sql.push('\n');
            sql.push_str(&trigger);
        }
        let indexed = std::iter::once(&self.audit_id_column)
            .chain(self.end_audit_id_column.as_ref())
            .chain(std::iter::once(&self.operation_type_column));
        for column in indexed {
            sql.push_str(&format!(
                "\nCREATE INDEX IF NOT EXISTS {} ON {} ({});",
                quote_ident(&format!("ix_{}_{column}", self.name)),
                quote_ident(&self.name),
                quote_ident(column)
            ));
        }
        sql
    }

    /// When a row disappears, its predecessor inherits the row's end marker so
    /// the chain stays contiguous. Deleting an audit cascades here.
    fn relink_trigger_sql(&self) -> Option<String> {
        let end = quote_ident(self.end_audit_id_column.as_ref()?);
        let table = quote_ident(&self.name);
        let aid = quote_ident(&self.audit_id_column);
        let same_key = self
            .key_columns
            .iter()
            .map(|c| format!("{0} = OLD.{0}", quote_ident(&c.name)))
            .collect::<Vec<_>>()
            .join(" AND ");
        Some(format!(
            "CREATE TRIGGER IF NOT EXISTS {trigger} AFTER DELETE ON {table}
BEGIN
  UPDATE {table} SET {end} = OLD.{end}
   WHERE {same_key}
     AND {aid} = (SELECT MAX({aid}) FROM {table} WHERE {same_key} AND {aid} < OLD.{aid});
END;",
            trigger = quote_ident(&format!("tr_{}_relink", self.name)),
        ))
    }
}

/// A plugin-owned table referencing the audit table.
#[derive(Clone, Debug)]
pub struct AuxiliaryTable {
    /// Table name.
    pub name: String,
    /// Name of the plugin that registered it.
    pub owner: String,
    /// Idempotent DDL (`CREATE TABLE IF NOT EXISTS ...`).
    pub create_sql: String,
}

/// A named unit of DDL, applied and recorded once.
#[derive(Clone, Debug)]
pub struct SchemaObject {
    /// Object name recorded in `schema_version`.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// DDL batch.
    pub sql: String,
}

/// The complete audit-trail schema.
#[derive(Clone, Debug)]
pub struct Schema {
    settings: VersioningSettings,
    audit: AuditTable,
    version_tables: Vec<VersionTable>,
    auxiliary: Vec<AuxiliaryTable>,
}

impl Schema {
    /// Naming and strategy settings the schema was built with.
    pub fn settings(&self) -> &VersioningSettings {
        &self.settings
    }

    /// Validity strategy.
    pub fn strategy(&self) -> VersioningStrategy {
        self.settings.strategy
    }

    /// The shared audit table.
    pub fn audit_table(&self) -> &AuditTable {
        &self.audit
    }

    /// Register an auxiliary table. A table with the same name is replaced,
    /// so plugins may register from more than one build hook.
    ///
    /// Returns `true` if the name was new.
    pub fn register_auxiliary(&mut self, table: AuxiliaryTable) -> bool {
        if let Some(existing) = self.auxiliary.iter_mut().find(|t| t.name == table.name) {
            *existing = table;
            false
        } else {
            debug!(table = %table.name, plugin = %table.owner, "registered auxiliary table");
            self.auxiliary.push(table);
            true
        }
    }

    /// All auxiliary tables in registration order.
    pub fn auxiliary_tables(&self) -> &[AuxiliaryTable] {
        &self.auxiliary
    }

    /// The auxiliary table registered by `owner`.
    pub fn auxiliary_for(&self, owner: &str) -> Option<&AuxiliaryTable> {
        self.auxiliary.iter().find(|t| t.owner == owner)
    }

    /// Version table for an entity type name.
    pub fn version_table(&self, entity: &str) -> Option<&VersionTable> {
        self.version_tables.iter().find(|t| t.entity == entity)
    }

    /// Version table by its table name.
    pub fn version_table_named(&self, table: &str) -> Option<&VersionTable> {
        self.version_tables.iter().find(|t| t.name == table)
    }

    /// All version tables in entity declaration order.
    pub fn version_tables(&self) -> &[VersionTable] {
        &self.version_tables
    }

    /// DDL units in dependency order: audit table, auxiliary tables, version
    /// tables.
    pub fn objects(&self) -> Vec<SchemaObject> {
        let mut objects = vec![SchemaObject {
            name: self.audit.name.clone(),
            description: "audit table".to_string(),
            sql: self.audit.create_sql(),
        }];
        objects.extend(self.auxiliary.iter().map(|t| SchemaObject {
            name: t.name.clone(),
            description: format!("auxiliary table of plugin {}", t.owner),
            sql: t.create_sql.clone(),
        }));
        objects.extend(self.version_tables.iter().map(|t| SchemaObject {
            name: t.name.clone(),
            description: format!("version table of {}", t.entity),
            sql: t.create_sql(&self.audit),
        }));
        objects
    }
}

/// Builds a [`Schema`], firing the schema-phase plugin hooks.
#[derive(Debug)]
pub struct SchemaBuilder {
    settings: VersioningSettings,
    user: Option<UserTable>,
    entities: Vec<EntityDef>,
}

impl SchemaBuilder {
    /// Start a schema with the given naming settings.
    pub fn new(settings: VersioningSettings) -> Self {
        Self {
            settings,
            user: None,
            entities: Vec::new(),
        }
    }

    /// Reference a user table from `audit.user_id`.
    #[must_use]
    pub fn user_table(mut self, user: UserTable) -> Self {
        self.user = Some(user);
        self
    }

    /// Track an entity type.
    #[must_use]
    pub fn entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate entity declarations and build the schema.
    ///
    /// Hook order: `after_build_audit_table`, then
    /// `after_version_table_built` once per entity, then `after_build_models`.
    pub fn build(self, plugins: &PluginCollection) -> Result<(Schema, Vec<EntityDef>)> {
        for (i, entity) in self.entities.iter().enumerate() {
            entity.validate(&self.settings)?;
            if let Some(dup) = self.entities[..i]
                .iter()
                .find(|e| e.name == entity.name || e.table == entity.table)
            {
                return Err(VersioningError::Schema(format!(
                    "entities '{}' and '{}' overlap",
                    dup.name, entity.name
                )));
            }
        }

        let mut schema = Schema {
            audit: AuditTable::new(&self.settings.audit_table, self.user),
            settings: self.settings,
            version_tables: Vec::with_capacity(self.entities.len()),
            auxiliary: Vec::new(),
        };

        plugins.after_build_audit_table(&mut schema)?;

        for entity in &self.entities {
            let mut table = VersionTable::for_entity(entity, &schema.settings);
            plugins.after_version_table_built(entity, &mut table)?;
            debug!(entity = %entity.name, table = %table.name, "built version table");
            schema.version_tables.push(table);
        }

        plugins.after_build_models(&mut schema)?;

        Ok((schema, self.entities))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
