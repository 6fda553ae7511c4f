//! The versioning manager: plugins, schema and entity declarations in one
//! immutable value, shared by every transaction.

use std::sync::Arc;

use chronicle_settings::{VersioningSettings, VersioningStrategy};
use rusqlite::Connection;
use tracing::info;

use crate::errors::{Result, VersioningError};
use crate::plugins::{
    AuditChangesPlugin, AuditMetaPlugin, PluginCollection, VersioningPlugin,
};
use crate::schema::{AuxiliaryTable, EntityDef, Schema, SchemaBuilder, UserTable, VersionTable};
use crate::sqlite::apply_schema;
use crate::transaction::VersionedTransaction;

/// Built schema plus the plugins that observe it.
#[derive(Debug)]
pub struct VersioningManager {
    plugins: PluginCollection,
    schema: Schema,
    entities: Vec<EntityDef>,
}

impl VersioningManager {
    /// Start configuring a manager.
    pub fn builder(settings: VersioningSettings) -> VersioningManagerBuilder {
        VersioningManagerBuilder {
            schema: SchemaBuilder::new(settings.clone()),
            settings,
            plugins: PluginCollection::new(),
        }
    }

    /// Naming and strategy settings.
    pub fn settings(&self) -> &VersioningSettings {
        self.schema.settings()
    }

    /// Validity strategy.
    pub fn strategy(&self) -> VersioningStrategy {
        self.schema.strategy()
    }

    /// Registered plugins.
    pub fn plugins(&self) -> &PluginCollection {
        &self.plugins
    }

    /// Built schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Audit table name.
    pub fn audit_table(&self) -> &str {
        self.schema.audit_table().name()
    }

    /// Tracked entity types in declaration order.
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    /// Declaration of a tracked entity type.
    ///
    /// # Errors
    ///
    /// [`VersioningError::ClassNotVersioned`] if `name` is not tracked.
    pub fn entity(&self, name: &str) -> Result<&EntityDef> {
        self.entities
            .iter()
            .find(|e| e.name() == name)
            .ok_or_else(|| VersioningError::ClassNotVersioned(name.to_string()))
    }

    /// Version table of a tracked entity type.
    ///
    /// # Errors
    ///
    /// [`VersioningError::ClassNotVersioned`] if `entity` is not tracked.
    pub fn version_table(&self, entity: &str) -> Result<&VersionTable> {
        self.schema
            .version_table(entity)
            .ok_or_else(|| VersioningError::ClassNotVersioned(entity.to_string()))
    }

    /// Auxiliary table registered by the plugin named `owner`.
    ///
    /// # Errors
    ///
    /// [`VersioningError::PluginNotRegistered`] if no such table exists.
    pub fn auxiliary_table(&self, owner: &str) -> Result<&AuxiliaryTable> {
        self.schema
            .auxiliary_for(owner)
            .ok_or_else(|| VersioningError::PluginNotRegistered(owner.to_string()))
    }

    /// Create every table of the schema. Safe to call repeatedly.
    pub fn create_schema(&self, conn: &Connection) -> Result<usize> {
        apply_schema(conn, &self.schema)
    }

    /// Begin a versioned transaction on `conn`.
    ///
    /// # Errors
    ///
    /// [`VersioningError::InvalidOperation`] if `conn` already has an open
    /// transaction, or the storage error if the write lock cannot be taken.
    pub fn begin<'m, 'c>(&'m self, conn: &'c Connection) -> Result<VersionedTransaction<'m, 'c>> {
        VersionedTransaction::begin(self, conn)
    }
}

/// Configures a [`VersioningManager`].
#[derive(Debug)]
pub struct VersioningManagerBuilder {
    settings: VersioningSettings,
    schema: SchemaBuilder,
    plugins: PluginCollection,
}

impl VersioningManagerBuilder {
    /// Register a plugin. Plugins fire in registration order; a second
    /// plugin with an already registered name is ignored.
    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn VersioningPlugin>) -> Self {
        let _ = self.plugins.add(plugin);
        self
    }

    /// Register the changes tracker and the meta store, using the table names
    /// from the settings.
    #[must_use]
    pub fn with_default_plugins(self) -> Self {
        let changes = AuditChangesPlugin::with_table(self.settings.changes_table.clone());
        let meta = AuditMetaPlugin::with_table(self.settings.meta_table.clone());
        self.plugin(Arc::new(changes)).plugin(Arc::new(meta))
    }

    /// Reference a user table from `audit.user_id`.
    #[must_use]
    pub fn user_table(mut self, user: UserTable) -> Self {
        self.schema = self.schema.user_table(user);
        self
    }

    /// Track an entity type.
    #[must_use]
    pub fn entity(mut self, entity: EntityDef) -> Self {
        self.schema = self.schema.entity(entity);
        self
    }

    /// Build the schema, firing the schema-phase hooks.
    ///
    /// # Errors
    ///
    /// [`VersioningError::Schema`] for invalid entity declarations, or the
    /// first failing plugin hook.
    pub fn build(self) -> Result<VersioningManager> {
        let (schema, entities) = self.schema.build(&self.plugins)?;
        info!(
            entities = entities.len(),
            plugins = ?self.plugins.names(),
            strategy = ?schema.strategy(),
            "versioning manager built"
        );
        Ok(VersioningManager {
            plugins: self.plugins,
            schema,
            entities,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
