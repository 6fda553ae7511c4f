//! Plugin hooks.
//!
//! A [`VersioningPlugin`] observes schema construction and transaction
//! capture at fixed lifecycle points. Every hook has a no-op default, so a
//! plugin implements only the points it cares about.
//!
//! The [`PluginCollection`] dispatches each hook to every plugin in
//! registration order with the same arguments. It does not inspect results
//! beyond propagating the first error, which aborts whatever operation fired
//! the hook (schema build or the enclosing transaction).

pub mod audit_changes;
pub mod audit_meta;

pub use audit_changes::AuditChangesPlugin;
pub use audit_meta::{AuditMetaPlugin, MetaMap};

use std::sync::Arc;

use rusqlite::Connection;
use tracing::debug;

use crate::errors::Result;
use crate::schema::{EntityDef, Schema, VersionTable};
use crate::unit_of_work::UnitOfWork;

/// An extension of the capture lifecycle.
///
/// Plugins are shared across threads and transactions, so hooks take
/// `&self`. Per-transaction state belongs in
/// [`UnitOfWork::plugin_state`].
pub trait VersioningPlugin: Send + Sync {
    /// Unique plugin name. A second plugin with the same name is ignored.
    fn name(&self) -> &str;

    /// Fired once after the audit table is defined.
    fn after_build_audit_table(&self, _schema: &mut Schema) -> Result<()> {
        Ok(())
    }

    /// Fired once after every version table is defined.
    fn after_build_models(&self, _schema: &mut Schema) -> Result<()> {
        Ok(())
    }

    /// Fired once per tracked entity type.
    fn after_version_table_built(
        &self,
        _entity: &EntityDef,
        _version_table: &mut VersionTable,
    ) -> Result<()> {
        Ok(())
    }

    /// Fired once per committing transaction with net changes, after the
    /// audit row exists and version objects are known, before they are
    /// written.
    fn before_create_version_objects(
        &self,
        _uow: &mut UnitOfWork,
        _conn: &Connection,
    ) -> Result<()> {
        Ok(())
    }

    /// Fired after the transaction committed. Must not write.
    fn after_commit(&self, _uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Fired after the transaction rolled back. Must not write.
    fn after_rollback(&self, _uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

/// Ordered, name-deduplicated set of plugins.
#[derive(Clone, Default)]
pub struct PluginCollection {
    plugins: Vec<Arc<dyn VersioningPlugin>>,
}

impl PluginCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Append a plugin. If a plugin with the same name is already present
    /// the call is ignored and the original keeps its position.
    ///
    /// Returns `true` if the plugin was added.
    pub fn add(&mut self, plugin: Arc<dyn VersioningPlugin>) -> bool {
        if self.contains(plugin.name()) {
            debug!(plugin = plugin.name(), "plugin already registered, ignoring");
            return false;
        }
        debug!(plugin = plugin.name(), position = self.plugins.len(), "registering plugin");
        self.plugins.push(plugin);
        true
    }

    /// Remove a plugin by name. Returns `true` if one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.plugins.len();
        self.plugins.retain(|p| p.name() != name);
        self.plugins.len() < before
    }

    /// Whether a plugin with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    /// Get a plugin by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn VersioningPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    /// Plugin names in dispatch order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Iterate plugins in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn VersioningPlugin>> {
        self.plugins.iter()
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    pub(crate) fn after_build_audit_table(&self, schema: &mut Schema) -> Result<()> {
        for plugin in &self.plugins {
            trace_dispatch("after_build_audit_table", plugin.as_ref());
            plugin.after_build_audit_table(schema)?;
        }
        Ok(())
    }

    pub(crate) fn after_build_models(&self, schema: &mut Schema) -> Result<()> {
        for plugin in &self.plugins {
            trace_dispatch("after_build_models", plugin.as_ref());
            plugin.after_build_models(schema)?;
        }
        Ok(())
    }

    pub(crate) fn after_version_table_built(
        &self,
        entity: &EntityDef,
        version_table: &mut VersionTable,
    ) -> Result<()> {
        for plugin in &self.plugins {
            trace_dispatch("after_version_table_built", plugin.as_ref());
            plugin.after_version_table_built(entity, version_table)?;
        }
        Ok(())
    }

    pub(crate) fn before_create_version_objects(
        &self,
        uow: &mut UnitOfWork,
        conn: &Connection,
    ) -> Result<()> {
        for plugin in &self.plugins {
            trace_dispatch("before_create_version_objects", plugin.as_ref());
            plugin.before_create_version_objects(uow, conn)?;
        }
        Ok(())
    }

    pub(crate) fn after_commit(&self, uow: &mut UnitOfWork, conn: &Connection) -> Result<()> {
        for plugin in &self.plugins {
            trace_dispatch("after_commit", plugin.as_ref());
            plugin.after_commit(uow, conn)?;
        }
        Ok(())
    }

    pub(crate) fn after_rollback(&self, uow: &mut UnitOfWork, conn: &Connection) -> Result<()> {
        for plugin in &self.plugins {
            trace_dispatch("after_rollback", plugin.as_ref());
            plugin.after_rollback(uow, conn)?;
        }
        Ok(())
    }
}

fn trace_dispatch(hook: &'static str, plugin: &dyn VersioningPlugin) {
    debug!(hook, plugin = plugin.name(), "dispatching plugin hook");
}

impl std::fmt::Debug for PluginCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCollection")
            .field("plugins", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
