//! Pool-backed entry point: a connection pool plus a shared manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use chronicle_core::{AuditId, EntityKey};
use chronicle_settings::DatabaseSettings;
use tracing::{info, warn};

use crate::errors::{Result, VersioningError};
use crate::manager::VersioningManager;
use crate::plugins::{AuditChangesPlugin, AuditMetaPlugin};
use crate::sqlite::repositories::{AuditRepo, ChangesRepo, MetaRepo, VersionRepo};
use crate::sqlite::row_types::{AuditRow, VersionRow};
use crate::sqlite::{ConnectionConfig, ConnectionPool, PooledConnection, new_file, new_in_memory};
use crate::transaction::VersionedTransaction;
use crate::validity::{self, ChainViolation, RepairReport, ValidityColumns};

/// Connection pool and versioning manager.
#[derive(Clone)]
pub struct VersionStore {
    pool: ConnectionPool,
    manager: Arc<VersioningManager>,
}

impl VersionStore {
    /// Wrap an existing pool.
    pub fn new(pool: ConnectionPool, manager: Arc<VersioningManager>) -> Self {
        Self { pool, manager }
    }

    /// Open the database named in `settings`, or a private in-memory one when
    /// no path is configured.
    pub fn open(settings: &DatabaseSettings, manager: Arc<VersioningManager>) -> Result<Self> {
        let pool = match &settings.path {
            Some(path) => {
                info!(path = %path, pool_size = settings.pool_size, "opening version store");
                new_file(path, &ConnectionConfig::from(settings))?
            }
            None => {
                let config = ConnectionConfig {
                    pool_size: 1,
                    ..ConnectionConfig::from(settings)
                };
                new_in_memory(&config)?
            }
        };
        Ok(Self::new(pool, manager))
    }

    /// Single-connection in-memory store.
    pub fn in_memory(manager: Arc<VersioningManager>) -> Result<Self> {
        let config = ConnectionConfig {
            pool_size: 1,
            ..ConnectionConfig::default()
        };
        Ok(Self::new(new_in_memory(&config)?, manager))
    }

    /// The shared manager.
    pub fn manager(&self) -> &VersioningManager {
        &self.manager
    }

    /// Check out a pooled connection.
    pub fn connection(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Create every table of the schema. Returns how many were new.
    pub fn create_schema(&self) -> Result<usize> {
        let conn = self.connection()?;
        self.manager.create_schema(&conn)
    }

    /// Run `f` inside a versioned transaction and commit it.
    ///
    /// If `f` fails the transaction is rolled back and its error returned.
    /// On success returns `f`'s value and the audit, `None` when nothing
    /// tracked changed.
    pub fn transact<T, F>(&self, f: F) -> Result<(T, Option<AuditRow>)>
    where
        F: FnOnce(&mut VersionedTransaction<'_, '_>) -> Result<T>,
    {
        let conn = self.connection()?;
        let mut tx = self.manager.begin(&conn)?;
        match f(&mut tx) {
            Ok(value) => {
                let audit = tx.commit()?;
                Ok((value, audit))
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback after failed transaction body failed");
                }
                Err(err)
            }
        }
    }

    /// One audit.
    pub fn audit(&self, id: AuditId) -> Result<Option<AuditRow>> {
        let conn = self.connection()?;
        AuditRepo::get(&conn, self.manager.audit_table(), id)
    }

    /// Every audit, oldest first.
    pub fn audits(&self) -> Result<Vec<AuditRow>> {
        let conn = self.connection()?;
        AuditRepo::list(&conn, self.manager.audit_table())
    }

    /// The newest `limit` audits, newest first.
    pub fn latest_audits(&self, limit: u32) -> Result<Vec<AuditRow>> {
        let conn = self.connection()?;
        AuditRepo::latest(&conn, self.manager.audit_table(), limit)
    }

    /// Entity types an audit touched, sorted.
    pub fn changes(&self, id: AuditId) -> Result<Vec<String>> {
        let table = self.changes_table()?;
        let conn = self.connection()?;
        ChangesRepo::for_audit(&conn, table, id)
    }

    /// Snapshot of an audit's tags.
    pub fn meta(&self, id: AuditId) -> Result<BTreeMap<String, String>> {
        let table = &self.manager.auxiliary_table(AuditMetaPlugin::NAME)?.name;
        let conn = self.connection()?;
        Ok(MetaRepo::list(&conn, table, id)?
            .into_iter()
            .map(|row| (row.key, row.value))
            .collect())
    }

    /// Audits that touched `entity`, oldest first.
    pub fn audits_touching(&self, entity: &str) -> Result<Vec<AuditId>> {
        let _ = self.manager.entity(entity)?;
        let table = self.changes_table()?;
        let conn = self.connection()?;
        ChangesRepo::audits_touching(&conn, table, entity)
    }

    /// Audits that touched none of `entities`, oldest first.
    pub fn audits_not_touching(&self, entities: &[&str]) -> Result<Vec<AuditId>> {
        for entity in entities {
            let _ = self.manager.entity(entity)?;
        }
        let table = self.changes_table()?;
        let conn = self.connection()?;
        ChangesRepo::audits_not_touching(&conn, self.manager.audit_table(), table, entities)
    }

    /// Audits tagged `key = value`, oldest first.
    pub fn audits_tagged(&self, key: &str, value: &str) -> Result<Vec<AuditId>> {
        let table = &self.manager.auxiliary_table(AuditMetaPlugin::NAME)?.name;
        let conn = self.connection()?;
        MetaRepo::audits_tagged(&conn, table, key, value)
    }

    /// Every version row of one entity, oldest first.
    pub fn history(&self, entity: &str, key: &EntityKey) -> Result<Vec<VersionRow>> {
        let table = self.manager.version_table(entity)?;
        let conn = self.connection()?;
        VersionRepo::chain(&conn, table, key)
    }

    /// The version row of one entity that was current at `audit_id`.
    pub fn version_at(&self, entity: &str, key: &EntityKey, audit_id: AuditId) -> Result<Option<VersionRow>> {
        let table = self.manager.version_table(entity)?;
        let conn = self.connection()?;
        VersionRepo::version_at(&conn, table, key, audit_id)
    }

    /// Rebuild the end markers of one entity type's version table.
    ///
    /// # Errors
    ///
    /// [`VersioningError::InvalidOperation`] under the append-only strategy,
    /// which has no end markers.
    pub fn repair(&self, entity: &str) -> Result<RepairReport> {
        let (table, columns) = self.validity_table(entity)?;
        let conn = self.connection()?;
        validity::update_end_tx_column_with(&conn, table, &columns)
    }

    /// Rows of one entity type whose end marker disagrees with its chain.
    pub fn verify(&self, entity: &str) -> Result<Vec<ChainViolation>> {
        let (table, columns) = self.validity_table(entity)?;
        let conn = self.connection()?;
        validity::verify_chains(&conn, table, &columns)
    }

    fn changes_table(&self) -> Result<&str> {
        Ok(&self.manager.auxiliary_table(AuditChangesPlugin::NAME)?.name)
    }

    fn validity_table(&self, entity: &str) -> Result<(&str, ValidityColumns)> {
        let table = self.manager.version_table(entity)?;
        let Some(end) = table.end_audit_id_column() else {
            return Err(VersioningError::InvalidOperation(format!(
                "{} is append-only and has no end markers",
                table.name()
            )));
        };
        let columns = ValidityColumns {
            audit_id: table.audit_id_column().to_string(),
            end_audit_id: end.to_string(),
        };
        Ok((table.name(), columns))
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore")
            .field("pool_state", &self.pool.state())
            .field("manager", &self.manager)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
