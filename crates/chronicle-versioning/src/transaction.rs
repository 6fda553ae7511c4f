//! Versioned write transactions.
//!
//! A [`VersionedTransaction`] wraps one `BEGIN IMMEDIATE ... COMMIT` on a
//! connection. Writes to tracked entities go through it so the unit of work
//! sees the state before and after each write. On commit the net changes
//! become version rows under a single new audit; if nothing changed no audit
//! is created at all.
//!
//! Commit pipeline:
//!
//! 1. derive version objects from the unit of work
//! 2. create the audit row (unless one was created eagerly)
//! 3. fire `before_create_version_objects`
//! 4. per object: close the key's open row, then insert the new row
//! 5. `COMMIT`, then fire `after_commit`
//!
//! Any failure before `COMMIT` rolls the whole transaction back, business
//! writes included, and fires `after_rollback`.

use chronicle_core::EntityKey;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use tracing::{debug, info, warn};

use crate::errors::{Result, VersioningError};
use crate::manager::VersioningManager;
use crate::plugins::{AuditMetaPlugin, MetaMap};
use crate::schema::{EntityDef, quote_ident};
use crate::sqlite::repositories::{AuditRepo, VersionRepo};
use crate::sqlite::row_types::AuditRow;
use crate::unit_of_work::UnitOfWork;

/// An open versioned transaction.
///
/// Dropping it without calling [`commit`](Self::commit) rolls back.
pub struct VersionedTransaction<'m, 'c> {
    manager: &'m VersioningManager,
    conn: &'c Connection,
    open: bool,
    uow: UnitOfWork,
}

impl<'m, 'c> VersionedTransaction<'m, 'c> {
    pub(crate) fn begin(manager: &'m VersioningManager, conn: &'c Connection) -> Result<Self> {
        if !conn.is_autocommit() {
            return Err(VersioningError::InvalidOperation(
                "connection already has an open transaction".into(),
            ));
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        debug!("versioned transaction started");
        Ok(Self {
            manager,
            conn,
            open: true,
            uow: UnitOfWork::new(),
        })
    }

    /// Underlying connection, for untracked reads and writes that should
    /// share the transaction.
    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// Capture state so far.
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    /// Insert a row into a tracked entity's table and return its key.
    ///
    /// The key is read back from the stored row, so key columns left out of
    /// `values` take whatever `SQLite` assigned them.
    ///
    /// # Errors
    ///
    /// [`VersioningError::InvalidKey`] when a stored key column is `NULL`, as
    /// happens for an omitted `INT PRIMARY KEY` that is not a rowid alias.
    pub fn insert(&mut self, entity: &str, values: &[(&str, Value)]) -> Result<EntityKey> {
        let def = self.manager.entity(entity)?;
        let returning: Vec<String> = def.key_columns().iter().map(|c| quote_ident(&c.name)).collect();
        let target = if values.is_empty() {
            "DEFAULT VALUES".to_string()
        } else {
            let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
            format!("({}) VALUES ({})", columns.join(", "), placeholders.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} {target} RETURNING {}",
            quote_ident(def.table()),
            returning.join(", ")
        );
        let stored = self.conn.query_row(
            &sql,
            params_from_iter(values.iter().map(|(_, v)| v)),
            |row| {
                (0..returning.len())
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
        )?;
        let key = EntityKey::from_values(&stored).map_err(|err| {
            VersioningError::InvalidKey(format!("{entity} row stored without a usable key: {err}"))
        })?;

        let current = load_tracked(self.conn, def, &key)?.ok_or_else(|| not_found(entity, &key))?;
        self.uow.record(entity, &key, None, Some(current));
        debug!(entity, key = %key, "tracked insert");
        Ok(key)
    }

    /// Update tracked or untracked columns of one row. Key columns cannot be
    /// changed.
    pub fn update(&mut self, entity: &str, key: &EntityKey, values: &[(&str, Value)]) -> Result<()> {
        let def = self.manager.entity(entity)?;
        if let Some(column) = values
            .iter()
            .find(|(c, _)| def.key_columns().iter().any(|k| k.name == *c))
        {
            return Err(VersioningError::InvalidOperation(format!(
                "key column '{}' of {entity} cannot be updated",
                column.0
            )));
        }
        let original = load_tracked(self.conn, def, key)?.ok_or_else(|| not_found(entity, key))?;

        if !values.is_empty() {
            let assignments: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(c), i + 1))
                .collect();
            let mut params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
            params.extend(key.to_values());
            let _ = self.conn.execute(
                &format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(def.table()),
                    assignments.join(", "),
                    key_predicate(def, values.len() + 1)
                ),
                params_from_iter(params.iter()),
            )?;
        }

        let current = load_tracked(self.conn, def, key)?;
        self.uow.record(entity, key, Some(original), current);
        debug!(entity, key = %key, "tracked update");
        Ok(())
    }

    /// Delete one row.
    pub fn delete(&mut self, entity: &str, key: &EntityKey) -> Result<()> {
        let def = self.manager.entity(entity)?;
        let original = load_tracked(self.conn, def, key)?.ok_or_else(|| not_found(entity, key))?;
        let _ = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(def.table()),
                key_predicate(def, 1)
            ),
            params_from_iter(key.to_values().iter()),
        )?;
        self.uow.record(entity, key, Some(original), None);
        debug!(entity, key = %key, "tracked delete");
        Ok(())
    }

    /// Current tracked state of one row, key columns first.
    pub fn get(&self, entity: &str, key: &EntityKey) -> Result<Option<Vec<Value>>> {
        let def = self.manager.entity(entity)?;
        load_tracked(self.conn, def, key)
    }

    /// The audit of this transaction, created now if it does not exist yet.
    ///
    /// An audit created this way is still discarded at commit if the
    /// transaction ends up with no net changes.
    pub fn audit(&mut self) -> Result<AuditRow> {
        if let Some(audit) = self.uow.current_audit() {
            return Ok(audit.clone());
        }
        let audit = AuditRepo::create(self.conn, self.manager.audit_table(), self.uow.user_id())?;
        debug!(audit_id = %audit.id, "audit created");
        self.uow.set_current_audit(Some(audit.clone()));
        Ok(audit)
    }

    /// Tags of this transaction's audit. Creates the audit if needed.
    ///
    /// # Errors
    ///
    /// [`VersioningError::PluginNotRegistered`] without the meta plugin.
    pub fn meta(&mut self) -> Result<MetaMap<'_>> {
        let manager = self.manager;
        let table = manager.auxiliary_table(AuditMetaPlugin::NAME)?;
        let audit = self.audit()?;
        Ok(MetaMap::new(self.conn, &table.name, audit.id))
    }

    /// Record `user_id` on the audit.
    pub fn set_user(&mut self, user_id: Option<Value>) -> Result<()> {
        if let Some(audit) = self.uow.current_audit() {
            let id = audit.id;
            let _ = AuditRepo::set_user(self.conn, self.manager.audit_table(), id, user_id.as_ref())?;
            let mut updated = audit.clone();
            updated.user_id.clone_from(&user_id);
            self.uow.set_current_audit(Some(updated));
        }
        self.uow.set_user_id(user_id);
        Ok(())
    }

    /// Write version rows and commit.
    ///
    /// Returns the audit, or `None` if the transaction had no net changes.
    ///
    /// # Errors
    ///
    /// Any storage or plugin failure before `COMMIT` rolls everything back
    /// and is returned unchanged. A failing `after_commit` hook is returned
    /// too, but the data is already committed by then.
    pub fn commit(mut self) -> Result<Option<AuditRow>> {
        if let Err(err) = self.flush() {
            self.abort();
            return Err(err);
        }
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            self.abort();
            return Err(err.into());
        }
        self.open = false;

        let audit = self.uow.current_audit().cloned();
        match &audit {
            Some(a) => info!(
                audit_id = %a.id,
                versions = self.uow.version_objects().len(),
                entities = ?self.uow.entities(),
                "versioned transaction committed"
            ),
            None => debug!("transaction committed without net changes"),
        }
        self.manager.plugins().after_commit(&mut self.uow, self.conn)?;
        Ok(audit)
    }

    /// Roll back every write of the transaction.
    pub fn rollback(mut self) -> Result<()> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        debug!("versioned transaction rolled back");
        self.manager.plugins().after_rollback(&mut self.uow, self.conn)
    }

    fn flush(&mut self) -> Result<()> {
        let pending = self.uow.build_version_objects();
        if pending == 0 {
            if let Some(audit) = self.uow.current_audit() {
                let _ = AuditRepo::delete(self.conn, self.manager.audit_table(), audit.id)?;
                self.uow.set_current_audit(None);
            }
            return Ok(());
        }

        let _ = self.audit()?;
        self.manager
            .plugins()
            .before_create_version_objects(&mut self.uow, self.conn)?;

        let audit_id = self.uow.current_audit_id()?;
        for object in self.uow.version_objects() {
            let table = self.manager.version_table(&object.entity)?;
            let closed = VersionRepo::close_previous(self.conn, table, &object.key, audit_id)?;
            VersionRepo::insert(self.conn, table, object, audit_id)?;
            debug!(
                table = table.name(),
                key = %object.key,
                operation = %object.operation,
                closed,
                "version row written"
            );
        }
        Ok(())
    }

    /// Roll back after a failure. Errors here are logged so the original one
    /// reaches the caller.
    fn abort(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %err, "rollback failed");
        }
        if let Err(err) = self.manager.plugins().after_rollback(&mut self.uow, self.conn) {
            warn!(error = %err, "after_rollback hook failed");
        }
        debug!("versioned transaction aborted");
    }
}

impl Drop for VersionedTransaction<'_, '_> {
    fn drop(&mut self) {
        if self.open {
            warn!("versioned transaction dropped without commit, rolling back");
            self.abort();
        }
    }
}

impl std::fmt::Debug for VersionedTransaction<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedTransaction")
            .field("open", &self.open)
            .field("uow", &self.uow)
            .finish_non_exhaustive()
    }
}

fn not_found(entity: &str, key: &EntityKey) -> VersioningError {
    VersioningError::EntityNotFound {
        entity: entity.to_string(),
        key: key.to_string(),
    }
}

fn key_predicate(def: &EntityDef, first: usize) -> String {
    def.key_columns()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(&c.name), first + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Key columns then tracked columns of one row, or `None` if it is absent.
fn load_tracked(conn: &Connection, def: &EntityDef, key: &EntityKey) -> Result<Option<Vec<Value>>> {
    if key.len() != def.key_columns().len() {
        return Err(VersioningError::InvalidKey(format!(
            "{} has {} key columns, key {key} has {}",
            def.name(),
            def.key_columns().len(),
            key.len()
        )));
    }
    let columns: Vec<String> = def
        .key_columns()
        .iter()
        .chain(def.columns())
        .map(|c| quote_ident(&c.name))
        .collect();
    let width = columns.len();
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {}",
                columns.join(", "),
                quote_ident(def.table()),
                key_predicate(def, 1)
            ),
            params_from_iter(key.to_values().iter()),
            |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            },
        )
        .optional()?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
