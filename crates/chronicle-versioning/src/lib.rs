//! # chronicle-versioning
//!
//! Transaction-scoped version history for `SQLite` tables.
//!
//! Every write transaction that changes a tracked entity gets one audit row;
//! every changed entity gets an immutable version row stamped with it. Rows
//! of one entity form a chain of half-open `[audit_id, end_audit_id)`
//! intervals.
//!
//! - **Schema**: [`SchemaBuilder`] derives the audit table and one version
//!   table per [`EntityDef`]
//! - **Plugins**: [`VersioningPlugin`] hooks fired at fixed points of schema
//!   build and commit, with [`AuditChangesPlugin`] and [`AuditMetaPlugin`]
//!   built in
//! - **Capture**: [`VersionedTransaction`] records writes into a
//!   [`UnitOfWork`] and turns net changes into version rows on commit
//! - **Validity**: incremental end-marker closing on write, plus the
//!   [`update_end_tx_column`] batch repair
//! - **Store**: [`VersionStore`] pairs an `r2d2` pool with a shared
//!   [`VersioningManager`]
//!
//! ```ignore
//! let manager = VersioningManager::builder(settings.versioning.clone())
//!     .with_default_plugins()
//!     .entity(EntityDef::new("Article", "article").key("id", "INTEGER").column("name", "TEXT"))
//!     .build()?;
//! let store = VersionStore::open(&settings.database, Arc::new(manager))?;
//! store.create_schema()?;
//! let (key, audit) = store.transact(|tx| tx.insert("Article", &[("name", Value::Text("Hello".into()))]))?;
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod plugins;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod transaction;
pub mod unit_of_work;
pub mod validity;

pub use errors::{Result, VersioningError};
pub use manager::{VersioningManager, VersioningManagerBuilder};
pub use plugins::{AuditChangesPlugin, AuditMetaPlugin, MetaMap, PluginCollection, VersioningPlugin};
pub use schema::{
    AuxiliaryTable, ColumnDef, EntityDef, Schema, SchemaBuilder, UserTable, VersionTable,
};
pub use sqlite::row_types::{AuditChangesRow, AuditMetaRow, AuditRow, VersionRow};
pub use store::VersionStore;
pub use transaction::VersionedTransaction;
pub use unit_of_work::{UnitOfWork, VersionObject};
pub use validity::{
    ChainViolation, RepairReport, ValidityColumns, update_end_tx_column,
    update_end_tx_column_with, verify_chains,
};
