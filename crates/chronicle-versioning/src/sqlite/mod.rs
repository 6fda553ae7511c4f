//! `SQLite` backend for the audit trail.
//!
//! # Architecture
//!
//! - **[`connection`]**: `r2d2` connection pool with WAL mode, foreign keys,
//!   and `busy_timeout` applied to every connection.
//! - **[`migrations`]**: Idempotent application of a [`Schema`](crate::schema::Schema),
//!   recorded object by object in `schema_version`.
//! - **[`row_types`]**: Row structs for `rusqlite` row mapping.
//! - **[`repositories`]**: Stateless repository structs. Each method takes
//!   `&Connection` plus the table it operates on and executes SQL.

pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod row_types;

pub use connection::{
    ConnectionConfig, ConnectionPool, PooledConnection, PragmaState, new_file, new_in_memory,
    verify_pragmas,
};
pub use migrations::{AppliedObject, apply_schema, applied_objects};
