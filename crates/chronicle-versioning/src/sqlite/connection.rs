//! Pooled `SQLite` connections for the version store.
//!
//! Each connection the pool hands out has foreign keys switched on, so
//! deleting an audit cascades to its version, change and tag rows, and a
//! `busy_timeout` so writers queue behind `BEGIN IMMEDIATE` instead of
//! failing at once.

use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use chronicle_settings::DatabaseSettings;

use crate::errors::Result;

/// Pool of store connections.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// A connection checked out of a [`ConnectionPool`].
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool sizing and per-connection tuning.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Upper bound on open connections.
    pub pool_size: u32,
    /// How long a blocked writer waits for the lock, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&DatabaseSettings::default())
    }
}

impl From<&DatabaseSettings> for ConnectionConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            busy_timeout_ms: settings.busy_timeout_ms,
            cache_size_kib: settings.cache_size_kib,
        }
    }
}

impl ConnectionConfig {
    fn session_pragmas(&self) -> String {
        format!(
            "PRAGMA foreign_keys = ON;\
             PRAGMA journal_mode = WAL;\
             PRAGMA synchronous = NORMAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA cache_size = -{};",
            self.busy_timeout_ms, self.cache_size_kib
        )
    }
}

#[derive(Debug)]
struct SessionSetup(String);

impl CustomizeConnection<Connection, rusqlite::Error> for SessionSetup {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&self.0)
    }
}

fn pool_for(manager: SqliteConnectionManager, config: &ConnectionConfig) -> Result<ConnectionPool> {
    Ok(Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(CHECKOUT_TIMEOUT)
        .connection_customizer(Box::new(SessionSetup(config.session_pragmas())))
        .build(manager)?)
}

/// Pool of in-memory databases.
///
/// Connections do not share data: each one is its own database. Pass a
/// `pool_size` of 1 for a single shared store.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    pool_for(SqliteConnectionManager::memory(), config)
}

/// Pool over the database file at `path`, created if absent.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    pool_for(SqliteConnectionManager::file(path), config)
}

/// Session settings read back from a live connection.
#[derive(Debug)]
pub struct PragmaState {
    /// `wal` for files; in-memory databases report `memory`.
    pub journal_mode: String,
    /// `PRAGMA foreign_keys`.
    pub foreign_keys_enabled: bool,
    /// `PRAGMA busy_timeout`.
    pub busy_timeout_ms: i64,
}

/// Read the session settings of `conn`.
pub fn verify_pragmas(conn: &Connection) -> Result<PragmaState> {
    let read_text = |name: &str| conn.pragma_query_value(None, name, |row| row.get::<_, String>(0));
    let read_int = |name: &str| conn.pragma_query_value(None, name, |row| row.get::<_, i64>(0));
    Ok(PragmaState {
        journal_mode: read_text("journal_mode")?,
        foreign_keys_enabled: read_int("foreign_keys")? == 1,
        busy_timeout_ms: read_int("busy_timeout")?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
