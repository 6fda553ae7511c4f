//! Connection pool settings.

use serde::{Deserialize, Serialize};

/// `SQLite` connection pool and pragma settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file path. `None` opens a private in-memory database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// `busy_timeout` pragma in milliseconds.
    pub busy_timeout_ms: u64,
    /// Page cache size in KiB (`cache_size = -N`).
    pub cache_size_kib: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: 8,
            busy_timeout_ms: 5_000,
            cache_size_kib: 64 * 1024,
        }
    }
}
