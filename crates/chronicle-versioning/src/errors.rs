//! Error types for the versioning subsystem.
//!
//! [`VersioningError`] is returned by every schema, capture and repair
//! operation. Plugin hooks return it too, so a failing plugin surfaces to the
//! caller exactly as it was raised.

use chronicle_core::CoreError;
use thiserror::Error;

/// Errors that can occur while building schemas or capturing history.
#[derive(Debug, Error)]
pub enum VersioningError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The entity type has no version table.
    #[error("entity '{0}' is not versioned")]
    ClassNotVersioned(String),

    /// A tracked entity row does not exist in its primary table.
    #[error("{entity} {key} not found")]
    EntityNotFound {
        /// Entity type name.
        entity: String,
        /// Rendered primary key.
        key: String,
    },

    /// A key value could not be used to identify an entity.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A version table's chain cannot be given consistent validity intervals.
    #[error("validity conflict in {table}: key {key} has more than one row at audit {audit_id}")]
    ValidityConflict {
        /// Version table name.
        table: String,
        /// Rendered entity key.
        key: String,
        /// The duplicated audit id.
        audit_id: i64,
    },

    /// An operation needs a plugin that is not registered with the manager.
    #[error("plugin not registered: {0}")]
    PluginNotRegistered(String),

    /// A plugin hook failed.
    #[error("plugin '{plugin}' failed: {message}")]
    Hook {
        /// Plugin name.
        plugin: String,
        /// Failure description.
        message: String,
    },

    /// Schema definition or schema application error.
    #[error("schema error: {0}")]
    Schema(String),

    /// Operation not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl VersioningError {
    /// Build a [`VersioningError::Hook`] for the named plugin.
    pub fn hook(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

impl From<CoreError> for VersioningError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidKey(msg) => Self::InvalidKey(msg),
            CoreError::UnknownOperation(raw) => {
                Self::InvalidOperation(format!("unknown operation type: {raw}"))
            }
        }
    }
}

/// Convenience type alias for versioning results.
pub type Result<T> = std::result::Result<T, VersioningError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
