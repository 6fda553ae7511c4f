//! Core error types.

use thiserror::Error;

/// Errors raised while building or decoding core value types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value cannot be used as (part of) an entity primary key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An `operation_type` column held a value outside the known set.
    #[error("unknown operation type: {0}")]
    UnknownOperation(i64),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
