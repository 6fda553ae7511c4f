//! # chronicle-core
//!
//! Foundation types shared by every chronicle crate.
//!
//! - **Audit IDs**: [`AuditId`] newtype over the store-assigned sequence value
//! - **Entity keys**: [`EntityKey`] identifying one entity's history chain
//! - **Operations**: [`Operation`] marker stored on every version row
//! - **Errors**: [`CoreError`] via `thiserror`
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod key;
pub mod logging;
pub mod operation;

pub use errors::{CoreError, Result};
pub use ids::AuditId;
pub use key::{EntityKey, KeyPart};
pub use operation::Operation;
