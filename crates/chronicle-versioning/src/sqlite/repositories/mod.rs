//! Repository implementations for the audit trail tables.
//!
//! Each repository is a stateless struct whose methods take a `&Connection`
//! and the name (or definition) of the table to operate on, since every
//! table name is configurable.

pub mod audit;
pub mod changes;
pub mod meta;
pub mod version;

pub use audit::AuditRepo;
pub use changes::ChangesRepo;
pub use meta::MetaRepo;
pub use version::VersionRepo;
