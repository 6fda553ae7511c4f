//! Per-transaction capture state.
//!
//! A [`UnitOfWork`] lives exactly as long as one versioned transaction. It
//! remembers, for every entity touched, the tracked state as first loaded
//! and the latest state written, and from those derives the version
//! objects the transaction will persist. Plugins keep their transient state
//! here too, so nothing leaks between transactions.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use chronicle_core::{AuditId, EntityKey, Operation};
use rusqlite::types::Value;

use crate::errors::{Result, VersioningError};
use crate::sqlite::row_types::AuditRow;

/// A version row waiting to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionObject {
    /// Entity type name.
    pub entity: String,
    /// Entity key.
    pub key: EntityKey,
    /// Tracked values: key columns then non-key columns.
    pub values: Vec<Value>,
    /// What happened to the entity.
    pub operation: Operation,
}

#[derive(Debug)]
struct PendingChange {
    entity: String,
    key: EntityKey,
    /// Tracked state before the transaction touched the row; `None` if the
    /// row did not exist.
    original: Option<Vec<Value>>,
    /// Tracked state now; `None` if the row is deleted.
    current: Option<Vec<Value>>,
    /// Last state the row had while it existed.
    last_state: Option<Vec<Value>>,
}

impl PendingChange {
    fn version_object(&self) -> Option<VersionObject> {
        let (values, operation) = match (&self.original, &self.current) {
            (None, None) => return None,
            (Some(before), Some(after)) if before == after => return None,
            (None, Some(after)) => (after.clone(), Operation::Insert),
            (Some(_), Some(after)) => (after.clone(), Operation::Update),
            (Some(before), None) => (
                self.last_state.clone().unwrap_or_else(|| before.clone()),
                Operation::Delete,
            ),
        };
        Some(VersionObject {
            entity: self.entity.clone(),
            key: self.key.clone(),
            values,
            operation,
        })
    }
}

/// Capture state of one versioned transaction.
#[derive(Default)]
pub struct UnitOfWork {
    current_audit: Option<AuditRow>,
    user_id: Option<Value>,
    changes: Vec<PendingChange>,
    index: HashMap<(String, EntityKey), usize>,
    version_objects: Vec<VersionObject>,
    plugin_state: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl UnitOfWork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The audit row of this transaction, once created.
    pub fn current_audit(&self) -> Option<&AuditRow> {
        self.current_audit.as_ref()
    }

    /// Id of the current audit.
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::InvalidOperation`] before the audit exists.
    pub fn current_audit_id(&self) -> Result<AuditId> {
        self.current_audit
            .as_ref()
            .map(|a| a.id)
            .ok_or_else(|| VersioningError::InvalidOperation("no audit has been created".into()))
    }

    pub(crate) fn set_current_audit(&mut self, audit: Option<AuditRow>) {
        self.current_audit = audit;
    }

    /// User recorded on the audit.
    pub fn user_id(&self) -> Option<&Value> {
        self.user_id.as_ref()
    }

    pub(crate) fn set_user_id(&mut self, user_id: Option<Value>) {
        self.user_id = user_id;
    }

    /// Whether the entity has been touched in this transaction.
    pub fn is_tracked(&self, entity: &str, key: &EntityKey) -> bool {
        self.index.contains_key(&(entity.to_owned(), key.clone()))
    }

    /// Record a write. `original` is only used on the first touch of the key.
    pub(crate) fn record(
        &mut self,
        entity: &str,
        key: &EntityKey,
        original: Option<Vec<Value>>,
        current: Option<Vec<Value>>,
    ) {
        let slot = (entity.to_owned(), key.clone());
        if let Some(&i) = self.index.get(&slot) {
            let change = &mut self.changes[i];
            if current.is_some() {
                change.last_state.clone_from(&current);
            }
            change.current = current;
        } else {
            let last_state = current.clone().or_else(|| original.clone());
            let _ = self.index.insert(slot, self.changes.len());
            self.changes.push(PendingChange {
                entity: entity.to_owned(),
                key: key.clone(),
                original,
                current,
                last_state,
            });
        }
    }

    /// Number of touched entities, whether or not they changed.
    pub fn touched(&self) -> usize {
        self.changes.len()
    }

    /// Whether any touched entity differs from its original state.
    pub fn has_net_changes(&self) -> bool {
        self.changes.iter().any(|c| c.version_object().is_some())
    }

    /// Derive version objects from the recorded writes, in first-touch order.
    pub(crate) fn build_version_objects(&mut self) -> usize {
        self.version_objects = self
            .changes
            .iter()
            .filter_map(PendingChange::version_object)
            .collect();
        self.version_objects.len()
    }

    /// Version objects of this transaction. Empty until the commit pipeline
    /// has derived them.
    pub fn version_objects(&self) -> &[VersionObject] {
        &self.version_objects
    }

    /// Distinct entity type names among the version objects, in first-seen
    /// order.
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for obj in &self.version_objects {
            if !names.contains(&obj.entity) {
                names.push(obj.entity.clone());
            }
        }
        names
    }

    /// Transaction-scoped state of type `T`, created on first access.
    pub fn plugin_state<T: Any + Send + Default>(&mut self) -> Result<&mut T> {
        self.plugin_state
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()))
            .downcast_mut::<T>()
            .ok_or_else(|| {
                VersioningError::InvalidOperation(format!(
                    "plugin state slot holds the wrong type for {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Drop the state of type `T`. Returns `true` if there was any.
    pub fn clear_plugin_state<T: Any>(&mut self) -> bool {
        self.plugin_state.remove(&TypeId::of::<T>()).is_some()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("current_audit", &self.current_audit)
            .field("touched", &self.changes.len())
            .field("version_objects", &self.version_objects.len())
            .field("plugin_state_slots", &self.plugin_state.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::Text(name.to_string())]
    }

    #[test]
    fn insert_produces_insert_object() {
        let mut uow = UnitOfWork::new();
        uow.record("Article", &EntityKey::from(1), None, Some(row(1, "a")));
        assert_eq!(uow.build_version_objects(), 1);
        assert_eq!(uow.version_objects()[0].operation, Operation::Insert);
        assert_eq!(uow.version_objects()[0].values, row(1, "a"));
    }

    #[test]
    fn unchanged_values_produce_nothing() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::from(1);
        uow.record("Article", &key, Some(row(1, "a")), Some(row(1, "b")));
        uow.record("Article", &key, None, Some(row(1, "a")));
        assert!(!uow.has_net_changes());
        assert_eq!(uow.build_version_objects(), 0);
        assert_eq!(uow.touched(), 1);
    }

    #[test]
    fn insert_then_delete_is_no_change() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::from(7);
        uow.record("Article", &key, None, Some(row(7, "x")));
        uow.record("Article", &key, None, None);
        assert_eq!(uow.build_version_objects(), 0);
    }

    #[test]
    fn delete_snapshots_last_state() {
        let mut uow = UnitOfWork::new();
        let key = EntityKey::from(1);
        uow.record("Article", &key, Some(row(1, "a")), Some(row(1, "b")));
        uow.record("Article", &key, None, None);
        uow.build_version_objects();
        let obj = &uow.version_objects()[0];
        assert_eq!(obj.operation, Operation::Delete);
        assert_eq!(obj.values, row(1, "b"));
    }

    #[test]
    fn plain_delete_snapshots_original() {
        let mut uow = UnitOfWork::new();
        uow.record("Article", &EntityKey::from(1), Some(row(1, "a")), None);
        uow.build_version_objects();
        assert_eq!(uow.version_objects()[0].values, row(1, "a"));
    }

    #[test]
    fn entities_are_distinct_in_first_seen_order() {
        let mut uow = UnitOfWork::new();
        uow.record("Tag", &EntityKey::from(1), None, Some(row(1, "t")));
        uow.record("Article", &EntityKey::from(1), None, Some(row(1, "a")));
        uow.record("Tag", &EntityKey::from(2), None, Some(row(2, "u")));
        uow.build_version_objects();
        assert_eq!(uow.entities(), vec!["Tag".to_string(), "Article".to_string()]);
    }

    #[test]
    fn current_audit_id_requires_audit() {
        let uow = UnitOfWork::new();
        assert!(matches!(
            uow.current_audit_id(),
            Err(VersioningError::InvalidOperation(_))
        ));
    }

    #[derive(Default)]
    struct Counter(u32);

    #[test]
    fn plugin_state_is_created_once_and_clearable() {
        let mut uow = UnitOfWork::new();
        uow.plugin_state::<Counter>().unwrap().0 += 1;
        uow.plugin_state::<Counter>().unwrap().0 += 1;
        assert_eq!(uow.plugin_state::<Counter>().unwrap().0, 2);
        assert!(uow.clear_plugin_state::<Counter>());
        assert_eq!(uow.plugin_state::<Counter>().unwrap().0, 0);
    }
}
