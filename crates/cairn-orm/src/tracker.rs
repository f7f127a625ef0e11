//! Write observation for managed entities.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::entity::AnyEntity;

/// One observed write to a managed entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub entity: AnyEntity,
    /// The attribute written, or `None` for a whole-entity `update`.
    pub attribute: Option<String>,
}

/// Collects attribute writes made through entity handles.
///
/// Handles hold a weak reference to the tracker of the manager that created
/// them. The manager drains the tracker into its active transaction before
/// each operation, where the owning persister promotes the entity to
/// `CHANGED`.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    changes: Mutex<Vec<Change>>,
}

impl ChangeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record(&self, entity: &AnyEntity, attribute: Option<&str>) {
        trace!(entity = %entity, attribute = attribute.unwrap_or("*"), "attribute write");
        self.changes.lock().expect("lock poisoned").push(Change {
            entity: entity.clone(),
            attribute: attribute.map(str::to_string),
        });
    }

    /// Take all recorded changes, oldest first.
    pub fn drain(&self) -> Vec<Change> {
        std::mem::take(&mut *self.changes.lock().expect("lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.changes.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.lock().expect("lock poisoned").is_empty()
    }
}
