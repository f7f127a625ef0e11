//! Managed entity handles.
//!
//! Every entity the mapper knows about lives in an [`EntityCell`]: a
//! process-unique [`EntityId`], its [`EntityType`], the user's struct behind a
//! lock, and a weak link to the [`ChangeTracker`] of the manager that created
//! it. [`AnyEntity`] is the type-erased handle used by the unit of work;
//! [`Handle<T>`] is the typed handle application code holds.
//!
//! Identity is the cell, never the content: two handles are equal exactly when
//! they point at the same cell.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use cairn_types::Value;

use crate::error::{OrmError, OrmResult};
use crate::meta::{Attribute, EntityType, TypeTag};
use crate::tracker::ChangeTracker;

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a managed entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    fn next() -> Self {
        Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An attribute as seen through the accessor table.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    Value(Value),
    /// Association: the referenced entity, if any.
    Reference(Option<AnyEntity>),
}

impl Field {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Reference(_) => None,
        }
    }

    pub fn as_reference(&self) -> Option<&AnyEntity> {
        match self {
            Self::Reference(r) => r.as_ref(),
            Self::Value(_) => None,
        }
    }
}

pub struct EntityCell {
    id: EntityId,
    entity_type: Arc<EntityType>,
    value: RwLock<Box<dyn Any + Send + Sync>>,
    tracker: Weak<ChangeTracker>,
}

/// Type-erased, identity-compared entity handle.
#[derive(Clone)]
pub struct AnyEntity(Arc<EntityCell>);

impl AnyEntity {
    pub(crate) fn new(
        entity_type: Arc<EntityType>,
        value: Box<dyn Any + Send + Sync>,
        tracker: &Arc<ChangeTracker>,
    ) -> Self {
        Self(Arc::new(EntityCell {
            id: EntityId::next(),
            entity_type,
            value: RwLock::new(value),
            tracker: Arc::downgrade(tracker),
        }))
    }

    pub fn id(&self) -> EntityId {
        self.0.id
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.0.entity_type
    }

    pub fn tag(&self) -> TypeTag {
        self.0.entity_type.tag()
    }

    /// Typed view of this entity, if it is a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Handle<T>> {
        (self.tag() == TypeTag::of::<T>()).then(|| Handle {
            entity: self.clone(),
            _type: PhantomData,
        })
    }

    /// Read an attribute by name.
    pub fn get(&self, attribute: &str) -> OrmResult<Field> {
        let attribute = self.0.entity_type.resolve(attribute)?;
        Ok(self.read_field(attribute))
    }

    /// Write an attribute by name and report the change.
    pub fn set(&self, attribute: &str, field: Field) -> OrmResult<()> {
        let resolved = self.0.entity_type.resolve(attribute)?;
        self.write_field(resolved, field)?;
        self.notify(Some(attribute));
        Ok(())
    }

    pub(crate) fn read_field(&self, attribute: &Attribute) -> Field {
        let guard = self.0.value.read().expect("lock poisoned");
        attribute.read(&**guard)
    }

    /// Write without reporting a change (materialization from the store).
    pub(crate) fn write_field(&self, attribute: &Attribute, field: Field) -> OrmResult<()> {
        let mut guard = self.0.value.write().expect("lock poisoned");
        attribute.write(self.0.entity_type.name(), &mut **guard, field)
    }

    pub(crate) fn notify(&self, attribute: Option<&str>) {
        if let Some(tracker) = self.0.tracker.upgrade() {
            tracker.record(self, attribute);
        }
    }

    /// Whether writes to this entity are reported to `tracker`.
    pub(crate) fn is_tracked_by(&self, tracker: &Arc<ChangeTracker>) -> bool {
        std::ptr::eq(self.0.tracker.as_ptr(), Arc::as_ptr(tracker))
    }
}

impl PartialEq for AnyEntity {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for AnyEntity {}

impl Hash for AnyEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0.entity_type.name(), self.0.id)
    }
}

impl fmt::Display for AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed handle to a managed entity of type `T`.
///
/// Reads go through [`read`](Self::read) or [`get`](Self::get); every write
/// ([`set`](Self::set), [`link`](Self::link), [`update`](Self::update)) is
/// observed by the owning manager, which marks the entity dirty. Do not touch
/// the same handle again from inside a `read`/`update` closure: the entity is
/// locked for the duration of the closure.
pub struct Handle<T> {
    entity: AnyEntity,
    _type: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Handle<T> {
    pub fn id(&self) -> EntityId {
        self.entity.id()
    }

    pub fn as_any(&self) -> &AnyEntity {
        &self.entity
    }

    pub fn into_any(self) -> AnyEntity {
        self.entity
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        self.entity.entity_type()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.entity.0.value.read().expect("lock poisoned");
        let value = (**guard)
            .downcast_ref::<T>()
            .expect("handle type matches entity cell");
        f(value)
    }

    /// Mutate the entity in place. The whole entity is reported as changed.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut guard = self.entity.0.value.write().expect("lock poisoned");
            let value = (**guard)
                .downcast_mut::<T>()
                .expect("handle type matches entity cell");
            f(value)
        };
        self.entity.notify(None);
        result
    }

    /// Read a non-association attribute by name.
    pub fn get(&self, attribute: &str) -> OrmResult<Value> {
        match self.entity.get(attribute)? {
            Field::Value(value) => Ok(value),
            Field::Reference(_) => Err(OrmError::TypeMismatch {
                entity: self.entity.entity_type().name().to_string(),
                attribute: attribute.to_string(),
                expected: "value",
                found: "entity",
            }),
        }
    }

    /// Read an association by name.
    pub fn get_link(&self, attribute: &str) -> OrmResult<Option<AnyEntity>> {
        match self.entity.get(attribute)? {
            Field::Reference(target) => Ok(target),
            Field::Value(value) => Err(OrmError::TypeMismatch {
                entity: self.entity.entity_type().name().to_string(),
                attribute: attribute.to_string(),
                expected: "entity",
                found: value.kind(),
            }),
        }
    }

    /// Write a non-association attribute by name.
    pub fn set(&self, attribute: &str, value: impl Into<Value>) -> OrmResult<()> {
        self.entity.set(attribute, Field::Value(value.into()))
    }

    /// Point an association at `target` (or clear it).
    pub fn link<U: Send + Sync + 'static>(
        &self,
        attribute: &str,
        target: Option<&Handle<U>>,
    ) -> OrmResult<()> {
        let target = target.map(|h| h.as_any().clone());
        self.entity.set(attribute, Field::Reference(target))
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:?})", self.entity)
    }
}
