//! The metamodel: a static registry describing every entity type the mapper
//! may handle.
//!
//! An [`EntityType`] lists the attributes of one Rust struct together with an
//! accessor table (typed getter/setter closures built from field lenses), so
//! the mapper can read and write attributes by name without reflection. The
//! [`Metamodel`] indexes entity types by [`TypeTag`] and is read-only once
//! built.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use cairn_types::{Key, Value, ValueKindError};

use crate::entity::{AnyEntity, Field, Handle};
use crate::error::{OrmError, OrmResult};

/// Statically declared identity of a Rust entity type.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Fully qualified Rust type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.name)
    }
}

/// Primitive storage type of a non-association attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicType {
    Bool,
    Integer,
    Float,
    Text,
    Key,
}

impl BasicType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Key => "link",
        }
    }
}

/// Target type of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Basic(BasicType),
    Entity(TypeTag),
}

/// A Rust type that can back a non-association attribute.
pub trait FieldValue: Sized + Send + Sync + 'static {
    const BASIC: BasicType;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self, ValueKindError>;
}

macro_rules! field_value {
    ($ty:ty, $basic:expr) => {
        impl FieldValue for $ty {
            const BASIC: BasicType = $basic;

            fn to_value(&self) -> Value {
                Value::from(self.clone())
            }

            fn from_value(value: Value) -> Result<Self, ValueKindError> {
                Self::try_from(value)
            }
        }
    };
}

field_value!(bool, BasicType::Bool);
field_value!(i64, BasicType::Integer);
field_value!(f64, BasicType::Float);
field_value!(String, BasicType::Text);
field_value!(Key, BasicType::Key);

impl<T: FieldValue> FieldValue for Option<T> {
    const BASIC: BasicType = T::BASIC;

    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, FieldValue::to_value)
    }

    fn from_value(value: Value) -> Result<Self, ValueKindError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

type Getter = Arc<dyn Fn(&dyn Any) -> Field + Send + Sync>;
type Setter = Arc<dyn Fn(&mut dyn Any, Field) -> Result<(), ValueKindError> + Send + Sync>;

/// One attribute of an entity type, with its accessors.
#[derive(Clone)]
pub struct Attribute {
    name: String,
    target: Type,
    association: bool,
    key: bool,
    get: Getter,
    set: Option<Setter>,
}

impl Attribute {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Type {
        self.target
    }

    /// The value is another entity, stored as a link to its key.
    pub fn is_association(&self) -> bool {
        self.association
    }

    /// Usable for natural-key lookups.
    pub fn is_key(&self) -> bool {
        self.key
    }

    /// Part of the stored node. Derived attributes are not.
    pub fn is_stored(&self) -> bool {
        self.set.is_some()
    }

    pub(crate) fn read(&self, value: &dyn Any) -> Field {
        (self.get)(value)
    }

    pub(crate) fn write(&self, entity: &str, value: &mut dyn Any, field: Field) -> OrmResult<()> {
        let Some(set) = &self.set else {
            return Err(OrmError::ReadOnlyAttribute {
                entity: entity.to_string(),
                attribute: self.name.clone(),
            });
        };
        set(value, field).map_err(|e| OrmError::TypeMismatch {
            entity: entity.to_string(),
            attribute: self.name.clone(),
            expected: e.expected,
            found: e.found,
        })
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("association", &self.association)
            .field("key", &self.key)
            .field("stored", &self.is_stored())
            .finish()
    }
}

/// Describes one domain struct: its attributes and how to build a blank
/// instance when materializing from the store.
pub struct EntityType {
    name: &'static str,
    tag: TypeTag,
    attributes: Vec<Attribute>,
    factory: fn() -> Box<dyn Any + Send + Sync>,
}

impl EntityType {
    /// Start declaring the entity type backed by `T`.
    pub fn builder<T: Default + Send + Sync + 'static>(name: &'static str) -> EntityTypeBuilder<T> {
        EntityTypeBuilder {
            name,
            attributes: Vec::new(),
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Resolve an attribute or fail with [`OrmError::UnknownAttribute`].
    pub fn resolve(&self, name: &str) -> OrmResult<&Attribute> {
        self.attribute(name).ok_or_else(|| OrmError::UnknownAttribute {
            entity: self.name.to_string(),
            attribute: name.to_string(),
        })
    }

    pub fn associations(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.association)
    }

    pub fn has_associations(&self) -> bool {
        self.attributes.iter().any(|a| a.association)
    }

    pub fn key_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.key)
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Any + Send + Sync> {
        (self.factory)()
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Declares the attributes of an [`EntityType`] through field lenses.
///
/// ```ignore
/// EntityType::builder::<Book>("Book")
///     .field("title", |b| &b.title, |b| &mut b.title)
///     .association("author", |b| &b.author, |b| &mut b.author)
///     .build()
/// ```
pub struct EntityTypeBuilder<T> {
    name: &'static str,
    attributes: Vec<Attribute>,
    _type: PhantomData<fn() -> T>,
}

fn instantiate<T: Default + Send + Sync + 'static>() -> Box<dyn Any + Send + Sync> {
    Box::new(T::default())
}

fn downcast<T: 'static>(value: &dyn Any) -> &T {
    value
        .downcast_ref::<T>()
        .expect("entity cell holds its declared type")
}

fn downcast_mut<T: 'static>(value: &mut dyn Any) -> &mut T {
    value
        .downcast_mut::<T>()
        .expect("entity cell holds its declared type")
}

impl<T: Default + Send + Sync + 'static> EntityTypeBuilder<T> {
    /// A stored primitive attribute.
    pub fn field<F: FieldValue>(
        mut self,
        name: &str,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> Self {
        self.attributes.push(Attribute {
            name: name.to_string(),
            target: Type::Basic(F::BASIC),
            association: false,
            key: false,
            get: Arc::new(move |v: &dyn Any| Field::Value(get(downcast::<T>(v)).to_value())),
            set: Some(Arc::new(move |v: &mut dyn Any, field: Field| {
                let value = match field {
                    Field::Value(value) => value,
                    Field::Reference(_) => {
                        return Err(ValueKindError {
                            expected: F::BASIC.name(),
                            found: "entity",
                        })
                    }
                };
                *get_mut(downcast_mut::<T>(v)) = F::from_value(value)?;
                Ok(())
            })),
        });
        self
    }

    /// A reference to another entity, stored as the target's key.
    pub fn association<U: Send + Sync + 'static>(
        mut self,
        name: &str,
        get: fn(&T) -> &Option<Handle<U>>,
        get_mut: fn(&mut T) -> &mut Option<Handle<U>>,
    ) -> Self {
        self.attributes.push(Attribute {
            name: name.to_string(),
            target: Type::Entity(TypeTag::of::<U>()),
            association: true,
            key: false,
            get: Arc::new(move |v: &dyn Any| {
                Field::Reference(get(downcast::<T>(v)).as_ref().map(|h| h.as_any().clone()))
            }),
            set: Some(Arc::new(move |v: &mut dyn Any, field: Field| {
                let handle = match field {
                    Field::Reference(None) | Field::Value(Value::Null) => None,
                    Field::Reference(Some(entity)) => {
                        let found = entity.entity_type().name();
                        Some(entity.downcast::<U>().ok_or(ValueKindError {
                            expected: std::any::type_name::<U>(),
                            found,
                        })?)
                    }
                    Field::Value(other) => {
                        return Err(ValueKindError {
                            expected: std::any::type_name::<U>(),
                            found: other.kind(),
                        })
                    }
                };
                *get_mut(downcast_mut::<T>(v)) = handle;
                Ok(())
            })),
        });
        self
    }

    /// A read-only attribute computed from the others. Not stored, but
    /// usable as a natural key.
    pub fn derived(mut self, name: &str, basic: BasicType, compute: fn(&T) -> Value) -> Self {
        self.attributes.push(Attribute {
            name: name.to_string(),
            target: Type::Basic(basic),
            association: false,
            key: false,
            get: Arc::new(move |v: &dyn Any| Field::Value(compute(downcast::<T>(v)))),
            set: None,
        });
        self
    }

    /// Flag the most recently declared attribute as a natural key.
    pub fn natural_key(mut self) -> Self {
        if let Some(last) = self.attributes.last_mut() {
            last.key = true;
        }
        self
    }

    pub fn build(self) -> EntityType {
        EntityType {
            name: self.name,
            tag: TypeTag::of::<T>(),
            attributes: self.attributes,
            factory: instantiate::<T>,
        }
    }
}

/// Read-only registry of entity types, keyed by [`TypeTag`].
#[derive(Debug, Default)]
pub struct Metamodel {
    types: HashMap<TypeTag, Arc<EntityType>>,
    order: Vec<TypeTag>,
}

impl Metamodel {
    /// Build the registry from a closed set of entity types.
    ///
    /// Fails if a Rust type is registered twice or an association targets a
    /// type outside the set.
    pub fn new(entity_types: impl IntoIterator<Item = EntityType>) -> OrmResult<Self> {
        let mut types = HashMap::new();
        let mut order = Vec::new();
        for entity_type in entity_types {
            let tag = entity_type.tag();
            if types.contains_key(&tag) {
                return Err(OrmError::DuplicateType(entity_type.name().to_string()));
            }
            order.push(tag);
            types.insert(tag, Arc::new(entity_type));
        }
        for entity_type in types.values() {
            for attribute in entity_type.associations() {
                if let Type::Entity(target) = attribute.target() {
                    if !types.contains_key(&target) {
                        return Err(OrmError::UnknownType(target.name().to_string()));
                    }
                }
            }
        }
        Ok(Self { types, order })
    }

    /// The entity type registered for `T`.
    pub fn entity_type<T: 'static>(&self) -> OrmResult<&Arc<EntityType>> {
        self.by_tag(TypeTag::of::<T>())
    }

    pub fn by_tag(&self, tag: TypeTag) -> OrmResult<&Arc<EntityType>> {
        self.types
            .get(&tag)
            .ok_or_else(|| OrmError::UnknownType(tag.name().to_string()))
    }

    /// The entity type of a live entity, by its runtime tag.
    pub fn entity_type_of(&self, entity: &AnyEntity) -> OrmResult<&Arc<EntityType>> {
        self.by_tag(entity.tag())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.types.contains_key(&TypeTag::of::<T>())
    }

    /// Entity types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.order.iter().filter_map(|tag| self.types.get(tag))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{author_type, book_type, Author, Book};

    #[test]
    fn lookup_by_type() {
        let metamodel = Metamodel::new([author_type(), book_type()]).unwrap();
        assert_eq!(metamodel.len(), 2);
        assert_eq!(metamodel.entity_type::<Author>().unwrap().name(), "Author");
        assert_eq!(metamodel.entity_type::<Book>().unwrap().name(), "Book");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let metamodel = Metamodel::new([author_type(), book_type()]).unwrap();
        assert!(matches!(
            metamodel.entity_type::<String>(),
            Err(OrmError::UnknownType(name)) if name.contains("String")
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = Metamodel::new([author_type(), author_type()]);
        assert!(matches!(result, Err(OrmError::DuplicateType(name)) if name == "Author"));
    }

    #[test]
    fn association_target_must_be_registered() {
        let result = Metamodel::new([book_type()]);
        assert!(matches!(result, Err(OrmError::UnknownType(_))));
    }

    #[test]
    fn registration_order_is_kept() {
        let metamodel = Metamodel::new([book_type(), author_type()]).unwrap();
        let names: Vec<&str> = metamodel.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["Book", "Author"]);
    }

    #[test]
    fn attribute_flags() {
        let book = book_type();
        let author = book.attribute("author").unwrap();
        assert!(author.is_association());
        assert!(author.is_stored());
        assert_eq!(author.target(), Type::Entity(TypeTag::of::<Author>()));

        let authors = author_type();
        let fullname = authors.attribute("fullname").unwrap();
        assert!(fullname.is_key());
        assert!(!fullname.is_stored());
        assert_eq!(authors.key_attributes().count(), 1);
        assert_eq!(
            authors.attribute("firstname").unwrap().target(),
            Type::Basic(BasicType::Text)
        );
    }

    #[test]
    fn accessors_read_and_write_by_name() {
        let authors = author_type();
        let mut value = authors.instantiate();
        let first = authors.resolve("firstname").unwrap();
        first
            .write("Author", &mut *value, Field::Value(Value::from("Douglas")))
            .unwrap();
        assert_eq!(
            first.read(&*value),
            Field::Value(Value::from("Douglas"))
        );
    }

    #[test]
    fn write_with_wrong_kind_is_a_type_mismatch() {
        let authors = author_type();
        let mut value = authors.instantiate();
        let err = authors
            .resolve("lastname")
            .unwrap()
            .write("Author", &mut *value, Field::Value(Value::Integer(4)))
            .unwrap_err();
        assert!(matches!(
            err,
            OrmError::TypeMismatch { expected: "text", found: "integer", .. }
        ));
    }

    #[test]
    fn derived_attribute_is_read_only() {
        let authors = author_type();
        let mut value = authors.instantiate();
        let err = authors
            .resolve("fullname")
            .unwrap()
            .write("Author", &mut *value, Field::Value(Value::from("x")))
            .unwrap_err();
        assert!(matches!(err, OrmError::ReadOnlyAttribute { .. }));
    }

    #[test]
    fn resolve_unknown_attribute() {
        let err = author_type().resolve("nickname").unwrap_err();
        assert!(matches!(err, OrmError::UnknownAttribute { attribute, .. } if attribute == "nickname"));
    }

    #[test]
    fn optional_fields_map_null() {
        assert_eq!(None::<i64>.to_value(), Value::Null);
        assert_eq!(<Option<i64>>::from_value(Value::Null).unwrap(), None);
        assert_eq!(<Option<i64>>::from_value(Value::Integer(7)).unwrap(), Some(7));
        assert_eq!(<Option<String> as FieldValue>::BASIC, BasicType::Text);
    }
}
