//! Shared test domain: authors, books and people.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cairn_store::{InMemoryNodeStore, NodeStore, StoreError, StoreResult};
use cairn_types::{Key, Node, Value};

use crate::config::ManagerConfig;
use crate::entity::{AnyEntity, Handle};
use crate::manager::Manager;
use crate::meta::{BasicType, EntityType, Metamodel};
use crate::tracker::ChangeTracker;

#[derive(Debug, Default)]
pub struct Author {
    pub firstname: String,
    pub lastname: String,
}

impl Author {
    pub fn new(firstname: &str, lastname: &str) -> Self {
        Self {
            firstname: firstname.to_string(),
            lastname: lastname.to_string(),
        }
    }

    /// "Last, First", or whichever half is present.
    pub fn fullname(&self) -> String {
        match (self.firstname.is_empty(), self.lastname.is_empty()) {
            (false, false) => format!("{}, {}", self.lastname, self.firstname),
            (true, _) => self.lastname.clone(),
            (false, true) => self.firstname.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Book {
    pub title: String,
    pub author: Option<Handle<Author>>,
}

impl Book {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            author: None,
        }
    }
}

/// Self-referencing type, for cycle detection.
#[derive(Debug, Default)]
pub struct Person {
    pub name: String,
    pub partner: Option<Handle<Person>>,
}

impl Person {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            partner: None,
        }
    }
}

pub fn author_type() -> EntityType {
    EntityType::builder::<Author>("Author")
        .field("firstname", |a| &a.firstname, |a| &mut a.firstname)
        .field("lastname", |a| &a.lastname, |a| &mut a.lastname)
        .derived("fullname", BasicType::Text, |a| Value::from(a.fullname()))
        .natural_key()
        .build()
}

pub fn book_type() -> EntityType {
    EntityType::builder::<Book>("Book")
        .field("title", |b| &b.title, |b| &mut b.title)
        .association("author", |b| &b.author, |b| &mut b.author)
        .build()
}

pub fn person_type() -> EntityType {
    EntityType::builder::<Person>("Person")
        .field("name", |p| &p.name, |p| &mut p.name)
        .association("partner", |p| &p.partner, |p| &mut p.partner)
        .build()
}

pub fn metamodel() -> Arc<Metamodel> {
    Arc::new(Metamodel::new([author_type(), book_type(), person_type()]).unwrap())
}

pub fn manager() -> Manager {
    manager_with(Arc::new(InMemoryNodeStore::new()), ManagerConfig::default())
}

pub fn manager_with(store: Arc<dyn NodeStore>, config: ManagerConfig) -> Manager {
    Manager::with_config(metamodel(), store, config)
}

/// An entity outside any manager, reporting writes to `tracker`.
pub fn new_entity<T: Send + Sync + 'static>(
    entity_type: EntityType,
    value: T,
    tracker: &Arc<ChangeTracker>,
) -> Handle<T> {
    AnyEntity::new(Arc::new(entity_type), Box::new(value), tracker)
        .downcast::<T>()
        .unwrap()
}

/// In-memory store whose `put` starts failing after a number of successes.
pub struct FlakyStore {
    inner: InMemoryNodeStore,
    remaining: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_after(successes: usize) -> Self {
        Self {
            inner: InMemoryNodeStore::new(),
            remaining: AtomicUsize::new(successes),
        }
    }

    pub fn recover(&self) {
        self.remaining.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeStore for FlakyStore {
    async fn put(&self, node: &Node) -> StoreResult<Key> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StoreError::Unavailable("injected put failure".into()));
        }
        self.inner.put(node).await
    }

    async fn get(&self, key: &Key) -> StoreResult<Node> {
        self.inner.get(key).await
    }
}

#[test]
fn fullname_falls_back_to_present_half() {
    assert_eq!(Author::new("Douglas", "Adams").fullname(), "Adams, Douglas");
    assert_eq!(Author::new("", "Adams").fullname(), "Adams");
    assert_eq!(Author::new("Douglas", "").fullname(), "Douglas");
}
