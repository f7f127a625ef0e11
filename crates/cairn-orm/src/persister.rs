//! Per-type entity lifecycle and flush.
//!
//! A [`Persister`] tracks every entity of one type that the current
//! transaction knows about, in insertion order, together with its
//! [`EntityState`]. Flushing an entity turns it into a [`Node`], writes it to
//! the store and records the resulting key in the transaction's overlay
//! cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cairn_store::NodeStore;
use cairn_types::{Key, Node, Value};
use tracing::{debug, trace, warn};

use crate::cache::{Cache, CacheView};
use crate::entity::{AnyEntity, EntityId, Field};
use crate::error::{OrmError, OrmResult};
use crate::meta::EntityType;

/// Lifecycle state of a tracked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Matches its stored node.
    Loaded,
    /// New, never written.
    Created,
    /// Written before, mutated since.
    Changed,
    /// Marked for removal.
    Removed,
}

impl EntityState {
    /// Whether the transition table allows `from -> to`.
    pub fn can_transition(from: Option<EntityState>, to: EntityState) -> bool {
        use EntityState::*;
        matches!(
            (from, to),
            (None, Created)
                | (None, Loaded)
                | (Some(Created | Changed), Loaded)
                | (Some(Loaded | Created), Changed)
                | (Some(Loaded | Created | Changed), Removed)
        )
    }

    /// Has work for the next flush.
    pub fn is_pending(self) -> bool {
        self != EntityState::Loaded
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Loaded => "LOADED",
            Self::Created => "CREATED",
            Self::Changed => "CHANGED",
            Self::Removed => "REMOVED",
        };
        f.write_str(label)
    }
}

/// What flushing one entity did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Unchanged,
    Inserted(Key),
    Updated { old: Option<Key>, new: Key },
    /// Removed; carries the key it was last known under, if any.
    Removed(Option<Key>),
}

/// Where a flush writes to.
pub struct FlushTarget<'a> {
    pub store: &'a dyn NodeStore,
    /// The transaction's overlay cache.
    pub overlay: &'a mut Cache,
    /// The committed cache the overlay shadows.
    pub committed: Option<&'a Cache>,
    pub delete_removed_nodes: bool,
}

impl FlushTarget<'_> {
    fn view(&self) -> CacheView<'_> {
        CacheView::new(&*self.overlay, self.committed)
    }

    /// Whether `entity` is what a lookup of `key` returns. Sharers of a key
    /// must not evict it from under its holder.
    fn holds(&self, entity: &AnyEntity, key: &Key) -> bool {
        self.view().entity(entity.tag(), key).as_ref() == Some(entity)
    }
}

struct Tracked {
    entity: AnyEntity,
    state: EntityState,
}

/// Lifecycle bookkeeping for all tracked entities of one type.
pub struct Persister {
    entity_type: Arc<EntityType>,
    order: Vec<EntityId>,
    tracked: HashMap<EntityId, Tracked>,
}

impl Persister {
    pub fn new(entity_type: Arc<EntityType>) -> Self {
        Self {
            entity_type,
            order: Vec::new(),
            tracked: HashMap::new(),
        }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn state(&self, entity: &AnyEntity) -> Option<EntityState> {
        self.tracked.get(&entity.id()).map(|t| t.state)
    }

    pub fn contains(&self, entity: &AnyEntity) -> bool {
        self.tracked.contains_key(&entity.id())
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Tracked entities and their states, in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = (&AnyEntity, EntityState)> {
        self.order
            .iter()
            .filter_map(|id| self.tracked.get(id))
            .map(|t| (&t.entity, t.state))
    }

    /// Entities with work for the next flush, in insertion order.
    pub fn pending(&self) -> Vec<(AnyEntity, EntityState)> {
        self.entities()
            .filter(|(_, state)| state.is_pending())
            .map(|(entity, state)| (entity.clone(), state))
            .collect()
    }

    fn transition(&mut self, entity: &AnyEntity, to: EntityState) -> OrmResult<()> {
        let from = self.state(entity);
        if !EntityState::can_transition(from, to) {
            return Err(OrmError::IllegalStateTransition {
                entity: entity.to_string(),
                from,
                to,
            });
        }
        match self.tracked.get_mut(&entity.id()) {
            Some(tracked) => tracked.state = to,
            None => {
                self.order.push(entity.id());
                self.tracked.insert(
                    entity.id(),
                    Tracked {
                        entity: entity.clone(),
                        state: to,
                    },
                );
            }
        }
        debug!(entity = %entity, from = ?from, to = %to, "state transition");
        Ok(())
    }

    /// Start tracking a new entity as `CREATED`.
    pub fn persist(&mut self, entity: &AnyEntity) -> OrmResult<()> {
        self.transition(entity, EntityState::Created)
    }

    /// Start tracking an entity that matches its stored node.
    pub fn track_loaded(&mut self, entity: &AnyEntity) -> OrmResult<()> {
        self.transition(entity, EntityState::Loaded)
    }

    /// Record an attribute write. Returns whether the state changed.
    ///
    /// `LOADED` becomes `CHANGED`; `CREATED` and `CHANGED` stay put. Writes
    /// to a `REMOVED` entity are ignored.
    pub fn mark_changed(&mut self, entity: &AnyEntity) -> OrmResult<bool> {
        match self.state(entity) {
            Some(EntityState::Loaded) => {
                self.transition(entity, EntityState::Changed)?;
                Ok(true)
            }
            Some(EntityState::Created | EntityState::Changed) => Ok(false),
            Some(EntityState::Removed) => {
                warn!(entity = %entity, "write to removed entity ignored");
                Ok(false)
            }
            None => Err(OrmError::IllegalStateTransition {
                entity: entity.to_string(),
                from: None,
                to: EntityState::Changed,
            }),
        }
    }

    /// Mark a tracked entity for removal.
    pub fn remove(&mut self, entity: &AnyEntity) -> OrmResult<()> {
        self.transition(entity, EntityState::Removed)
    }

    /// Stop tracking without touching the store.
    pub fn detach(&mut self, entity: &AnyEntity) -> Option<EntityState> {
        let tracked = self.tracked.remove(&entity.id())?;
        self.order.retain(|id| *id != entity.id());
        trace!(entity = %entity, state = %tracked.state, "detached");
        Some(tracked.state)
    }

    /// Flush one tracked entity.
    ///
    /// On error the entity keeps its state, so the step can be retried.
    pub async fn flush_entity(
        &mut self,
        entity: &AnyEntity,
        target: &mut FlushTarget<'_>,
    ) -> OrmResult<FlushOutcome> {
        let state = self
            .state(entity)
            .ok_or_else(|| OrmError::NotManaged(entity.to_string()))?;
        let tag = self.entity_type.tag();

        match state {
            EntityState::Loaded => Ok(FlushOutcome::Unchanged),
            EntityState::Created => {
                let node = to_node(entity, target.view())?;
                let key = target.store.put(&node).await?;
                target.overlay.set(entity, key);
                self.transition(entity, EntityState::Loaded)?;
                debug!(entity = %entity, key = %key.short_hex(), "inserted");
                Ok(FlushOutcome::Inserted(key))
            }
            EntityState::Changed => {
                let old = target.view().key(entity);
                let node = to_node(entity, target.view())?;
                let new = target.store.put(&node).await?;
                if let Some(old) = old.filter(|old| *old != new) {
                    if target.holds(entity, &old) {
                        target.overlay.evict_key(tag, &old);
                    }
                }
                target.overlay.set(entity, new);
                self.transition(entity, EntityState::Loaded)?;
                debug!(
                    entity = %entity,
                    old = ?old.map(|k| k.short_hex()),
                    new = %new.short_hex(),
                    "updated"
                );
                Ok(FlushOutcome::Updated { old, new })
            }
            EntityState::Removed => {
                let key = target.view().key(entity);
                if let Some(key) = key.filter(|key| target.holds(entity, key)) {
                    if target.delete_removed_nodes && !target.view().is_shared(tag, &key) {
                        target.store.delete(&key).await?;
                    }
                    target.overlay.evict_key(tag, &key);
                }
                target.overlay.evict_entity(entity);
                self.detach(entity);
                debug!(entity = %entity, key = ?key.map(|k| k.short_hex()), "removed");
                Ok(FlushOutcome::Removed(key))
            }
        }
    }

    /// Flush every pending entity in insertion order, stopping at the first
    /// failure.
    pub async fn flush(&mut self, target: &mut FlushTarget<'_>) -> OrmResult<Vec<FlushOutcome>> {
        let mut outcomes = Vec::new();
        for (entity, _) in self.pending() {
            outcomes.push(self.flush_entity(&entity, target).await?);
        }
        Ok(outcomes)
    }
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("entity_type", &self.entity_type.name())
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

/// Serialize an entity to its stored form.
///
/// Stored attributes appear in declaration order. An association is written
/// as the key of its target, which must be resolvable through `view`.
pub fn to_node(entity: &AnyEntity, view: CacheView<'_>) -> OrmResult<Node> {
    let entity_type = entity.entity_type();
    let mut node = Node::new();
    for attribute in entity_type.attributes().filter(|a| a.is_stored()) {
        let value = match entity.read_field(attribute) {
            Field::Value(value) => value,
            Field::Reference(None) => Value::Null,
            Field::Reference(Some(target)) => match view.key(&target) {
                Some(key) => Value::Link(key),
                None => {
                    return Err(OrmError::UnresolvedAssociation {
                        entity: entity.to_string(),
                        attribute: attribute.name().to_string(),
                        target: target.to_string(),
                    })
                }
            },
        };
        node.insert(attribute.name(), value);
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use cairn_store::InMemoryNodeStore;

    use super::*;
    use crate::fixtures::{author_type, book_type, Author, Book, FlakyStore};
    use crate::tracker::ChangeTracker;

    struct Fixture {
        tracker: Arc<ChangeTracker>,
        authors: Arc<EntityType>,
        books: Arc<EntityType>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tracker: ChangeTracker::new(),
                authors: Arc::new(author_type()),
                books: Arc::new(book_type()),
            }
        }

        fn author(&self, first: &str, last: &str) -> AnyEntity {
            AnyEntity::new(
                self.authors.clone(),
                Box::new(Author::new(first, last)),
                &self.tracker,
            )
        }

        fn book(&self, title: &str, author: Option<&AnyEntity>) -> AnyEntity {
            let book = AnyEntity::new(self.books.clone(), Box::new(Book::default()), &self.tracker);
            book.write_field(
                self.books.attribute("title").unwrap(),
                Field::Value(Value::from(title)),
            )
            .unwrap();
            book.write_field(
                self.books.attribute("author").unwrap(),
                Field::Reference(author.cloned()),
            )
            .unwrap();
            book
        }
    }

    fn target<'a>(store: &'a dyn NodeStore, overlay: &'a mut Cache) -> FlushTarget<'a> {
        FlushTarget {
            store,
            overlay,
            committed: None,
            delete_removed_nodes: false,
        }
    }

    #[test]
    fn transition_table() {
        use EntityState::*;
        let legal = [
            (None, Created),
            (None, Loaded),
            (Some(Created), Loaded),
            (Some(Changed), Loaded),
            (Some(Loaded), Changed),
            (Some(Created), Changed),
            (Some(Loaded), Removed),
            (Some(Created), Removed),
            (Some(Changed), Removed),
        ];
        for from in [None, Some(Loaded), Some(Created), Some(Changed), Some(Removed)] {
            for to in [Loaded, Created, Changed, Removed] {
                assert_eq!(
                    EntityState::can_transition(from, to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to}"
                );
            }
        }
    }

    #[test]
    fn persist_twice_is_illegal() {
        let fx = Fixture::new();
        let mut persister = Persister::new(fx.authors.clone());
        let author = fx.author("Douglas", "Adams");
        persister.persist(&author).unwrap();
        let err = persister.persist(&author).unwrap_err();
        assert!(matches!(
            err,
            OrmError::IllegalStateTransition {
                from: Some(EntityState::Created),
                to: EntityState::Created,
                ..
            }
        ));
        assert!(err.to_string().contains("CREATED -> CREATED"));
    }

    #[test]
    fn remove_untracked_is_illegal() {
        let fx = Fixture::new();
        let mut persister = Persister::new(fx.authors.clone());
        let err = persister.remove(&fx.author("a", "b")).unwrap_err();
        assert!(err.to_string().contains("untracked -> REMOVED"));
    }

    #[test]
    fn mark_changed_promotes_only_loaded() {
        let fx = Fixture::new();
        let mut persister = Persister::new(fx.authors.clone());
        let created = fx.author("a", "b");
        let loaded = fx.author("c", "d");
        let removed = fx.author("e", "f");
        persister.persist(&created).unwrap();
        persister.track_loaded(&loaded).unwrap();
        persister.track_loaded(&removed).unwrap();
        persister.remove(&removed).unwrap();

        assert!(!persister.mark_changed(&created).unwrap());
        assert_eq!(persister.state(&created), Some(EntityState::Created));
        assert!(persister.mark_changed(&loaded).unwrap());
        assert!(!persister.mark_changed(&loaded).unwrap());
        assert_eq!(persister.state(&loaded), Some(EntityState::Changed));
        assert!(!persister.mark_changed(&removed).unwrap());
        assert_eq!(persister.state(&removed), Some(EntityState::Removed));
        assert!(persister.mark_changed(&fx.author("g", "h")).is_err());
    }

    #[test]
    fn pending_keeps_insertion_order() {
        let fx = Fixture::new();
        let mut persister = Persister::new(fx.authors.clone());
        let a = fx.author("a", "a");
        let b = fx.author("b", "b");
        let c = fx.author("c", "c");
        persister.persist(&a).unwrap();
        persister.track_loaded(&b).unwrap();
        persister.persist(&c).unwrap();
        let pending: Vec<AnyEntity> = persister.pending().into_iter().map(|(e, _)| e).collect();
        assert_eq!(pending, vec![a.clone(), c.clone()]);

        assert_eq!(persister.detach(&a), Some(EntityState::Created));
        assert!(!persister.contains(&a));
        assert_eq!(persister.len(), 2);
        assert_eq!(persister.detach(&a), None);
    }

    #[test]
    fn to_node_writes_stored_attributes_in_order() {
        let fx = Fixture::new();
        let author = fx.author("Douglas", "Adams");
        let cache = Cache::new();
        let node = to_node(&author, CacheView::root(&cache)).unwrap();
        let names: Vec<&str> = node.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["firstname", "lastname"]);
        assert_eq!(node.get("firstname"), Some(&Value::from("Douglas")));
    }

    #[test]
    fn to_node_links_known_targets() {
        let fx = Fixture::new();
        let author = fx.author("Douglas", "Adams");
        let book = fx.book("Hitchhiker", Some(&author));
        let orphan = fx.book("Untitled", None);
        let mut cache = Cache::new();

        let err = to_node(&book, CacheView::root(&cache)).unwrap_err();
        assert!(matches!(err, OrmError::UnresolvedAssociation { attribute, .. } if attribute == "author"));

        let key = Key::from_hash([7; 32]);
        cache.set(&author, key);
        let node = to_node(&book, CacheView::root(&cache)).unwrap();
        assert_eq!(node.get("author"), Some(&Value::Link(key)));
        assert_eq!(
            to_node(&orphan, CacheView::root(&cache)).unwrap().get("author"),
            Some(&Value::Null)
        );
    }

    #[tokio::test]
    async fn flush_inserts_then_becomes_loaded() {
        let fx = Fixture::new();
        let store = InMemoryNodeStore::new();
        let mut overlay = Cache::new();
        let mut persister = Persister::new(fx.authors.clone());
        let author = fx.author("Douglas", "Adams");
        persister.persist(&author).unwrap();

        let outcomes = persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        let FlushOutcome::Inserted(key) = outcomes[0] else {
            panic!("expected insert, got {outcomes:?}");
        };
        assert_eq!(overlay.key(&author), Some(key));
        assert_eq!(persister.state(&author), Some(EntityState::Loaded));
        assert_eq!(store.len(), 1);

        // Nothing left to do: never flushed twice from CREATED.
        let again = persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn flush_update_rekeys_and_evicts_old_key() {
        let fx = Fixture::new();
        let store = InMemoryNodeStore::new();
        let mut overlay = Cache::new();
        let mut persister = Persister::new(fx.authors.clone());
        let author = fx.author("Douglas", "Adams");
        persister.persist(&author).unwrap();
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        let old = overlay.key(&author).unwrap();

        author
            .write_field(
                fx.authors.attribute("firstname").unwrap(),
                Field::Value(Value::from("Doug")),
            )
            .unwrap();
        persister.mark_changed(&author).unwrap();
        let outcome = persister
            .flush_entity(&author, &mut target(&store, &mut overlay))
            .await
            .unwrap();
        let FlushOutcome::Updated { old: Some(prev), new } = outcome else {
            panic!("expected update, got {outcome:?}");
        };
        assert_eq!(prev, old);
        assert_ne!(new, old);
        assert_eq!(overlay.key(&author), Some(new));
        assert!(overlay.entity(fx.authors.tag(), &old).is_none());
        assert!(overlay.layer(fx.authors.tag()).unwrap().is_evicted_key(&old));
    }

    #[tokio::test]
    async fn flush_remove_invalidates_and_optionally_deletes() {
        let fx = Fixture::new();
        let store = InMemoryNodeStore::new();
        let mut overlay = Cache::new();
        let mut persister = Persister::new(fx.authors.clone());
        let kept = fx.author("a", "b");
        let deleted = fx.author("c", "d");
        for author in [&kept, &deleted] {
            persister.persist(author).unwrap();
        }
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        let kept_key = overlay.key(&kept).unwrap();
        let deleted_key = overlay.key(&deleted).unwrap();

        persister.remove(&kept).unwrap();
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        assert!(!persister.contains(&kept));
        assert!(overlay.key(&kept).is_none());
        assert!(store.contains(&kept_key).await.unwrap());

        persister.remove(&deleted).unwrap();
        let mut deleting = target(&store, &mut overlay);
        deleting.delete_removed_nodes = true;
        let outcomes = persister.flush(&mut deleting).await.unwrap();
        assert_eq!(outcomes, vec![FlushOutcome::Removed(Some(deleted_key))]);
        assert!(!store.contains(&deleted_key).await.unwrap());
    }

    #[tokio::test]
    async fn identical_entities_share_a_key() {
        let fx = Fixture::new();
        let store = InMemoryNodeStore::new();
        let mut overlay = Cache::new();
        let mut persister = Persister::new(fx.authors.clone());
        let first = fx.author("Douglas", "Adams");
        let second = fx.author("Douglas", "Adams");
        persister.persist(&first).unwrap();
        persister.persist(&second).unwrap();
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();

        let key = overlay.key(&first).unwrap();
        assert_eq!(overlay.key(&second), Some(key));
        assert_eq!(store.len(), 1);
        let book = fx.book("Hitchhiker", Some(&first));
        let node = to_node(&book, CacheView::root(&overlay)).unwrap();
        assert_eq!(node.get("author"), Some(&Value::Link(key)));

        // Re-keying the sharer leaves the holder bound.
        first
            .write_field(
                fx.authors.attribute("firstname").unwrap(),
                Field::Value(Value::from("Doug")),
            )
            .unwrap();
        persister.mark_changed(&first).unwrap();
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        assert_ne!(overlay.key(&first), Some(key));
        assert_eq!(overlay.entity(fx.authors.tag(), &key), Some(&second));
    }

    #[tokio::test]
    async fn removing_one_of_identical_entities_keeps_the_node() {
        let fx = Fixture::new();
        let store = InMemoryNodeStore::new();
        let mut overlay = Cache::new();
        let mut persister = Persister::new(fx.authors.clone());
        let first = fx.author("Douglas", "Adams");
        let second = fx.author("Douglas", "Adams");
        persister.persist(&first).unwrap();
        persister.persist(&second).unwrap();
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        let key = overlay.key(&second).unwrap();

        persister.remove(&second).unwrap();
        let mut deleting = target(&store, &mut overlay);
        deleting.delete_removed_nodes = true;
        persister.flush(&mut deleting).await.unwrap();
        assert!(store.contains(&key).await.unwrap());
        assert_eq!(overlay.key(&first), Some(key));
        assert!(overlay.key(&second).is_none());
    }

    #[tokio::test]
    async fn failed_put_keeps_state_for_retry() {
        let fx = Fixture::new();
        let store = FlakyStore::failing_after(0);
        let mut overlay = Cache::new();
        let mut persister = Persister::new(fx.authors.clone());
        let author = fx.author("Douglas", "Adams");
        persister.persist(&author).unwrap();

        let err = persister
            .flush(&mut target(&store, &mut overlay))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Store(_)));
        assert_eq!(persister.state(&author), Some(EntityState::Created));
        assert!(overlay.is_empty());

        store.recover();
        persister.flush(&mut target(&store, &mut overlay)).await.unwrap();
        assert_eq!(persister.state(&author), Some(EntityState::Loaded));
    }
}
