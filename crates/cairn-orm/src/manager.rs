//! The mapper façade.
//!
//! A [`Manager`] hands out entity handles and commits their writes on
//! `flush`. Lookups go through its committed identity map.

use std::sync::Arc;

use cairn_store::NodeStore;
use cairn_types::{Key, Value};
use tracing::{debug, info};

use crate::cache::{Cache, CacheView};
use crate::config::ManagerConfig;
use crate::entity::{AnyEntity, Field, Handle};
use crate::error::{OrmError, OrmResult};
use crate::meta::{Metamodel, TypeTag};
use crate::persister::EntityState;
use crate::query::Query;
use crate::tracker::ChangeTracker;
use crate::transaction::{FlushSummary, Transaction};

/// Entry point for application code.
///
/// Owns the metamodel, the store, the committed identity map and at most one
/// active [`Transaction`], created on the first write and committed by
/// [`flush`](Self::flush). Entities handed out by the manager report their
/// writes to it; the reports are applied to the active transaction at the
/// start of every operation.
pub struct Manager {
    metamodel: Arc<Metamodel>,
    store: Arc<dyn NodeStore>,
    cache: Cache,
    tracker: Arc<ChangeTracker>,
    transaction: Option<Transaction>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(metamodel: Arc<Metamodel>, store: Arc<dyn NodeStore>) -> Self {
        Self::with_config(metamodel, store, ManagerConfig::default())
    }

    pub fn with_config(
        metamodel: Arc<Metamodel>,
        store: Arc<dyn NodeStore>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            metamodel,
            store,
            cache: Cache::new(),
            tracker: ChangeTracker::new(),
            transaction: None,
            config,
        }
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// The committed identity map.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Apply writes observed since the last operation to the active
    /// transaction. Returns how many entities became `CHANGED`.
    pub fn sync_changes(&mut self) -> OrmResult<usize> {
        let changes = self.tracker.drain();
        if changes.is_empty() {
            return Ok(0);
        }
        let mut changed = 0;
        for change in changes {
            if self.transaction.is_none() && self.cache.key(&change.entity).is_none() {
                continue;
            }
            let cache = &self.cache;
            let transaction = self.transaction.get_or_insert_with(start_transaction);
            if transaction.note_change(&change.entity, cache)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Start managing a new entity. It is written on the next flush.
    pub fn persist<T: Send + Sync + 'static>(&mut self, value: T) -> OrmResult<Handle<T>> {
        let entity_type = self.metamodel.entity_type::<T>()?.clone();
        let entity = AnyEntity::new(entity_type, Box::new(value), &self.tracker);
        self.persist_any(&entity)?;
        entity
            .downcast::<T>()
            .ok_or_else(|| OrmError::UnknownType(std::any::type_name::<T>().to_string()))
    }

    /// Manage an existing handle again, e.g. after a discard or detach.
    pub fn persist_handle<T: Send + Sync + 'static>(&mut self, handle: &Handle<T>) -> OrmResult<()> {
        self.persist_any(handle.as_any())
    }

    fn persist_any(&mut self, entity: &AnyEntity) -> OrmResult<()> {
        self.check_owned(entity)?;
        self.sync_changes()?;
        let cache = &self.cache;
        let transaction = self.transaction.get_or_insert_with(start_transaction);
        transaction.persist(entity, cache)
    }

    /// Mark an entity for removal on the next flush.
    pub fn remove<T: Send + Sync + 'static>(&mut self, handle: &Handle<T>) -> OrmResult<()> {
        self.remove_any(handle.as_any())
    }

    pub fn remove_any(&mut self, entity: &AnyEntity) -> OrmResult<()> {
        self.check_owned(entity)?;
        self.sync_changes()?;
        let cache = &self.cache;
        let transaction = self.transaction.get_or_insert_with(start_transaction);
        transaction.remove(entity, cache)
    }

    fn check_owned(&self, entity: &AnyEntity) -> OrmResult<()> {
        self.metamodel.entity_type_of(entity)?;
        if entity.is_tracked_by(&self.tracker) {
            Ok(())
        } else {
            Err(OrmError::NotManaged(entity.to_string()))
        }
    }

    /// Whether the entity is tracked and not marked for removal, or has a
    /// committed key.
    pub fn contains<T: Send + Sync + 'static>(&self, handle: &Handle<T>) -> bool {
        let entity = handle.as_any();
        match self.transaction.as_ref().and_then(|t| t.state(entity)) {
            Some(state) => state != EntityState::Removed,
            None => self.cache.key(entity).is_some(),
        }
    }

    /// Forget an entity without touching the store. Returns whether the
    /// manager knew it.
    pub fn detach<T: Send + Sync + 'static>(&mut self, handle: &Handle<T>) -> OrmResult<bool> {
        let entity = handle.as_any();
        self.sync_changes()?;
        let tracked = self
            .transaction
            .as_mut()
            .and_then(|t| t.detach(entity))
            .is_some();
        let cached = self.cache.remove_entity(entity).is_some();
        if tracked || cached {
            debug!(entity = %entity, "detached");
        }
        Ok(tracked || cached)
    }

    /// Commit the active transaction.
    ///
    /// On failure the work flushed so far stays committed and the
    /// transaction stays active; call `flush` again to resume or
    /// [`discard`](Self::discard) to drop the rest.
    pub async fn flush(&mut self) -> OrmResult<FlushSummary> {
        self.sync_changes()?;
        let Some(transaction) = self.transaction.as_mut() else {
            return Ok(FlushSummary::default());
        };
        let summary = transaction
            .commit(self.store.as_ref(), &mut self.cache, &self.config)
            .await?;
        self.transaction = None;
        Ok(summary)
    }

    /// Drop the active transaction without writing anything.
    ///
    /// Handles stay usable but are no longer managed. Entities that were
    /// mutated lose their committed key, since their content no longer
    /// matches it. Returns whether a transaction was active.
    pub fn discard(&mut self) -> bool {
        let mut mutated: Vec<AnyEntity> =
            self.tracker.drain().into_iter().map(|c| c.entity).collect();
        let active = match self.transaction.take() {
            Some(transaction) => {
                info!(pending = transaction.pending_count(), "transaction discarded");
                mutated.extend(transaction.changed());
                true
            }
            None => false,
        };
        for entity in &mutated {
            self.cache.remove_entity(entity);
        }
        active
    }

    /// Load an entity by key, through the identity map.
    pub async fn find<T: Send + Sync + 'static>(&mut self, key: &Key) -> OrmResult<Handle<T>> {
        let entity = self.find_any(TypeTag::of::<T>(), key).await?;
        entity
            .downcast::<T>()
            .ok_or_else(|| OrmError::UnknownType(std::any::type_name::<T>().to_string()))
    }

    pub async fn find_any(&mut self, tag: TypeTag, key: &Key) -> OrmResult<AnyEntity> {
        let entity_type = self.metamodel.by_tag(tag)?.clone();
        Query::new(
            &self.metamodel,
            self.store.as_ref(),
            &mut self.cache,
            &self.tracker,
            self.config.max_association_depth,
        )
        .load(&entity_type, key)
        .await
    }

    /// Find a managed entity by a natural-key attribute.
    ///
    /// Searches entities tracked by the active transaction, then the
    /// committed identity map. Nothing is read from the store.
    pub fn find_by<T: Send + Sync + 'static>(
        &self,
        attribute: &str,
        value: &Value,
    ) -> OrmResult<Option<Handle<T>>> {
        let entity_type = self.metamodel.entity_type::<T>()?;
        let attribute = entity_type.resolve(attribute)?;
        if !attribute.is_key() {
            return Err(OrmError::NotNaturalKey {
                entity: entity_type.name().to_string(),
                attribute: attribute.name().to_string(),
            });
        }
        let is_match = |entity: &AnyEntity| {
            matches!(entity.read_field(attribute), Field::Value(ref v) if v == value)
        };

        if let Some(persister) = self
            .transaction
            .as_ref()
            .and_then(|t| t.persister(entity_type.tag()))
        {
            let found = persister
                .entities()
                .filter(|(_, state)| *state != EntityState::Removed)
                .map(|(entity, _)| entity)
                .find(|entity| is_match(*entity));
            if let Some(entity) = found {
                return Ok(entity.downcast::<T>());
            }
        }

        let mut cached: Vec<&AnyEntity> = self
            .cache
            .entities(entity_type.tag())
            .map(|(_, entity)| entity)
            .collect();
        cached.sort_by_key(|e| e.id());
        Ok(cached
            .into_iter()
            .find(|entity| is_match(*entity))
            .and_then(|entity| entity.downcast::<T>()))
    }

    /// The committed key of an entity, if it has one.
    pub fn key<T: Send + Sync + 'static>(&self, handle: &Handle<T>) -> Option<Key> {
        let local = self.transaction.as_ref().map(Transaction::cache);
        match local {
            Some(local) => CacheView::new(local, Some(&self.cache)).key(handle.as_any()),
            None => self.cache.key(handle.as_any()),
        }
    }

    /// Lifecycle state of an entity, after applying pending writes.
    ///
    /// Entities with a committed key but no pending work report `LOADED`.
    pub fn state<T: Send + Sync + 'static>(
        &mut self,
        handle: &Handle<T>,
    ) -> OrmResult<Option<EntityState>> {
        self.sync_changes()?;
        let entity = handle.as_any();
        let tracked = self.transaction.as_ref().and_then(|t| t.state(entity));
        Ok(tracked.or_else(|| self.cache.key(entity).map(|_| EntityState::Loaded)))
    }

    /// Whether the next flush would write anything.
    pub fn is_dirty(&mut self) -> OrmResult<bool> {
        self.sync_changes()?;
        Ok(self.transaction.as_ref().is_some_and(Transaction::is_dirty))
    }
}

fn start_transaction() -> Transaction {
    debug!("transaction started");
    Transaction::new()
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("entity_types", &self.metamodel.len())
            .field("cached", &self.cache.len())
            .field("transaction", &self.transaction.is_some())
            .field("config", &self.config)
            .finish()
    }
}
