//! Hierarchical identity map.
//!
//! A [`Cache`] holds one [`CacheLayer`] per entity type: a bijection between
//! content keys and live entities. The manager owns the committed cache; each
//! transaction owns an overlay that shadows it until commit, when the overlay
//! is merged back. Keys superseded inside an overlay are tombstoned so that
//! lookups through a [`CacheView`] never fall through to a stale binding in
//! the parent.
//!
//! Entities with identical content are written under the same key, but only
//! one of them can hold that key in the identity map. The others are kept as
//! sharers: their key is still known, they are just not what a lookup by key
//! returns.

use std::collections::{HashMap, HashSet};

use cairn_types::Key;
use tracing::{debug, trace};

use crate::entity::{AnyEntity, EntityId};
use crate::meta::TypeTag;

/// Key ⇄ entity bijection for one entity type, plus the sharers of each key.
#[derive(Clone, Debug, Default)]
pub struct CacheLayer {
    by_key: HashMap<Key, AnyEntity>,
    by_entity: HashMap<EntityId, Key>,
    shared: HashMap<EntityId, (AnyEntity, Key)>,
    evicted_keys: HashSet<Key>,
    evicted_entities: HashSet<EntityId>,
}

impl CacheLayer {
    pub fn entity(&self, key: &Key) -> Option<&AnyEntity> {
        self.by_key.get(key)
    }

    /// The key `entity` was written under, whether it holds that key or
    /// shares it.
    pub fn key(&self, entity: EntityId) -> Option<Key> {
        self.bound_key(entity).or_else(|| self.shared_key(entity))
    }

    /// The key `entity` holds in the identity map.
    pub fn bound_key(&self, entity: EntityId) -> Option<Key> {
        self.by_entity.get(&entity).copied()
    }

    /// The key `entity` shares with the entity that holds it.
    pub fn shared_key(&self, entity: EntityId) -> Option<Key> {
        self.shared.get(&entity).map(|(_, key)| *key)
    }

    /// Bind `entity` to `key`, unbinding whatever either side was bound to.
    ///
    /// An entity displaced from `key` has the same content, so it becomes a
    /// sharer of `key` instead of losing it.
    pub fn set(&mut self, entity: &AnyEntity, key: Key) {
        self.shared.remove(&entity.id());
        if let Some(old_key) = self.by_entity.insert(entity.id(), key) {
            if old_key != key {
                self.by_key.remove(&old_key);
            }
        }
        if let Some(old_entity) = self.by_key.insert(key, entity.clone()) {
            if old_entity.id() != entity.id() {
                self.by_entity.remove(&old_entity.id());
                trace!(entity = %old_entity, holder = %entity, key = %key.short_hex(), "key shared");
                self.shared.insert(old_entity.id(), (old_entity, key));
            }
        }
        self.evicted_keys.remove(&key);
        self.evicted_entities.remove(&entity.id());
    }

    /// Record `entity` as a sharer of `key`. An entity already holding
    /// `key` keeps it.
    pub fn share(&mut self, entity: &AnyEntity, key: Key) {
        if self.bound_key(entity.id()) == Some(key) {
            return;
        }
        self.remove(entity.id());
        self.shared.insert(entity.id(), (entity.clone(), key));
        self.evicted_entities.remove(&entity.id());
    }

    /// Unbind `key` and tombstone it. Sharers keep the key.
    pub fn evict_key(&mut self, key: &Key) -> Option<AnyEntity> {
        self.evicted_keys.insert(*key);
        let entity = self.by_key.remove(key)?;
        self.by_entity.remove(&entity.id());
        Some(entity)
    }

    /// Unbind `entity` and tombstone it.
    pub fn evict_entity(&mut self, entity: EntityId) -> Option<Key> {
        self.evicted_entities.insert(entity);
        self.remove(entity)
    }

    /// Unbind `entity` without leaving a tombstone.
    pub fn remove(&mut self, entity: EntityId) -> Option<Key> {
        if let Some((_, key)) = self.shared.remove(&entity) {
            return Some(key);
        }
        let key = self.by_entity.remove(&entity)?;
        self.by_key.remove(&key);
        Some(key)
    }

    /// Whether some entity other than the holder was written under `key`.
    pub fn is_shared(&self, key: &Key) -> bool {
        self.shared.values().any(|(_, k)| k == key)
    }

    pub fn is_evicted_key(&self, key: &Key) -> bool {
        self.evicted_keys.contains(key)
    }

    pub fn is_evicted_entity(&self, entity: EntityId) -> bool {
        self.evicted_entities.contains(&entity)
    }

    /// Identity-map bindings.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &AnyEntity)> {
        self.by_key.iter()
    }

    /// Every keyed entity, holders and sharers.
    pub fn entities(&self) -> impl Iterator<Item = (&Key, &AnyEntity)> {
        self.by_key
            .iter()
            .chain(self.shared.values().map(|(entity, key)| (key, entity)))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.shared.is_empty()
    }

    fn merge(&mut self, child: &CacheLayer) {
        for key in &child.evicted_keys {
            if let Some(entity) = self.by_key.remove(key) {
                self.by_entity.remove(&entity.id());
            }
        }
        for entity in &child.evicted_entities {
            self.remove(*entity);
        }
        for (entity, key) in child.shared.values() {
            self.share(entity, *key);
        }
        for (key, entity) in &child.by_key {
            self.set(entity, *key);
        }
    }

    fn without_tombstones(&self) -> Self {
        Self {
            by_key: self.by_key.clone(),
            by_entity: self.by_entity.clone(),
            shared: self.shared.clone(),
            evicted_keys: HashSet::new(),
            evicted_entities: HashSet::new(),
        }
    }

    #[cfg(test)]
    fn is_bijective(&self) -> bool {
        self.by_key.len() == self.by_entity.len()
            && self
                .by_key
                .iter()
                .all(|(key, entity)| self.by_entity.get(&entity.id()) == Some(key))
            && self.shared.keys().all(|id| !self.by_entity.contains_key(id))
    }
}

/// Per-type identity map.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    layers: HashMap<TypeTag, CacheLayer>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(&self, tag: TypeTag) -> Option<&CacheLayer> {
        self.layers.get(&tag)
    }

    pub fn entity(&self, tag: TypeTag, key: &Key) -> Option<&AnyEntity> {
        self.layers.get(&tag)?.entity(key)
    }

    pub fn key(&self, entity: &AnyEntity) -> Option<Key> {
        self.layers.get(&entity.tag())?.key(entity.id())
    }

    pub fn set(&mut self, entity: &AnyEntity, key: Key) {
        self.layers.entry(entity.tag()).or_default().set(entity, key);
    }

    pub fn evict_key(&mut self, tag: TypeTag, key: &Key) -> Option<AnyEntity> {
        self.layers.entry(tag).or_default().evict_key(key)
    }

    pub fn evict_entity(&mut self, entity: &AnyEntity) -> Option<Key> {
        self.layers
            .entry(entity.tag())
            .or_default()
            .evict_entity(entity.id())
    }

    /// Forget `entity` in this layer only; lookups still fall through.
    pub fn remove_entity(&mut self, entity: &AnyEntity) -> Option<Key> {
        self.layers.get_mut(&entity.tag())?.remove(entity.id())
    }

    /// All keyed entities of one type in this cache, sharers included.
    pub fn entities(&self, tag: TypeTag) -> impl Iterator<Item = (&Key, &AnyEntity)> {
        self.layers.get(&tag).into_iter().flat_map(CacheLayer::entities)
    }

    /// Every keyed entity, all types.
    pub fn all_entities(&self) -> impl Iterator<Item = &AnyEntity> {
        self.layers.values().flat_map(|l| l.entities().map(|(_, e)| e))
    }

    /// Number of identity-map bindings across all types.
    pub fn len(&self) -> usize {
        self.layers.values().map(CacheLayer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.values().all(CacheLayer::is_empty)
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Fold a child cache into this one.
    ///
    /// Child tombstones unbind the matching parent entries, then child
    /// entries overwrite. A type unknown to the parent adopts the child's
    /// layer. Merging the same child twice is a no-op the second time.
    pub fn merge(&mut self, child: &Cache) {
        for (tag, layer) in &child.layers {
            match self.layers.get_mut(tag) {
                Some(parent) => parent.merge(layer),
                None => {
                    self.layers.insert(*tag, layer.without_tombstones());
                }
            }
        }
        debug!(
            types = child.layers.len(),
            entries = child.len(),
            total = self.len(),
            "merged cache"
        );
    }
}

/// Read-only lookup through an overlay and its parent.
#[derive(Clone, Copy, Debug)]
pub struct CacheView<'a> {
    local: &'a Cache,
    parent: Option<&'a Cache>,
}

impl<'a> CacheView<'a> {
    pub fn new(local: &'a Cache, parent: Option<&'a Cache>) -> Self {
        Self { local, parent }
    }

    pub fn root(cache: &'a Cache) -> Self {
        Self::new(cache, None)
    }

    pub fn entity(&self, tag: TypeTag, key: &Key) -> Option<AnyEntity> {
        let local = self.local.layer(tag);
        if let Some(layer) = local {
            if let Some(entity) = layer.entity(key) {
                return Some(entity.clone());
            }
            if layer.is_evicted_key(key) {
                return None;
            }
        }
        let entity = self.parent?.entity(tag, key)?;
        if let Some(layer) = local {
            if layer.is_evicted_entity(entity.id()) {
                return None;
            }
            if layer.key(entity.id()).is_some_and(|k| k != *key) {
                return None;
            }
        }
        Some(entity.clone())
    }

    /// The key `entity` was written under.
    ///
    /// A parent holder displaced by a local binding of the same key still
    /// has that key; it is now a sharer of it.
    pub fn key(&self, entity: &AnyEntity) -> Option<Key> {
        let local = self.local.layer(entity.tag());
        if let Some(layer) = local {
            if let Some(key) = layer.key(entity.id()) {
                return Some(key);
            }
            if layer.is_evicted_entity(entity.id()) {
                return None;
            }
        }
        let parent = self.parent?.layer(entity.tag())?;
        if let Some(key) = parent.shared_key(entity.id()) {
            return Some(key);
        }
        let key = parent.bound_key(entity.id())?;
        if local.is_some_and(|layer| layer.is_evicted_key(&key)) {
            return None;
        }
        Some(key)
    }

    /// Whether an entity other than the holder of `key` was written under it.
    pub fn is_shared(&self, tag: TypeTag, key: &Key) -> bool {
        let local = self.local.layer(tag);
        if local.is_some_and(|layer| layer.is_shared(key)) {
            return true;
        }
        if let Some(parent) = self.parent.and_then(|p| p.layer(tag)) {
            if parent.is_shared(key) {
                return true;
            }
            if let Some(holder) = parent.entity(key) {
                if local.is_some_and(|layer| layer.entity(key).is_some_and(|e| e != holder)) {
                    return true;
                }
            }
        }
        false
    }
}
