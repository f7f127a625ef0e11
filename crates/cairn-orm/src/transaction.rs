//! Unit of work.
//!
//! A [`Transaction`] owns one [`Persister`] per entity type it has seen and an
//! overlay [`Cache`] that collects keys produced while flushing. Committing
//! writes pending entities in dependency order, then merges the overlay into
//! the manager's committed cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cairn_store::NodeStore;
use tracing::{debug, info, trace};

use crate::cache::{Cache, CacheView};
use crate::config::ManagerConfig;
use crate::entity::{AnyEntity, EntityId, Field};
use crate::error::{OrmError, OrmResult};
use crate::meta::{EntityType, TypeTag};
use crate::persister::{EntityState, FlushOutcome, FlushTarget, Persister};

/// Counts of what a commit wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Entities promoted to `CHANGED` because an association target changed.
    pub cascaded: usize,
}

impl FlushSummary {
    fn record(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Unchanged => {}
            FlushOutcome::Inserted(_) => self.inserted += 1,
            FlushOutcome::Updated { .. } => self.updated += 1,
            FlushOutcome::Removed(_) => self.removed += 1,
        }
    }

    /// Number of store-visible operations.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Pending creates, updates and removals, applied together on commit.
#[derive(Debug, Default)]
pub struct Transaction {
    persisters: HashMap<TypeTag, Persister>,
    order: Vec<TypeTag>,
    cache: Cache,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// The overlay cache. Empty outside of a commit.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn persister(&self, tag: TypeTag) -> Option<&Persister> {
        self.persisters.get(&tag)
    }

    /// The persister for `entity_type`, created on first use.
    pub fn persister_mut(&mut self, entity_type: &Arc<EntityType>) -> &mut Persister {
        let tag = entity_type.tag();
        if !self.persisters.contains_key(&tag) {
            trace!(entity_type = entity_type.name(), "new persister");
            self.order.push(tag);
        }
        self.persisters
            .entry(tag)
            .or_insert_with(|| Persister::new(entity_type.clone()))
    }

    /// Persisters in creation order.
    pub fn persisters(&self) -> impl Iterator<Item = &Persister> {
        self.order.iter().filter_map(|tag| self.persisters.get(tag))
    }

    pub fn state(&self, entity: &AnyEntity) -> Option<EntityState> {
        self.persisters.get(&entity.tag())?.state(entity)
    }

    pub fn contains(&self, entity: &AnyEntity) -> bool {
        self.state(entity).is_some()
    }

    /// Whether a commit would write anything.
    pub fn is_dirty(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> usize {
        self.persisters().map(|p| p.pending().len()).sum()
    }

    fn view<'a>(&'a self, committed: &'a Cache) -> CacheView<'a> {
        CacheView::new(&self.cache, Some(committed))
    }

    /// Register a new entity as `CREATED`.
    ///
    /// An entity that already has a key behaves as `LOADED`, so persisting
    /// it again is an illegal transition.
    pub fn persist(&mut self, entity: &AnyEntity, committed: &Cache) -> OrmResult<()> {
        if !self.contains(entity) && self.view(committed).key(entity).is_some() {
            return Err(OrmError::IllegalStateTransition {
                entity: entity.to_string(),
                from: Some(EntityState::Loaded),
                to: EntityState::Created,
            });
        }
        self.persister_mut(entity.entity_type()).persist(entity)
    }

    /// Mark an entity for removal. Entities known only through the
    /// committed cache are adopted as `LOADED` first.
    pub fn remove(&mut self, entity: &AnyEntity, committed: &Cache) -> OrmResult<()> {
        self.adopt(entity, committed)?;
        self.persister_mut(entity.entity_type()).remove(entity)
    }

    /// Apply one observed write. Returns whether the entity became
    /// `CHANGED`. Writes to entities this transaction cannot see are
    /// ignored.
    pub fn note_change(&mut self, entity: &AnyEntity, committed: &Cache) -> OrmResult<bool> {
        if !self.contains(entity) && self.view(committed).key(entity).is_none() {
            trace!(entity = %entity, "write to unmanaged entity ignored");
            return Ok(false);
        }
        self.adopt(entity, committed)?;
        self.persister_mut(entity.entity_type()).mark_changed(entity)
    }

    fn adopt(&mut self, entity: &AnyEntity, committed: &Cache) -> OrmResult<()> {
        if self.contains(entity) || self.view(committed).key(entity).is_none() {
            return Ok(());
        }
        self.persister_mut(entity.entity_type()).track_loaded(entity)
    }

    /// Stop tracking `entity`. Returns its state if it was tracked.
    pub fn detach(&mut self, entity: &AnyEntity) -> Option<EntityState> {
        self.cache.remove_entity(entity);
        self.persisters.get_mut(&entity.tag())?.detach(entity)
    }

    /// Entities currently tracked as `CHANGED`.
    pub fn changed(&self) -> Vec<AnyEntity> {
        self.persisters()
            .flat_map(|p| p.entities())
            .filter(|(_, state)| *state == EntityState::Changed)
            .map(|(entity, _)| entity.clone())
            .collect()
    }

    /// Promote every known entity whose association points at a `CHANGED`
    /// entity, until nothing changes. Returns the number promoted.
    pub fn cascade(&mut self, committed: &Cache) -> OrmResult<usize> {
        let mut promoted = 0;
        loop {
            let mut candidates: Vec<AnyEntity> = Vec::new();
            let mut seen = HashSet::new();
            for persister in self.persisters() {
                for (entity, state) in persister.entities() {
                    if state == EntityState::Loaded && seen.insert(entity.id()) {
                        candidates.push(entity.clone());
                    }
                }
            }
            let mut cached: Vec<&AnyEntity> = committed
                .all_entities()
                .filter(|e| e.entity_type().has_associations() && !self.contains(e))
                .collect();
            cached.sort_by_key(|e| e.id());
            for entity in cached {
                if seen.insert(entity.id()) && self.view(committed).key(entity).is_some() {
                    candidates.push(entity.clone());
                }
            }

            let stale: Vec<AnyEntity> = candidates
                .into_iter()
                .filter(|entity| self.references_changed(entity))
                .collect();
            if stale.is_empty() {
                break;
            }
            for entity in &stale {
                self.adopt(entity, committed)?;
                if self.persister_mut(entity.entity_type()).mark_changed(entity)? {
                    debug!(entity = %entity, "cascaded update");
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    fn references_changed(&self, entity: &AnyEntity) -> bool {
        entity.entity_type().associations().any(|attribute| {
            match entity.read_field(attribute) {
                Field::Reference(Some(target)) => {
                    self.state(&target) == Some(EntityState::Changed)
                }
                _ => false,
            }
        })
    }

    /// Order pending work: writes first, each after the pending entities it
    /// references, then removals. Ties follow persister creation order and
    /// then insertion order.
    pub fn plan(&self) -> OrmResult<Vec<AnyEntity>> {
        let mut marks = HashMap::new();
        let mut writes = Vec::new();
        let mut removals = Vec::new();
        for persister in self.persisters() {
            for (entity, state) in persister.pending() {
                match state {
                    EntityState::Removed => removals.push(entity),
                    _ => self.visit(&entity, &mut marks, &mut writes)?,
                }
            }
        }
        writes.extend(removals);
        Ok(writes)
    }

    fn visit(
        &self,
        entity: &AnyEntity,
        marks: &mut HashMap<EntityId, Mark>,
        out: &mut Vec<AnyEntity>,
    ) -> OrmResult<()> {
        match marks.get(&entity.id()) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(OrmError::CyclicAssociation(entity.to_string())),
            None => {}
        }
        marks.insert(entity.id(), Mark::Visiting);
        for attribute in entity.entity_type().associations() {
            if let Field::Reference(Some(target)) = entity.read_field(attribute) {
                if matches!(
                    self.state(&target),
                    Some(EntityState::Created | EntityState::Changed)
                ) {
                    self.visit(&target, marks, out)?;
                }
            }
        }
        marks.insert(entity.id(), Mark::Done);
        out.push(entity.clone());
        Ok(())
    }

    /// Flush all pending work and merge the overlay into `committed`.
    ///
    /// The overlay is merged even when a write fails, so entities flushed
    /// before the failure stay committed. The failed entity and everything
    /// after it keep their state; calling `commit` again resumes.
    pub async fn commit(
        &mut self,
        store: &dyn NodeStore,
        committed: &mut Cache,
        config: &ManagerConfig,
    ) -> OrmResult<FlushSummary> {
        let mut summary = FlushSummary::default();
        if config.cascade_updates {
            summary.cascaded = self.cascade(committed)?;
        }
        let plan = self.plan()?;
        debug!(steps = plan.len(), "commit plan");

        let result = self.execute(&plan, store, committed, config, &mut summary).await;
        committed.merge(&self.cache);
        self.cache.clear();
        result?;

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            removed = summary.removed,
            cascaded = summary.cascaded,
            "transaction committed"
        );
        Ok(summary)
    }

    async fn execute(
        &mut self,
        plan: &[AnyEntity],
        store: &dyn NodeStore,
        committed: &Cache,
        config: &ManagerConfig,
        summary: &mut FlushSummary,
    ) -> OrmResult<()> {
        let mut target = FlushTarget {
            store,
            overlay: &mut self.cache,
            committed: Some(committed),
            delete_removed_nodes: config.delete_removed_nodes,
        };
        for entity in plan {
            let persister = self
                .persisters
                .get_mut(&entity.tag())
                .ok_or_else(|| OrmError::NotManaged(entity.to_string()))?;
            summary.record(persister.flush_entity(entity, &mut target).await?);
        }
        Ok(())
    }
}
