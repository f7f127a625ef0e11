//! Read path: materialize entities from stored nodes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cairn_store::NodeStore;
use cairn_types::{Key, Value};
use tracing::{debug, trace};

use crate::cache::Cache;
use crate::entity::{AnyEntity, Field};
use crate::error::{OrmError, OrmResult};
use crate::meta::{EntityType, Metamodel, Type};
use crate::tracker::ChangeTracker;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Loads entities through the identity map, falling back to the store.
///
/// Every materialized entity is registered in the cache before it is
/// returned, so a key is never materialized twice.
pub struct Query<'a> {
    metamodel: &'a Metamodel,
    store: &'a dyn NodeStore,
    cache: &'a mut Cache,
    tracker: &'a Arc<ChangeTracker>,
    max_depth: usize,
}

impl<'a> Query<'a> {
    pub fn new(
        metamodel: &'a Metamodel,
        store: &'a dyn NodeStore,
        cache: &'a mut Cache,
        tracker: &'a Arc<ChangeTracker>,
        max_depth: usize,
    ) -> Self {
        Self {
            metamodel,
            store,
            cache,
            tracker,
            max_depth,
        }
    }

    /// Load the entity of `entity_type` stored under `key`.
    pub async fn load(&mut self, entity_type: &Arc<EntityType>, key: &Key) -> OrmResult<AnyEntity> {
        self.load_at(entity_type.clone(), *key, 0).await
    }

    fn load_at<'b>(
        &'b mut self,
        entity_type: Arc<EntityType>,
        key: Key,
        depth: usize,
    ) -> BoxFuture<'b, OrmResult<AnyEntity>> {
        Box::pin(async move {
            if let Some(entity) = self.cache.entity(entity_type.tag(), &key) {
                trace!(key = %key.short_hex(), entity = %entity, "identity map hit");
                return Ok(entity.clone());
            }
            if depth > self.max_depth {
                return Err(OrmError::DepthExceeded(self.max_depth));
            }

            let node = self.store.get(&key).await?;
            let entity = AnyEntity::new(entity_type.clone(), entity_type.instantiate(), self.tracker);
            for attribute in entity_type.attributes().filter(|a| a.is_stored()) {
                let value = node.get(attribute.name()).cloned().ok_or_else(|| {
                    OrmError::MalformedNode {
                        key,
                        reason: format!("missing attribute `{}`", attribute.name()),
                    }
                })?;
                let field = match attribute.target() {
                    Type::Entity(tag) => match value {
                        Value::Null => Field::Reference(None),
                        Value::Link(target_key) => {
                            let target_type = self.metamodel.by_tag(tag)?.clone();
                            let target = self.load_at(target_type, target_key, depth + 1).await?;
                            Field::Reference(Some(target))
                        }
                        other => {
                            return Err(OrmError::MalformedNode {
                                key,
                                reason: format!(
                                    "attribute `{}` holds {}, expected a link",
                                    attribute.name(),
                                    other.kind()
                                ),
                            })
                        }
                    },
                    Type::Basic(_) => Field::Value(value),
                };
                entity
                    .write_field(attribute, field)
                    .map_err(|e| OrmError::MalformedNode {
                        key,
                        reason: e.to_string(),
                    })?;
            }

            self.cache.set(&entity, key);
            debug!(key = %key.short_hex(), entity = %entity, depth, "materialized");
            Ok(entity)
        })
    }
}
