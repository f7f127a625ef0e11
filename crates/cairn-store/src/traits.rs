use async_trait::async_trait;
use cairn_types::{Key, Node};

use crate::error::{StoreError, StoreResult};

/// Content-addressed node store.
///
/// All implementations must satisfy these invariants:
/// - `put` is deterministic: the same node always produces the same key.
/// - `put` is idempotent: writing an existing node is a no-op returning its key.
/// - Nodes are never mutated in place; an "update" is a new `put`.
/// - All transport and decoding errors are propagated.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Write a node and return its content-derived key.
    async fn put(&self, node: &Node) -> StoreResult<Key>;

    /// Read a node by key.
    ///
    /// Returns `Err(StoreError::NotFound)` if the key is unknown to the store.
    async fn get(&self, key: &Key) -> StoreResult<Node>;

    /// Check whether a node exists in the store.
    async fn contains(&self, key: &Key) -> StoreResult<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop a node. Returns `true` if the node existed and was removed.
    ///
    /// Stores without a delete primitive keep the node and return `false`.
    /// Because identical content shares one key, deleting a node can break
    /// other entities that happen to serialize to the same content.
    async fn delete(&self, _key: &Key) -> StoreResult<bool> {
        Ok(false)
    }
}
