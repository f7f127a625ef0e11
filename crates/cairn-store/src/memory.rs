use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use cairn_crypto::ContentHasher;
use cairn_types::{Key, Node};
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::traits::NodeStore;

/// In-memory, HashMap-based node store.
///
/// Intended for tests and embedding. Nodes are kept as canonical bytes behind
/// a `RwLock`; the key of a node is the domain-separated BLAKE3 hash of those
/// bytes, and every read re-verifies it.
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<Key, Vec<u8>>>,
}

impl InMemoryNodeStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Number of nodes currently stored.
    pub fn len(&self) -> usize {
        self.nodes.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().expect("lock poisoned").is_empty()
    }

    /// Remove all nodes from the store.
    pub fn clear(&self) {
        self.nodes.write().expect("lock poisoned").clear();
    }

    /// Return a sorted list of all keys in the store.
    pub fn keys(&self) -> Vec<Key> {
        let map = self.nodes.read().expect("lock poisoned");
        let mut keys: Vec<Key> = map.keys().copied().collect();
        keys.sort();
        keys
    }

    fn encode(node: &Node) -> StoreResult<(Key, Vec<u8>)> {
        let bytes = node
            .canonical_bytes()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok((ContentHasher::NODE.hash(&bytes), bytes))
    }
}

impl Default for InMemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn put(&self, node: &Node) -> StoreResult<Key> {
        let (key, bytes) = Self::encode(node)?;
        let mut map = self.nodes.write().expect("lock poisoned");
        // Idempotent: content-addressing guarantees the same key always maps
        // to the same bytes.
        map.entry(key).or_insert(bytes);
        trace!(key = %key.short_hex(), fields = node.len(), "put node");
        Ok(key)
    }

    async fn get(&self, key: &Key) -> StoreResult<Node> {
        let bytes = {
            let map = self.nodes.read().expect("lock poisoned");
            map.get(key).cloned().ok_or(StoreError::NotFound(*key))?
        };
        let computed = ContentHasher::NODE.hash(&bytes);
        if computed != *key {
            return Err(StoreError::HashMismatch {
                key: *key,
                computed,
            });
        }
        Node::from_canonical_bytes(&bytes).map_err(|e| StoreError::CorruptNode {
            key: *key,
            reason: e.to_string(),
        })
    }

    async fn contains(&self, key: &Key) -> StoreResult<bool> {
        let map = self.nodes.read().expect("lock poisoned");
        Ok(map.contains_key(key))
    }

    async fn delete(&self, key: &Key) -> StoreResult<bool> {
        let mut map = self.nodes.write().expect("lock poisoned");
        Ok(map.remove(key).is_some())
    }
}

impl std::fmt::Debug for InMemoryNodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len();
        f.debug_struct("InMemoryNodeStore")
            .field("node_count", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::Value;

    fn author(first: &str, last: &str) -> Node {
        Node::new().with("firstname", first).with("lastname", last)
    }

    // -----------------------------------------------------------------------
    // Core put / get
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn put_and_get() {
        let store = InMemoryNodeStore::new();
        let node = author("Douglas", "Adams");
        let key = store.put(&node).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), node);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryNodeStore::new();
        let key = Key::from_hash([3; 32]);
        assert!(matches!(store.get(&key).await, Err(StoreError::NotFound(k)) if k == key));
    }

    // -----------------------------------------------------------------------
    // Content-addressing correctness
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn same_content_produces_same_key() {
        let store = InMemoryNodeStore::new();
        let k1 = store.put(&author("Douglas", "Adams")).await.unwrap();
        let k2 = store.put(&author("Douglas", "Adams")).await.unwrap();
        assert_eq!(k1, k2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn different_content_produces_different_keys() {
        let store = InMemoryNodeStore::new();
        let k1 = store.put(&author("Richard", "Bachman")).await.unwrap();
        let k2 = store.put(&author("Stephen", "King")).await.unwrap();
        assert_ne!(k1, k2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn key_matches_content_hasher() {
        let store = InMemoryNodeStore::new();
        let node = author("a", "b");
        let key = store.put(&node).await.unwrap();
        assert_eq!(key, ContentHasher::NODE.hash_node(&node).unwrap());
    }

    #[tokio::test]
    async fn links_survive_storage() {
        let store = InMemoryNodeStore::new();
        let author_key = store.put(&author("Douglas", "Adams")).await.unwrap();
        let book = Node::new()
            .with("title", "Hitchhiker")
            .with("author", author_key);
        let book_key = store.put(&book).await.unwrap();
        let read = store.get(&book_key).await.unwrap();
        assert_eq!(read.get("author"), Some(&Value::Link(author_key)));
    }

    // -----------------------------------------------------------------------
    // Contains / Delete
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn contains_and_delete() {
        let store = InMemoryNodeStore::new();
        let key = store.put(&author("x", "y")).await.unwrap();
        assert!(store.contains(&key).await.unwrap());
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.contains(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn unencodable_nodes_are_not_stored() {
        let store = InMemoryNodeStore::new();
        let node = Node::new().with("x", f64::NAN);
        assert!(matches!(
            store.put(&node).await,
            Err(StoreError::Serialization(_))
        ));
        assert!(store.is_empty());
    }

    // -----------------------------------------------------------------------
    // Hash verification on read
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tampered_bytes_are_detected() {
        let store = InMemoryNodeStore::new();
        let key = store.put(&author("a", "b")).await.unwrap();
        {
            let mut map = store.nodes.write().unwrap();
            let bytes = author("c", "d").canonical_bytes().unwrap();
            map.insert(key, bytes);
        }
        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::HashMismatch { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Utility methods
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn keys_are_sorted_and_clear_empties() {
        let store = InMemoryNodeStore::default();
        assert!(store.is_empty());
        for name in ["a", "b", "c"] {
            store.put(&author(name, name)).await.unwrap();
        }
        let keys = store.keys();
        assert_eq!(keys.len(), 3);
        for w in keys.windows(2) {
            assert!(w[0] <= w[1]);
        }
        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn debug_format() {
        let store = InMemoryNodeStore::new();
        store.put(&author("x", "y")).await.unwrap();
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryNodeStore"));
        assert!(debug.contains("node_count"));
    }
}
