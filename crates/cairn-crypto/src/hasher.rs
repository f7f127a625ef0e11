use cairn_types::{Key, Node};

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag that is prepended to every hash
/// computation, so keys derived for nodes never collide with hashes computed
/// for unrelated purposes over the same bytes.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for stored DAG nodes.
    pub const NODE: Self = Self {
        domain: "cairn-node-v1",
    };

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Key {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        Key::from_hash(*hasher.finalize().as_bytes())
    }

    /// Hash a node's canonical encoding.
    pub fn hash_node(&self, node: &Node) -> Result<Key, HasherError> {
        let data = node
            .canonical_bytes()
            .map_err(|e| HasherError::Serialization(e.to_string()))?;
        Ok(self.hash(&data))
    }
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HasherError {
    #[error("serialization error: {0}")]
    Serialization(String),
}
