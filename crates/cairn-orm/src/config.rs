//! Manager settings.

use serde::{Deserialize, Serialize};

/// Behaviour switches for a [`Manager`](crate::Manager).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Re-key entities whose associations point at an updated entity.
    ///
    /// A node embeds the keys of the nodes it references, so a parent whose
    /// child got a new key still points at the superseded child until it is
    /// rewritten itself.
    pub cascade_updates: bool,
    /// Ask the store to delete the node of a removed entity on flush.
    /// When off, removal only invalidates the cached key.
    pub delete_removed_nodes: bool,
    /// Maximum association nesting followed when materializing a node.
    pub max_association_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cascade_updates: true,
            delete_removed_nodes: false,
            max_association_depth: 64,
        }
    }
}

impl ManagerConfig {
    pub fn with_cascade_updates(mut self, enabled: bool) -> Self {
        self.cascade_updates = enabled;
        self
    }

    pub fn with_delete_removed_nodes(mut self, enabled: bool) -> Self {
        self.delete_removed_nodes = enabled;
        self
    }

    pub fn with_max_association_depth(mut self, depth: usize) -> Self {
        self.max_association_depth = depth;
        self
    }
}
