//! Content-addressed node storage for cairn.
//!
//! This crate defines the boundary between the object mapper and a backing
//! content-addressable DAG service. A store accepts a [`Node`] and answers
//! with the key it derived from the node's content; given a key it returns
//! the node's raw fields.
//!
//! # Storage Backends
//!
//! All backends implement the [`NodeStore`] trait:
//!
//! - [`InMemoryNodeStore`] -- `HashMap`-based store for tests and embedding
//!
//! # Design Rules
//!
//! 1. Nodes are immutable once written. There is no in-place update: a
//!    changed node is a fresh `put` yielding a fresh key.
//! 2. `put` is deterministic and idempotent (same content, same key).
//! 3. The mapper never invents keys; it only uses what `put` returns.
//! 4. All backend errors are propagated, never silently ignored.
//!
//! [`Node`]: cairn_types::Node

pub mod error;
pub mod memory;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryNodeStore;
pub use traits::NodeStore;
