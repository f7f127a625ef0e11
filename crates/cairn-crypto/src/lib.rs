//! Content hashing for cairn.
//!
//! Provides the domain-separated BLAKE3 hasher that content-addressed stores
//! use to derive a node's [`Key`](cairn_types::Key) from its canonical bytes.
//!
//! Hashing is delegated to the `blake3` crate.

pub mod hasher;

pub use hasher::{ContentHasher, HasherError};
