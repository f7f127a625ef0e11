//! Foundation types for cairn.
//!
//! This crate provides the storage-neutral vocabulary shared by the store
//! adapters and the object mapper. Every other cairn crate depends on
//! `cairn-types`.
//!
//! # Key Types
//!
//! - [`Key`]: Content-derived identifier of a stored node
//! - [`Value`]: A single attribute value: primitive or a link to another node
//! - [`Node`]: Ordered attribute-name → value mapping; the unit of storage

pub mod error;
pub mod key;
pub mod node;
pub mod value;

pub use error::TypeError;
pub use key::Key;
pub use node::Node;
pub use value::{Value, ValueKindError};
