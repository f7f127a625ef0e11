//! # cairn-orm
//!
//! Object mapping over a content-addressed node store.
//!
//! Application structs are described once in a [`Metamodel`]. A [`Manager`]
//! hands out [`Handle`]s to managed entities, records their writes, and on
//! [`Manager::flush`] turns every pending entity into an immutable [`Node`]
//! whose key is the hash of its content. Associations are stored as the key
//! of the target, so targets are always written before the entities that
//! reference them, and updating a target re-keys everything that points at
//! it.
//!
//! - [`meta`]: entity types, attributes and the accessor table.
//! - [`entity`]: entity cells and handles.
//! - [`tracker`]: write observation.
//! - [`cache`]: the hierarchical identity map.
//! - [`persister`]: per-type lifecycle state machine and flush.
//! - [`transaction`]: the unit of work.
//! - [`query`]: the read path.
//! - [`manager`]: the façade tying them together.
//!
//! [`Node`]: cairn_types::Node

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod manager;
pub mod meta;
pub mod persister;
pub mod query;
pub mod tracker;
pub mod transaction;

#[cfg(test)]
mod fixtures;

pub use cache::{Cache, CacheLayer, CacheView};
pub use config::ManagerConfig;
pub use entity::{AnyEntity, EntityId, Field, Handle};
pub use error::{OrmError, OrmResult};
pub use manager::Manager;
pub use meta::{Attribute, BasicType, EntityType, EntityTypeBuilder, FieldValue, Metamodel, Type, TypeTag};
pub use persister::{EntityState, FlushOutcome, Persister};
pub use query::Query;
pub use tracker::{Change, ChangeTracker};
pub use transaction::{FlushSummary, Transaction};
