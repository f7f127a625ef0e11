//! High-level API for cairn.
//!
//! A [`DataStore`] binds a [`Metamodel`] to a [`NodeStore`] and exposes the
//! everyday operations (persist, find, flush) of the underlying
//! [`Manager`]. Settings come from a [`DataStoreConfig`], optionally loaded
//! from TOML.

pub mod config;
pub mod datastore;
pub mod error;

pub use config::DataStoreConfig;
pub use datastore::DataStore;
pub use error::{SdkError, SdkResult};

pub use cairn_orm::{
    EntityState, EntityType, FlushSummary, Handle, Manager, ManagerConfig, Metamodel, OrmError,
};
pub use cairn_store::{InMemoryNodeStore, NodeStore, StoreError};
pub use cairn_types::{Key, Node, Value};
