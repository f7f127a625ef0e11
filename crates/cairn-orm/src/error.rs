use cairn_store::StoreError;
use cairn_types::Key;

use crate::persister::EntityState;

/// Errors from metamodel, unit-of-work and read-path operations.
#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    /// The Rust type was never registered in the metamodel.
    #[error("unknown entity type: {0}")]
    UnknownType(String),

    /// The same Rust type was registered twice.
    #[error("entity type registered twice: {0}")]
    DuplicateType(String),

    #[error("unknown attribute `{attribute}` on {entity}")]
    UnknownAttribute { entity: String, attribute: String },

    /// Write to a derived attribute.
    #[error("attribute `{attribute}` on {entity} is read-only")]
    ReadOnlyAttribute { entity: String, attribute: String },

    #[error("attribute `{attribute}` on {entity} is not a natural key")]
    NotNaturalKey { entity: String, attribute: String },

    #[error("type mismatch for {entity}.{attribute}: expected {expected}, found {found}")]
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A lifecycle change the state machine does not allow.
    #[error("illegal state transition for {entity}: {} -> {to}", state_label(.from))]
    IllegalStateTransition {
        entity: String,
        from: Option<EntityState>,
        to: EntityState,
    },

    /// An association points at an entity with no key at serialization time.
    #[error("unresolved association {entity}.{attribute}: {target} has no known key")]
    UnresolvedAssociation {
        entity: String,
        attribute: String,
        target: String,
    },

    /// Pending entities reference each other in a cycle, which a Merkle DAG
    /// cannot encode.
    #[error("cyclic association involving {0}")]
    CyclicAssociation(String),

    #[error("{0} is not managed by this transaction")]
    NotManaged(String),

    /// A stored node does not match the entity type it is read as.
    #[error("malformed node {key}: {reason}")]
    MalformedNode { key: Key, reason: String },

    #[error("association depth limit of {0} exceeded")]
    DepthExceeded(usize),

    /// Backing store failure (transport, not found, corruption).
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn state_label(state: &Option<EntityState>) -> String {
    state.map_or_else(|| "untracked".to_string(), |s| s.to_string())
}

/// Result alias for mapper operations.
pub type OrmResult<T> = Result<T, OrmError>;
