use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::value::Value;

/// One immutable unit of stored content: an ordered mapping from attribute
/// name to [`Value`].
///
/// Field order is significant. It is part of the canonical encoding and so
/// part of the content key; the object mapper always emits fields in the
/// declaration order of the entity type's attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node {
    fields: Vec<(String, Value)>,
}

impl Node {
    /// Create an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. An existing field with the same name is replaced in
    /// place and keeps its position; a new field is appended.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Deterministic byte encoding used for content addressing.
    ///
    /// Fails on NaN and infinite floats, which JSON cannot represent.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, TypeError> {
        let non_finite = self
            .fields
            .iter()
            .find(|(_, v)| v.as_float().is_some_and(|f| !f.is_finite()));
        if let Some((name, value)) = non_finite {
            return Err(TypeError::Serialization(format!(
                "field `{name}` holds non-finite float {value:?}"
            )));
        }
        serde_json::to_vec(self).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Decode a node previously produced by [`canonical_bytes`](Self::canonical_bytes).
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        serde_json::from_slice(bytes).map_err(|e| TypeError::Serialization(e.to_string()))
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Node {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut node = Self::new();
        for (name, value) in iter {
            node.insert(name, value);
        }
        node
    }
}
