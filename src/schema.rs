//! Read-only structural snapshots of a processor tree.
//!
//! See [`SchemaNode`] for more details.

use crate::identity::Identity;
use std::collections::{BTreeMap, HashMap};

/// A read-only snapshot describing a processor or connector and its
/// children, returned by [`Processor::schema`](crate::processor::Processor::schema).
///
/// Building a `SchemaNode` is expected to be cheap — O(tree size) — since
/// it's intended for external tooling to introspect a live pipeline without
/// perturbing it.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    identity: Identity,
    kind: &'static str,
    children: BTreeMap<String, Vec<SchemaNode>>,
    metadata: HashMap<String, String>,
}

impl SchemaNode {
    /// Returns a new leaf `SchemaNode` (no children) for the given identity
    /// and connector-kind tag.
    pub fn leaf(identity: Identity, kind: &'static str) -> Self {
        SchemaNode {
            identity,
            kind,
            children: BTreeMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Adds a group of children under `group` (e.g. `"children"` for a
    /// sequence, `"routes"` for a switch).
    #[must_use]
    pub fn with_children(mut self, group: impl Into<String>, children: Vec<SchemaNode>) -> Self {
        self.children.insert(group.into(), children);
        self
    }

    /// Adds a free-form metadata entry (e.g. `"worker_count" -> "4"`).
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The identity of the processor this node describes.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The connector-kind tag, e.g. `"sequence"`, `"concurrent"`, `"switch"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The nested structural description of this node's children, keyed by
    /// group name.
    pub fn children(&self) -> &BTreeMap<String, Vec<SchemaNode>> {
        &self.children
    }

    /// The free-form metadata map attached to this node.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

#[cfg(feature = "json")]
mod ser {
    use super::SchemaNode;
    use serde::ser::SerializeMap;
    use serde::{Serialize, Serializer};

    impl Serialize for SchemaNode {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(5))?;
            map.serialize_entry("id", &self.identity.id().to_string())?;
            map.serialize_entry("name", self.identity.name())?;
            map.serialize_entry("kind", self.kind)?;
            map.serialize_entry("metadata", &self.metadata)?;
            map.serialize_entry("children", &self.children)?;
            map.end()
        }
    }
}
