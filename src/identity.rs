//! Stable identity attached to every processor.
//!
//! See [`Identity`] for more details.

use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// An immutable (id, name, description) triple attached to every processor
/// and connector.
///
/// Two `Identity`s are equal iff their [`Uuid`]s are equal; names are purely
/// descriptive and are not required to be unique. An `Identity` never
/// changes after construction.
#[derive(Clone, Debug)]
pub struct Identity {
    id: Uuid,
    name: String,
    description: Option<String>,
}

impl Identity {
    /// Returns a new `Identity` with a freshly generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Identity {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
        }
    }

    /// Returns a new `Identity` with a freshly generated id and a
    /// description.
    pub fn with_description(name: impl Into<String>, description: impl Into<String>) -> Self {
        Identity {
            id: Uuid::new_v4(),
            name: name.into(),
            description: Some(description.into()),
        }
    }

    /// Returns the stable id of this `Identity`.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the human-readable name of this `Identity`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the description of this `Identity`, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
