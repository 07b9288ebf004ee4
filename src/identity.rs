//! [crate::identity] contains the process-local identities the cache assigns to entities before
//! (and independently of) any server identifier.
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    sync::Arc,
};

/// Name of an entity type as declared in the schema layer (e.g. `author`).
#[derive(Clone, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityType(Arc<str>);

impl EntityType {
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        EntityType(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        EntityType::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        EntityType(Arc::from(name))
    }
}

impl AsRef<str> for EntityType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque client-local entity reference.
///
/// An identity is `(entity_type, sequence)`. Sequence numbers are issued per entity type, start
/// at zero and are never reused, so an identity stays valid (and unique) for the whole in-memory
/// lifetime of the entity, whether or not the server has assigned it an identifier yet.
#[derive(Clone, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Identity {
    entity_type: EntityType,
    sequence: u64,
}

impl Identity {
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.sequence)
    }
}

/// Issues identities. One counter per entity type; counters only move forward.
#[derive(Debug, Default, Clone)]
pub struct IdentityAllocator {
    counters: BTreeMap<EntityType, u64>,
}

impl IdentityAllocator {
    pub fn allocate(&mut self, entity_type: &EntityType) -> Identity {
        let counter = self.counters.entry(entity_type.clone()).or_insert(0);
        let identity = Identity {
            entity_type: entity_type.clone(),
            sequence: *counter,
        };
        *counter += 1;
        identity
    }

    /// Number of identities handed out so far for `entity_type`.
    pub fn issued(&self, entity_type: &EntityType) -> u64 {
        self.counters.get(entity_type).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_allocate_is_per_type_and_monotonic() {
        let mut allocator = IdentityAllocator::default();
        let author = EntityType::from("author");
        let book = EntityType::from("book");

        let a0 = allocator.allocate(&author);
        let a1 = allocator.allocate(&author);
        let b0 = allocator.allocate(&book);

        assert_eq!(a0.sequence(), 0);
        assert_eq!(a1.sequence(), 1);
        assert_eq!(b0.sequence(), 0);
        assert_ne!(a0, b0, "same sequence under different types are distinct identities");
        assert_eq!(allocator.issued(&author), 2);
        assert_eq!(allocator.issued(&EntityType::from("publisher")), 0);
    }

    #[test]
    fn test_identity_display() {
        let mut allocator = IdentityAllocator::default();
        let identity = allocator.allocate(&EntityType::from("book"));
        assert_eq!(identity.to_string(), "book#0");
    }
}
