//! Entity identifiers and allocation strategies.
//!
//! An [`EntityId`] is an opaque identifier with no inherent data. Ids are
//! allocated by the entity registry through an [`EntityIdAllocator`], whose
//! [`IdStrategy`] decides between an incrementing counter, a random token, or
//! a time-ordered token.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchemaError;

/// A unique entity identifier.
///
/// Entities are pure identifiers and carry no data of their own. Components
/// are attached to entities to give them meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityId {
    /// Allocated from an incrementing counter. Counting starts at 1.
    Seq(u64),
    /// A random (v4) or time-ordered (v7) UUID token.
    Token(Uuid),
}

impl EntityId {
    /// Create a sequential entity id from a raw `u64`.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self::Seq(id)
    }

    /// Returns the counter value for sequential ids.
    #[must_use]
    pub const fn seq(self) -> Option<u64> {
        match self {
            Self::Seq(n) => Some(n),
            Self::Token(_) => None,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seq(n) => write!(f, "Entity({n})"),
            Self::Token(uuid) => write!(f, "Entity({uuid})"),
        }
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self::Seq(id)
    }
}

/// How fresh entity ids are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdStrategy {
    /// Monotonically increasing counter.
    #[default]
    Sequential,
    /// Random v4 UUID.
    Random,
    /// Time-ordered v7 UUID.
    TimeOrdered,
}

impl FromStr for IdStrategy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "counter" => Ok(Self::Sequential),
            "random" | "uuid" => Ok(Self::Random),
            "time_ordered" | "time-ordered" | "ordered" => Ok(Self::TimeOrdered),
            other => Err(SchemaError::UnknownIdStrategy(other.to_string())),
        }
    }
}

/// Allocates entity ids according to an [`IdStrategy`].
///
/// The allocator lives in the entity registry, which is the single source of
/// truth for entity identity.
#[derive(Debug)]
pub struct EntityIdAllocator {
    strategy: IdStrategy,
    next_id: u64,
    allocated: u64,
}

impl EntityIdAllocator {
    /// Creates a new allocator. Sequential ids start at 1.
    #[must_use]
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            next_id: 1,
            allocated: 0,
        }
    }

    /// Returns the strategy in use.
    #[must_use]
    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    /// Allocates a fresh entity id.
    pub fn allocate(&mut self) -> EntityId {
        self.allocated += 1;
        match self.strategy {
            IdStrategy::Sequential => {
                let id = self.next_id;
                self.next_id += 1;
                EntityId::Seq(id)
            }
            IdStrategy::Random => EntityId::Token(Uuid::new_v4()),
            IdStrategy::TimeOrdered => EntityId::Token(Uuid::now_v7()),
        }
    }

    /// Makes sure the counter never hands out `id` again.
    ///
    /// Used when rows are restored from a backup.
    pub fn observe(&mut self, id: EntityId) {
        if let EntityId::Seq(n) = id
            && n >= self.next_id
        {
            self.next_id = n + 1;
        }
    }

    /// Returns the number of ids allocated so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.allocated
    }
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new(IdStrategy::Sequential)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_entity_display() {
        assert_eq!(EntityId::from_raw(42).to_string(), "Entity(42)");
        assert_eq!(EntityId::from_raw(42).seq(), Some(42));
    }

    #[test]
    fn test_sequential_allocator_produces_unique_ids() {
        let mut alloc = EntityIdAllocator::new(IdStrategy::Sequential);
        assert_eq!(alloc.allocate(), EntityId::Seq(1));
        assert_eq!(alloc.allocate(), EntityId::Seq(2));
        assert_eq!(alloc.allocate(), EntityId::Seq(3));
        assert_eq!(alloc.count(), 3);
    }

    #[test]
    fn test_random_allocator_produces_tokens() {
        let mut alloc = EntityIdAllocator::new(IdStrategy::Random);
        let ids: HashSet<_> = (0..100).map(|_| alloc.allocate()).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.seq().is_none()));
    }

    #[test]
    fn test_time_ordered_ids_sort_by_creation() {
        let mut alloc = EntityIdAllocator::new(IdStrategy::TimeOrdered);
        let first = alloc.allocate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = alloc.allocate();
        assert!(first < second);
    }

    #[test]
    fn test_observe_skips_restored_ids() {
        let mut alloc = EntityIdAllocator::new(IdStrategy::Sequential);
        alloc.observe(EntityId::Seq(10));
        assert_eq!(alloc.allocate(), EntityId::Seq(11));
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("random".parse::<IdStrategy>(), Ok(IdStrategy::Random));
        assert_eq!(
            "time_ordered".parse::<IdStrategy>(),
            Ok(IdStrategy::TimeOrdered)
        );
        assert!("bogus".parse::<IdStrategy>().is_err());
    }

    #[test]
    fn test_entity_serialization_roundtrip() {
        let entity = EntityId::from_raw(999);
        let bytes = rmp_serde::to_vec(&entity).unwrap();
        let restored: EntityId = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(entity, restored);
    }
}
