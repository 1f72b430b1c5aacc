//! Key partitioning.
//!
//! A store-version pins its partitioner at creation. Every writer and every
//! ingestor must use the same function, otherwise keys land on the wrong
//! partitions and re-produced records diverge from their source.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::PartitionId;

/// Partitioner strategy pinned by a store-version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioner {
    /// Hash the key to select a partition.
    #[default]
    KeyHash,
}

impl Partitioner {
    /// Returns the user partition for a key.
    ///
    /// # Panics
    /// Panics if `partition_count` is zero.
    #[must_use]
    pub fn partition_for(self, key: &[u8], partition_count: u32) -> PartitionId {
        assert!(partition_count > 0, "partition count must be positive");
        match self {
            Self::KeyHash => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                PartitionId::new(hasher.finish() % u64::from(partition_count))
            }
        }
    }

    /// Returns the leaf partition for a key under amplification.
    ///
    /// A user partition is split into `amplification_factor` leaf partitions;
    /// leaf `user * factor + sub` stores the keys whose secondary hash lands
    /// on `sub`. All leaves of a user partition share that partition's
    /// leader.
    #[must_use]
    pub fn leaf_partition_for(
        self,
        key: &[u8],
        partition_count: u32,
        amplification_factor: u32,
    ) -> PartitionId {
        let user = self.partition_for(key, partition_count);
        if amplification_factor <= 1 {
            return user;
        }
        let mut hasher = DefaultHasher::new();
        // Salt so that the sub-partition hash is independent of the user hash.
        0xA5u8.hash(&mut hasher);
        key.hash(&mut hasher);
        let sub = hasher.finish() % u64::from(amplification_factor);
        PartitionId::new(user.get() * u64::from(amplification_factor) + sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_partition() {
        let p = Partitioner::KeyHash;
        assert_eq!(
            p.partition_for(b"user-123", 16),
            p.partition_for(b"user-123", 16)
        );
    }

    #[test]
    fn test_partition_in_range() {
        let p = Partitioner::KeyHash;
        for i in 0..100u32 {
            let key = format!("key-{i}");
            assert!(p.partition_for(key.as_bytes(), 7).get() < 7);
        }
    }

    #[test]
    fn test_leaf_partition_shares_user_partition() {
        let p = Partitioner::KeyHash;
        for i in 0..100u32 {
            let key = format!("key-{i}");
            let user = p.partition_for(key.as_bytes(), 4);
            let leaf = p.leaf_partition_for(key.as_bytes(), 4, 3);
            assert_eq!(leaf.get() / 3, user.get());
        }
    }

    #[test]
    fn test_no_amplification_is_identity() {
        let p = Partitioner::KeyHash;
        assert_eq!(
            p.leaf_partition_for(b"k", 8, 1),
            p.partition_for(b"k", 8)
        );
    }

    #[test]
    #[should_panic(expected = "partition count must be positive")]
    fn test_zero_partitions_panics() {
        let _ = Partitioner::KeyHash.partition_for(b"k", 0);
    }
}
