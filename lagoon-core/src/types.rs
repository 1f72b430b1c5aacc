//! Strongly-typed identifiers for Lagoon entities.
//!
//! Explicit wrapper types prevent bugs from mixing up IDs: a partition id is
//! not a version number is not a schema id, even though all of them are small
//! integers on the wire.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `PartitionId` with `StoreVersionNumber`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Store and partition identification.
define_id!(
    StoreVersionNumber,
    "v",
    "Version number of a store-version. Immutable once created."
);
define_id!(
    PartitionId,
    "partition",
    "Identifier for a partition within a topic."
);

// Producer segment tracking.
define_id!(
    SegmentNumber,
    "seg",
    "Segment number within a producer's stream. The unit of data integrity validation."
);
define_id!(
    SequenceNumber,
    "seq",
    "Sequence number of a record within a producer segment. Starts at 1."
);

// Schema registry surface.
define_id!(SchemaId, "schema", "Identifier for a registered value schema.");

/// Offset in a partitioned log.
///
/// Offsets are monotonic within a single topic-partition and are assigned by
/// the log transport on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// Creates an offset from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next offset.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the offset for "earliest" (beginning of log).
    #[must_use]
    pub const fn earliest() -> Self {
        Self(0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp in milliseconds since the Unix epoch.
///
/// A negative value means "no timestamp"; `-1` is also the conventional
/// rewind-start meaning "from the earliest available offset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns the current time as a timestamp.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Timestamps won't overflow i64 for centuries.
    pub fn now() -> Self {
        let duration = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Creates a timestamp representing "no timestamp" / "earliest".
    #[must_use]
    pub const fn none() -> Self {
        Self(-1)
    }

    /// Returns true if this represents "no timestamp" / "earliest".
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }

    /// Returns this timestamp moved back by the given number of seconds,
    /// saturating at zero.
    #[must_use]
    pub const fn rewound_by_seconds(self, seconds: i64) -> Self {
        let millis = self.0 - seconds.saturating_mul(1000);
        Self(if millis < 0 { 0 } else { millis })
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a producer instance.
///
/// Every writer (push job, streaming producer, or a leader re-producing into
/// the version topic) carries its own GUID; data integrity validation is
/// scoped to `(guid, segment)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProducerGuid([u8; 16]);

impl ProducerGuid {
    /// Creates a GUID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Generates a fresh random GUID.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for ProducerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guid(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for ProducerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let version = StoreVersionNumber::new(1);
        let partition = PartitionId::new(1);

        // These are different types even with same value.
        assert_eq!(version.get(), partition.get());
    }

    #[test]
    fn test_id_display() {
        let partition = PartitionId::new(42);
        assert_eq!(format!("{partition}"), "partition-42");
        assert_eq!(format!("{partition:?}"), "partition(42)");
    }

    #[test]
    fn test_sequence_next() {
        let seq = SequenceNumber::new(1);
        assert_eq!(seq.next().get(), 2);
        assert_eq!(seq.next().next().get(), 3);
    }

    #[test]
    fn test_offset_ordering() {
        let a = Offset::new(1);
        let b = Offset::new(2);
        assert!(a < b);
        assert_eq!(a.next(), b);
    }

    #[test]
    fn test_timestamp_none() {
        let none = Timestamp::none();
        assert!(none.is_none());
        assert!(!Timestamp::from_millis(1000).is_none());
    }

    #[test]
    fn test_timestamp_rewind() {
        let ts = Timestamp::from_millis(10_000);
        assert_eq!(ts.rewound_by_seconds(3).as_millis(), 7_000);
        assert_eq!(ts.rewound_by_seconds(100).as_millis(), 0);
    }

    #[test]
    fn test_guid_roundtrip() {
        let guid = ProducerGuid::from_bytes([7; 16]);
        assert_eq!(guid.as_bytes(), &[7; 16]);
        assert_eq!(format!("{guid}").len(), 32);
    }

    #[test]
    fn test_guid_random_distinct() {
        assert_ne!(ProducerGuid::random(), ProducerGuid::random());
    }
}
