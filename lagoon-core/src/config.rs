//! Store-version configuration.
//!
//! A store-version is immutable after creation: its partition count,
//! compression, chunking, and hybrid settings are fixed for the lifetime of
//! the version. Hybrid settings only exist for versions that keep consuming
//! streaming writes after the batch push completes.

use std::collections::BTreeSet;

use crate::topic::TopicName;
use crate::types::{PartitionId, SchemaId, StoreVersionNumber};

/// Compression codec of record payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    #[default]
    None = 0,
    /// Gzip compression.
    Gzip = 1,
    /// Zstd compression.
    Zstd = 2,
    /// Zstd with a shared dictionary distributed in `StartOfPush`.
    ZstdWithDict = 3,
}

impl Compression {
    /// Creates a compression from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Zstd),
            3 => Some(Self::ZstdWithDict),
            _ => None,
        }
    }
}

/// Hybrid (batch-then-stream) settings of a store-version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridConfig {
    /// How far back the real-time topic is replayed when streaming begins.
    pub rewind_seconds: i64,
    /// Offset lag below which a replica is considered caught up; `-1` disables.
    pub offset_lag_threshold: i64,
    /// Time lag (seconds) below which a replica is considered caught up; `-1` disables.
    pub time_lag_threshold_seconds: i64,
}

impl HybridConfig {
    /// Creates hybrid settings with both lag thresholds disabled.
    #[must_use]
    pub const fn new(rewind_seconds: i64) -> Self {
        Self {
            rewind_seconds,
            offset_lag_threshold: -1,
            time_lag_threshold_seconds: -1,
        }
    }

    /// Sets the offset lag threshold.
    #[must_use]
    pub const fn with_offset_lag_threshold(mut self, threshold: i64) -> Self {
        self.offset_lag_threshold = threshold;
        self
    }

    /// Sets the time lag threshold.
    #[must_use]
    pub const fn with_time_lag_threshold_seconds(mut self, threshold: i64) -> Self {
        self.time_lag_threshold_seconds = threshold;
        self
    }
}

/// Configuration of a single store-version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreVersionConfig {
    /// Store name.
    pub store_name: String,
    /// Version number.
    pub version: StoreVersionNumber,
    /// Number of user partitions. Immutable after creation.
    pub partition_count: u32,
    /// Leaf partitions per user partition; 1 means no amplification.
    pub amplification_factor: u32,
    /// Hybrid settings; `None` for batch-only versions.
    pub hybrid: Option<HybridConfig>,
    /// Whether oversized values may be chunked.
    pub chunking_enabled: bool,
    /// Payload compression.
    pub compression: Compression,
    /// Whether segment checksums are verified on `EndOfSegment`.
    pub checksum_verification_enabled: bool,
    /// Value schemas registered for this store.
    pub registered_schemas: BTreeSet<SchemaId>,
    /// Whether unknown schema ids seen during a push register themselves.
    pub auto_register_schemas_from_push: bool,
}

impl StoreVersionConfig {
    /// Creates a batch-only version configuration.
    #[must_use]
    pub fn new(store_name: impl Into<String>, version: StoreVersionNumber) -> Self {
        let mut registered_schemas = BTreeSet::new();
        registered_schemas.insert(SchemaId::new(1));
        Self {
            store_name: store_name.into(),
            version,
            partition_count: 1,
            amplification_factor: 1,
            hybrid: None,
            chunking_enabled: false,
            compression: Compression::None,
            checksum_verification_enabled: true,
            registered_schemas,
            auto_register_schemas_from_push: false,
        }
    }

    /// Sets the partition count.
    #[must_use]
    pub const fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    /// Sets the amplification factor.
    ///
    /// # Panics
    /// Panics if `factor` is zero.
    #[must_use]
    pub fn with_amplification_factor(mut self, factor: u32) -> Self {
        assert!(factor >= 1, "amplification factor must be >= 1");
        self.amplification_factor = factor;
        self
    }

    /// Enables hybrid mode.
    #[must_use]
    pub fn with_hybrid(mut self, hybrid: HybridConfig) -> Self {
        self.hybrid = Some(hybrid);
        self
    }

    /// Enables chunking.
    #[must_use]
    pub const fn with_chunking(mut self, enabled: bool) -> Self {
        self.chunking_enabled = enabled;
        self
    }

    /// Sets the compression codec.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets checksum verification.
    #[must_use]
    pub const fn with_checksum_verification(mut self, enabled: bool) -> Self {
        self.checksum_verification_enabled = enabled;
        self
    }

    /// Enables schema auto-registration from pushes.
    #[must_use]
    pub const fn with_auto_register_schemas(mut self, enabled: bool) -> Self {
        self.auto_register_schemas_from_push = enabled;
        self
    }

    /// Returns true if this version keeps streaming after the batch push.
    #[must_use]
    pub const fn is_hybrid(&self) -> bool {
        self.hybrid.is_some()
    }

    /// Returns the version topic name.
    #[must_use]
    pub fn version_topic(&self) -> TopicName {
        TopicName::version_topic(&self.store_name, self.version)
    }

    /// Returns the real-time topic name.
    #[must_use]
    pub fn real_time_topic(&self) -> TopicName {
        TopicName::real_time_topic(&self.store_name)
    }

    /// Returns the number of leaf partitions (user partitions x amplification).
    #[must_use]
    pub const fn leaf_partition_count(&self) -> u32 {
        self.partition_count * self.amplification_factor
    }

    /// Maps a leaf partition back to its user partition.
    #[must_use]
    pub const fn user_partition(&self, leaf: PartitionId) -> PartitionId {
        PartitionId::new(leaf.get() / self.amplification_factor as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_from_byte() {
        assert_eq!(Compression::from_byte(0), Some(Compression::None));
        assert_eq!(Compression::from_byte(3), Some(Compression::ZstdWithDict));
        assert_eq!(Compression::from_byte(9), None);
    }

    #[test]
    fn test_version_config_topics() {
        let config = StoreVersionConfig::new("profiles", StoreVersionNumber::new(2));
        assert_eq!(config.version_topic().as_str(), "profiles_v2");
        assert_eq!(config.real_time_topic().as_str(), "profiles_rt");
        assert!(!config.is_hybrid());
    }

    #[test]
    fn test_hybrid_builder() {
        let config = StoreVersionConfig::new("profiles", StoreVersionNumber::new(1))
            .with_partition_count(4)
            .with_hybrid(HybridConfig::new(10).with_offset_lag_threshold(2));
        assert!(config.is_hybrid());
        let hybrid = config.hybrid.as_ref().unwrap();
        assert_eq!(hybrid.rewind_seconds, 10);
        assert_eq!(hybrid.offset_lag_threshold, 2);
        assert_eq!(hybrid.time_lag_threshold_seconds, -1);
    }

    #[test]
    fn test_amplification_mapping() {
        let config = StoreVersionConfig::new("s", StoreVersionNumber::new(1))
            .with_partition_count(2)
            .with_amplification_factor(3);
        assert_eq!(config.leaf_partition_count(), 6);
        assert_eq!(config.user_partition(PartitionId::new(0)).get(), 0);
        assert_eq!(config.user_partition(PartitionId::new(2)).get(), 0);
        assert_eq!(config.user_partition(PartitionId::new(3)).get(), 1);
        assert_eq!(config.user_partition(PartitionId::new(5)).get(), 1);
    }

    #[test]
    #[should_panic(expected = "amplification factor must be >= 1")]
    fn test_zero_amplification_panics() {
        let _ = StoreVersionConfig::new("s", StoreVersionNumber::new(1))
            .with_amplification_factor(0);
    }
}
