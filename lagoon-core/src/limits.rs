//! System limits.
//!
//! Every queue, buffer, and retry loop has an explicit maximum. Unbounded
//! growth is a bug, not a configuration choice.

/// System-wide limits for the ingestion core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum user payload size before chunking kicks in.
    pub max_user_payload_bytes: u32,
    /// Maximum record key size in bytes.
    pub max_record_key_bytes: u32,
    /// Capacity of each partition's delivery queue (records).
    pub ingest_queue_records_max: u32,
    /// Maximum records folded into one local-store commit batch.
    pub commit_batch_records_max: u32,
    /// Maximum records a pool consumer delivers per subscription per cycle.
    pub pool_poll_records_max: u32,
    /// Maximum producer segments tracked per partition validator.
    pub div_segments_per_partition_max: u32,
    /// Maximum chunks buffered per in-flight chunked value.
    pub chunks_per_value_max: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // 950KB leaves room for envelope overhead under a 1MB log record cap.
            max_user_payload_bytes: 950 * 1024,
            max_record_key_bytes: 64 * 1024,
            ingest_queue_records_max: 1024,
            commit_batch_records_max: 64,
            pool_poll_records_max: 256,
            div_segments_per_partition_max: 2048,
            chunks_per_value_max: 4096,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
