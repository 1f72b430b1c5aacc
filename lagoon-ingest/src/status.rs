//! Replica status, push status events, and ingestion counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Externally visible status of one partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaStatus {
    /// Catching up; not serving yet.
    #[default]
    Bootstrapping,
    /// Consuming normally.
    Online,
    /// Batch push finished on a batch-only version.
    Completed,
    /// A fatal error took the replica offline.
    Error,
}

/// Events on the push status stream of one partition replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatusEvent {
    /// Ingestion of the version started.
    Started,
    /// `EndOfPush` was consumed.
    EndOfPushReceived,
    /// The push completed (batch-only versions).
    Completed,
    /// Ingestion failed.
    Error {
        /// Human-readable failure description.
        message: String,
    },
    /// An incremental push opened.
    StartOfIncrementalPushReceived {
        /// Incremental push label.
        label: String,
    },
    /// An incremental push closed.
    EndOfIncrementalPushReceived {
        /// Incremental push label.
        label: String,
    },
}

/// Monotonic ingestion counters for one partition replica.
#[derive(Debug, Default)]
pub struct IngestionCounters {
    records_in: AtomicU64,
    records_persisted: AtomicU64,
    duplicates_dropped: AtomicU64,
    bytes_persisted: AtomicU64,
    rewinds_triggered: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    /// Records delivered to the drainer.
    pub records_in: u64,
    /// Records applied to the local store.
    pub records_persisted: u64,
    /// Records dropped as DIV duplicates.
    pub duplicates_dropped: u64,
    /// Value bytes applied to the local store.
    pub bytes_persisted: u64,
    /// Upstream rewinds executed.
    pub rewinds_triggered: u64,
}

impl IngestionCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a delivered record.
    pub fn record_in(&self) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a persisted record with its value size.
    pub fn record_persisted(&self, bytes: u64) {
        self.records_persisted.fetch_add(1, Ordering::Relaxed);
        self.bytes_persisted.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts a dropped duplicate.
    pub fn duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an executed rewind.
    pub fn rewind_triggered(&self) {
        self.rewinds_triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_persisted: self.records_persisted.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            bytes_persisted: self.bytes_persisted.load(Ordering::Relaxed),
            rewinds_triggered: self.rewinds_triggered.load(Ordering::Relaxed),
        }
    }
}
