//! Partitioned topic logs.
//!
//! A topic log is a fixed set of partitions; each partition is a totally
//! ordered, append-only sequence of entries with monotonic offsets assigned
//! at append time. Readers poll by offset range and can wait on a watch
//! channel that tracks the end offset, so nobody busy-spins on an idle log.

use std::sync::RwLock;

use bytes::Bytes;
use lagoon_core::{Offset, PartitionId, Timestamp, TopicName};
use tokio::sync::watch;

use crate::error::{LogError, LogResult};

/// A single entry in a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Offset assigned at append time.
    pub offset: Offset,
    /// Timestamp assigned by the writer.
    pub timestamp: Timestamp,
    /// Record key bytes (empty for control records).
    pub key: Bytes,
    /// Record value bytes (an encoded message envelope).
    pub value: Bytes,
}

/// One partition of a topic log.
#[derive(Debug)]
pub struct PartitionLog {
    /// Entries in offset order. Offset of `entries[i]` is `i`.
    entries: RwLock<Vec<LogEntry>>,
    /// Watch channel tracking the end offset.
    end_tx: watch::Sender<u64>,
}

impl PartitionLog {
    fn new() -> Self {
        let (end_tx, _) = watch::channel(0);
        Self {
            entries: RwLock::new(Vec::new()),
            end_tx,
        }
    }

    /// Appends an entry and returns its assigned offset.
    pub fn append(&self, timestamp: Timestamp, key: Bytes, value: Bytes) -> Offset {
        let offset = {
            let mut entries = self.entries.write().expect("partition log poisoned");
            let offset = Offset::new(entries.len() as u64);
            entries.push(LogEntry {
                offset,
                timestamp,
                key,
                value,
            });
            offset
        };
        self.end_tx.send_replace(offset.get() + 1);
        offset
    }

    /// Reads up to `max` entries starting at `from`.
    ///
    /// Reading at or past the end returns an empty vec, not an error; only
    /// an offset beyond the end (a position the log never assigned and is
    /// not about to assign) is out of range.
    ///
    /// # Errors
    /// Returns `OffsetOutOfRange` when `from` is beyond the end offset.
    pub fn read(&self, from: Offset, max: u32) -> LogResult<Vec<LogEntry>> {
        let entries = self.entries.read().expect("partition log poisoned");
        let end = entries.len() as u64;
        if from.get() > end {
            return Err(LogError::OffsetOutOfRange {
                offset: from,
                end: Offset::new(end),
            });
        }
        let start = from.get() as usize;
        let stop = end.min(from.get().saturating_add(u64::from(max))) as usize;
        Ok(entries[start..stop].to_vec())
    }

    /// Returns the end offset (next offset to be assigned).
    #[must_use]
    pub fn end_offset(&self) -> Offset {
        Offset::new(*self.end_tx.borrow())
    }

    /// Returns a watch receiver tracking the end offset.
    #[must_use]
    pub fn watch_end(&self) -> watch::Receiver<u64> {
        self.end_tx.subscribe()
    }

    /// Returns the earliest offset whose entry timestamp is `>= ts`.
    ///
    /// Falls back to the end offset when every entry is older, and to the
    /// earliest offset when `ts` means "earliest" (negative).
    #[must_use]
    pub fn offset_for_timestamp(&self, ts: Timestamp) -> Offset {
        if ts.is_none() {
            return Offset::earliest();
        }
        let entries = self.entries.read().expect("partition log poisoned");
        // Timestamps are not guaranteed monotonic across producers, so scan
        // rather than binary-search.
        for entry in entries.iter() {
            if entry.timestamp >= ts {
                return entry.offset;
            }
        }
        Offset::new(entries.len() as u64)
    }
}

/// A topic: a named, fixed set of partition logs.
#[derive(Debug)]
pub struct TopicLog {
    /// Topic name.
    name: TopicName,
    /// Partition logs, indexed by partition id.
    partitions: Vec<PartitionLog>,
}

impl TopicLog {
    /// Creates a topic with the given partition count.
    #[must_use]
    pub fn new(name: TopicName, partition_count: u32) -> Self {
        let partitions = (0..partition_count).map(|_| PartitionLog::new()).collect();
        Self { name, partitions }
    }

    /// Returns the topic name.
    #[must_use]
    pub const fn name(&self) -> &TopicName {
        &self.name
    }

    /// Returns the partition count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Partition count fits u32 by construction.
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Returns a partition log.
    ///
    /// # Errors
    /// Returns `PartitionOutOfRange` for an unknown partition id.
    pub fn partition(&self, partition: PartitionId) -> LogResult<&PartitionLog> {
        self.partitions
            .get(partition.get() as usize)
            .ok_or(LogError::PartitionOutOfRange {
                partition,
                count: self.partition_count(),
            })
    }

    /// Appends an entry to a partition.
    ///
    /// # Errors
    /// Returns `PartitionOutOfRange` for an unknown partition id.
    pub fn append(
        &self,
        partition: PartitionId,
        timestamp: Timestamp,
        key: Bytes,
        value: Bytes,
    ) -> LogResult<Offset> {
        Ok(self.partition(partition)?.append(timestamp, key, value))
    }

    /// Reads up to `max` entries from a partition starting at `from`.
    ///
    /// # Errors
    /// Returns an error for an unknown partition or an offset beyond the end.
    pub fn read(&self, partition: PartitionId, from: Offset, max: u32) -> LogResult<Vec<LogEntry>> {
        self.partition(partition)?.read(from, max)
    }

    /// Returns the end offset of a partition.
    ///
    /// # Errors
    /// Returns `PartitionOutOfRange` for an unknown partition id.
    pub fn end_offset(&self, partition: PartitionId) -> LogResult<Offset> {
        Ok(self.partition(partition)?.end_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_topic() -> TopicLog {
        TopicLog::new(TopicName::new("store_v1"), 2)
    }

    fn entry_value(i: usize) -> Bytes {
        Bytes::from(format!("value-{i}"))
    }

    #[test]
    fn test_append_assigns_monotonic_offsets() {
        let topic = make_topic();
        let p = PartitionId::new(0);
        for i in 0..5 {
            let offset = topic
                .append(p, Timestamp::from_millis(i), Bytes::new(), entry_value(0))
                .unwrap();
            assert_eq!(offset.get(), u64::try_from(i).unwrap());
        }
        assert_eq!(topic.end_offset(p).unwrap(), Offset::new(5));
        // Other partition is untouched.
        assert_eq!(topic.end_offset(PartitionId::new(1)).unwrap(), Offset::new(0));
    }

    #[test]
    fn test_read_range() {
        let topic = make_topic();
        let p = PartitionId::new(0);
        for i in 0..10 {
            topic
                .append(p, Timestamp::from_millis(i), Bytes::new(), entry_value(i as usize))
                .unwrap();
        }

        let entries = topic.read(p, Offset::new(3), 4).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].offset, Offset::new(3));
        assert_eq!(entries[3].offset, Offset::new(6));

        // Reading at the end is empty, not an error.
        assert!(topic.read(p, Offset::new(10), 4).unwrap().is_empty());
        // Reading past the end is an error.
        assert!(topic.read(p, Offset::new(11), 4).is_err());
    }

    #[test]
    fn test_unknown_partition() {
        let topic = make_topic();
        let result = topic.read(PartitionId::new(9), Offset::new(0), 1);
        assert!(matches!(result, Err(LogError::PartitionOutOfRange { .. })));
    }

    #[test]
    fn test_offset_for_timestamp() {
        let topic = make_topic();
        let p = PartitionId::new(0);
        for ts in [100, 200, 300] {
            topic
                .append(p, Timestamp::from_millis(ts), Bytes::new(), Bytes::new())
                .unwrap();
        }
        let log = topic.partition(p).unwrap();
        assert_eq!(log.offset_for_timestamp(Timestamp::from_millis(150)), Offset::new(1));
        assert_eq!(log.offset_for_timestamp(Timestamp::from_millis(300)), Offset::new(2));
        // Older than everything: start from the beginning.
        assert_eq!(log.offset_for_timestamp(Timestamp::from_millis(50)), Offset::new(0));
        // Newer than everything: start from the end.
        assert_eq!(log.offset_for_timestamp(Timestamp::from_millis(999)), Offset::new(3));
        // Earliest sentinel.
        assert_eq!(log.offset_for_timestamp(Timestamp::none()), Offset::new(0));
    }

    #[tokio::test]
    async fn test_watch_end_signals_appends() {
        let topic = make_topic();
        let p = PartitionId::new(0);
        let mut rx = topic.partition(p).unwrap().watch_end();
        assert_eq!(*rx.borrow(), 0);

        topic
            .append(p, Timestamp::from_millis(1), Bytes::new(), Bytes::new())
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
