//! Storage engine and per-partition columns.
//!
//! The engine owns one column per `(topic, partition)`. A column is a sorted
//! key/value map plus the replica checkpoint; the two change together, under
//! one lock, so a crash between "data applied" and "progress recorded"
//! cannot be observed.
//!
//! The ingestor's drainer task is the only writer of its column, so commits
//! never contend; the lock exists for readers (query serving, tests).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use lagoon_core::{Offset, PartitionId, TopicName};
use tracing::debug;

use crate::checkpoint::ReplicaCheckpoint;
use crate::error::{StoreError, StoreResult};

/// One write operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a key.
    Put {
        /// Record key.
        key: Bytes,
        /// Record value.
        value: Bytes,
    },
    /// Remove a key. No-op if absent.
    Delete {
        /// Record key.
        key: Bytes,
    },
}

/// An atomic batch: data operations plus the checkpoint they advance to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    /// Data operations, applied in order.
    pub ops: Vec<WriteOp>,
    /// Checkpoint recorded with the batch.
    pub checkpoint: ReplicaCheckpoint,
    /// Incremental-push label the batch belongs to, if any.
    pub label: Option<String>,
}

impl WriteBatch {
    /// Creates an empty batch advancing to `checkpoint`.
    #[must_use]
    pub const fn new(checkpoint: ReplicaCheckpoint) -> Self {
        Self {
            ops: Vec::new(),
            checkpoint,
            label: None,
        }
    }

    /// Adds a put.
    pub fn put(&mut self, key: Bytes, value: Bytes) {
        self.ops.push(WriteOp::Put { key, value });
    }

    /// Adds a delete.
    pub fn delete(&mut self, key: Bytes) {
        self.ops.push(WriteOp::Delete { key });
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch carries no data operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Interior state of one partition column.
#[derive(Debug, Default)]
struct ColumnState {
    /// Sorted key/value data.
    data: BTreeMap<Bytes, Bytes>,
    /// Last committed checkpoint.
    checkpoint: Option<ReplicaCheckpoint>,
    /// Total value bytes persisted over the column's lifetime.
    bytes_persisted: u64,
}

/// One partition's column: data plus checkpoint, committed atomically.
#[derive(Debug)]
pub struct PartitionColumn {
    partition: PartitionId,
    state: RwLock<ColumnState>,
    /// Serializes commits; readers use `state` directly.
    commit_lock: Mutex<()>,
}

impl PartitionColumn {
    fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            state: RwLock::new(ColumnState::default()),
            commit_lock: Mutex::new(()),
        }
    }
}

/// Handle to one partition's column.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    column: Arc<PartitionColumn>,
}

impl PartitionStore {
    /// Commits a batch atomically: all data operations plus the checkpoint.
    ///
    /// # Errors
    /// Returns `CheckpointRegression` when the batch would move
    /// `local_vt_offset` backwards.
    pub fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let _commit = self
            .column
            .commit_lock
            .lock()
            .expect("commit lock poisoned");
        let mut state = self.column.state.write().expect("column poisoned");

        if let Some(previous) = &state.checkpoint {
            if batch.checkpoint.local_vt_offset < previous.local_vt_offset {
                return Err(StoreError::CheckpointRegression {
                    partition: self.column.partition,
                    previous: previous.local_vt_offset,
                    attempted: batch.checkpoint.local_vt_offset,
                });
            }
        }

        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => {
                    state.bytes_persisted += value.len() as u64;
                    state.data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    state.data.remove(&key);
                }
            }
        }
        state.checkpoint = Some(batch.checkpoint);
        Ok(())
    }

    /// Returns the value for a key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.column
            .state
            .read()
            .expect("column poisoned")
            .data
            .get(key)
            .cloned()
    }

    /// Returns the last committed checkpoint.
    #[must_use]
    pub fn checkpoint(&self) -> Option<ReplicaCheckpoint> {
        self.column
            .state
            .read()
            .expect("column poisoned")
            .checkpoint
            .clone()
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.column.state.read().expect("column poisoned").data.len()
    }

    /// Returns true if the column holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns total value bytes persisted over the column's lifetime.
    #[must_use]
    pub fn bytes_persisted(&self) -> u64 {
        self.column
            .state
            .read()
            .expect("column poisoned")
            .bytes_persisted
    }

    /// Returns a snapshot of all key/value pairs in key order.
    #[must_use]
    pub fn scan(&self) -> Vec<(Bytes, Bytes)> {
        self.column
            .state
            .read()
            .expect("column poisoned")
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns the committed `local_vt_offset`, or earliest if never committed.
    #[must_use]
    pub fn local_vt_offset(&self) -> Offset {
        self.checkpoint()
            .map_or(Offset::earliest(), |c| c.local_vt_offset)
    }
}

/// Process-wide storage engine: a registry of partition columns.
#[derive(Debug, Clone, Default)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug, Default)]
struct EngineInner {
    columns: RwLock<HashMap<(TopicName, PartitionId), Arc<PartitionColumn>>>,
}

impl StorageEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or creates) the column for a `(topic, partition)`.
    #[must_use]
    pub fn open_partition(&self, topic: &TopicName, partition: PartitionId) -> PartitionStore {
        let mut columns = self.inner.columns.write().expect("engine poisoned");
        let column = columns
            .entry((topic.clone(), partition))
            .or_insert_with(|| {
                debug!(topic = %topic, %partition, "opening partition column");
                Arc::new(PartitionColumn::new(partition))
            });
        PartitionStore {
            column: Arc::clone(column),
        }
    }

    /// Drops the column for a `(topic, partition)`, discarding its data.
    pub fn drop_partition(&self, topic: &TopicName, partition: PartitionId) {
        let removed = self
            .inner
            .columns
            .write()
            .expect("engine poisoned")
            .remove(&(topic.clone(), partition));
        if removed.is_some() {
            debug!(topic = %topic, %partition, "dropped partition column");
        }
    }

    /// Returns the number of open columns.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.inner.columns.read().expect("engine poisoned").len()
    }
}
