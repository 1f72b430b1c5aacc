//! Log transport error types.

use lagoon_core::{Offset, PartitionId};

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Log transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The topic does not exist.
    TopicNotFound {
        /// Topic name.
        name: String,
    },
    /// The topic already exists.
    TopicExists {
        /// Topic name.
        name: String,
    },
    /// The partition id is outside the topic's partition count.
    PartitionOutOfRange {
        /// Requested partition.
        partition: PartitionId,
        /// Partition count of the topic.
        count: u32,
    },
    /// The offset is outside the log's range.
    OffsetOutOfRange {
        /// Requested offset.
        offset: Offset,
        /// End offset of the log.
        end: Offset,
    },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TopicNotFound { name } => write!(f, "topic not found: {name}"),
            Self::TopicExists { name } => write!(f, "topic already exists: {name}"),
            Self::PartitionOutOfRange { partition, count } => {
                write!(f, "partition {partition} out of range (count {count})")
            }
            Self::OffsetOutOfRange { offset, end } => {
                write!(f, "offset {offset} out of range (end {end})")
            }
        }
    }
}

impl std::error::Error for LogError {}
