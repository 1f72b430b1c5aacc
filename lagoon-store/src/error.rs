//! Storage error types.

use lagoon_core::{Offset, PartitionId};

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A commit tried to move the version-topic offset backwards.
    CheckpointRegression {
        /// Partition whose checkpoint regressed.
        partition: PartitionId,
        /// Offset recorded by the previous commit.
        previous: Offset,
        /// Offset the rejected commit carried.
        attempted: Offset,
    },
    /// A checkpoint blob failed to decode.
    CheckpointCorrupt {
        /// What failed.
        message: String,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CheckpointRegression {
                partition,
                previous,
                attempted,
            } => write!(
                f,
                "checkpoint regression on {partition}: {attempted} < {previous}"
            ),
            Self::CheckpointCorrupt { message } => {
                write!(f, "corrupt checkpoint: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}
