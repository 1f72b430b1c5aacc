//! Lagoon Store - the local key/value storage engine.
//!
//! Each partition replica persists its records into a partition column that
//! supports atomic batch commits. Every batch carries the replica checkpoint
//! (consumption offsets, DIV state, push flags), so data and progress are
//! crash-consistent: restart always resumes from a state the data agrees
//! with.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checkpoint;
mod engine;
mod error;

pub use checkpoint::ReplicaCheckpoint;
pub use engine::{PartitionStore, StorageEngine, WriteBatch, WriteOp};
pub use error::{StoreError, StoreResult};
