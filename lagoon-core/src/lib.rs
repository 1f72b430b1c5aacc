//! Lagoon Core - shared types for the leader/follower ingestion core.
//!
//! This crate defines the vocabulary the rest of the system speaks:
//!
//! - Strongly-typed identifiers (`PartitionId`, `StoreVersionNumber`, ...)
//! - The topic naming scheme (`<store>_v<n>`, `<store>_rt`)
//! - The versioned message envelope and its control messages
//! - The key partitioner every writer and ingestor must agree on
//! - Explicit system limits
//!
//! No I/O happens here; everything is plain data and codecs.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod envelope;
mod error;
mod limits;
mod partitioner;
mod topic;
mod types;

pub use config::{Compression, HybridConfig, StoreVersionConfig};
pub use envelope::{
    ChecksumKind, ControlMessage, LeaderFooter, MessageEnvelope, Payload, ProducerMetadata,
    PROTOCOL_VERSION,
};
pub use error::{CoreError, CoreResult};
pub use limits::Limits;
pub use partitioner::Partitioner;
pub use topic::TopicName;
pub use types::{
    Offset, PartitionId, ProducerGuid, SchemaId, SegmentNumber, SequenceNumber,
    StoreVersionNumber, Timestamp,
};
