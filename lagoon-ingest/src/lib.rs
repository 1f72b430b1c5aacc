//! Lagoon Ingest - the leader/follower partition ingestion core.
//!
//! Every partition of a store-version is served by one partition ingestor
//! per replica. Followers consume the version topic; the leader consumes an
//! upstream (the version topic during batch push, the real-time topic after
//! a switch) and re-produces what it reads into the version topic, which is
//! the authoritative ordering for everybody.
//!
//! # Components
//!
//! - [`IngestionService`]: process-level composition and lifecycle
//! - [`spawn_partition_ingestor`]: the per-partition drainer actor
//! - [`VersionTopicProducer`]: leader-only re-production with provenance
//! - [`spawn_consumer_pool`]: process-wide shared log consumers
//! - [`MembershipOracle`]: role signals (leader election lives elsewhere)

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod chunking;
mod config;
mod control;
mod error;
mod ingestor;
mod oracle;
mod pool;
mod producer;
mod service;
mod status;

pub use chunking::{split_value, ChunkAssembler};
pub use config::IngestionConfig;
pub use control::{interpret, ControlDirective, SwitchDirective};
pub use error::{IngestionError, IngestionResult};
pub use ingestor::{
    spawn_partition_ingestor, IngestorCommand, IngestorContext, PartitionIngestorHandle,
};
pub use oracle::{ManualMembership, MembershipOracle, ReplicaRole};
pub use pool::{spawn_consumer_pool, ConsumerPoolHandle, DeliveredRecord, SubscriptionId};
pub use producer::{put_payload, VersionTopicProducer};
pub use service::IngestionService;
pub use status::{CountersSnapshot, IngestionCounters, PushStatusEvent, ReplicaStatus};
