//! Lagoon Log - in-process append-only partitioned log transport.
//!
//! This crate models the log transport the ingestion core consumes: named
//! topics with a fixed partition count, per-partition monotonic offsets,
//! reads by offset range, and timestamp-to-offset lookup for rewinds.
//!
//! The transport is deliberately in-process. The ingestion core treats the
//! log as an external collaborator; everything it needs is the interface
//! here, not a wire protocol.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod error;
mod log;

pub use broker::LogBroker;
pub use error::{LogError, LogResult};
pub use log::{LogEntry, PartitionLog, TopicLog};
