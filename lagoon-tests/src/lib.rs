//! Lagoon Tests - end-to-end scenarios for the ingestion core.
//!
//! The harness wires an in-process log broker to multiple replicas, each
//! with its own storage engine, membership oracle, and ingestion service.
//! Tests drive pushes and streams through [`harness::LogWriter`] and assert
//! on what every replica persisted.
//!
//! Test modules:
//!
//! - `hybrid_tests`: batch-then-stream semantics, rewind boundaries, chunking
//! - `div_tests`: duplicate suppression and tolerance across the push boundary
//! - `switch_tests`: topic switch honoring, legacy buffer replay
//! - `failover_tests`: leader churn, restart resume, replica convergence

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod harness;

#[cfg(test)]
mod failover_tests;
