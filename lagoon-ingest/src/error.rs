//! Ingestion error types.
//!
//! Errors are split into fatal and transient. A fatal error moves the
//! replica to `Error` status and takes the partition offline; a transient
//! error is retried with backoff and never loses data.

use lagoon_core::{CoreError, SchemaId};
use lagoon_div::DivError;
use lagoon_store::StoreError;

/// Result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Ingestion errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestionError {
    /// A data integrity violation the validator classified as fatal.
    #[error("data integrity violation: {0}")]
    Integrity(#[from] DivError),

    /// A record or checkpoint failed to decode.
    #[error("codec: {0}")]
    Codec(#[from] CoreError),

    /// The upstream topic is not available (yet).
    #[error("upstream unavailable: {topic}")]
    UpstreamUnavailable {
        /// Topic name.
        topic: String,
    },

    /// Producing to the version topic failed even after retries.
    #[error("produce to {topic} failed after {attempts} attempts")]
    ProduceFailed {
        /// Topic name.
        topic: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The local store rejected a commit.
    #[error("local store commit failed: {0}")]
    CommitFailed(#[from] StoreError),

    /// A record carried a schema this store has not registered.
    #[error("unknown value schema {schema_id}")]
    SchemaUnknown {
        /// The unregistered schema id.
        schema_id: SchemaId,
    },

    /// Producers advertise a newer envelope schema than this build supports.
    #[error("advertised envelope protocol {advertised} is newer than supported {local}")]
    ProtocolTooOld {
        /// Protocol version compiled into this build.
        local: u16,
        /// Protocol version advertised by producers.
        advertised: u16,
    },

    /// Chunk reassembly failed.
    #[error("chunk assembly failed: {message}")]
    ChunkAssembly {
        /// What failed.
        message: String,
    },

    /// The partition ingestor has shut down.
    #[error("partition ingestor has shut down")]
    IngestorShutdown,

    /// The shared consumer pool has shut down.
    #[error("consumer pool has shut down")]
    PoolShutdown,
}

impl IngestionError {
    /// Returns true when the error must take the partition offline.
    ///
    /// Transient errors (an upstream that is not reachable right now) are
    /// retried with backoff instead.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::IngestorShutdown | Self::PoolShutdown
        )
    }
}
