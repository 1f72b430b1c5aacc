//! Ingestion service configuration.

use std::time::Duration;

use lagoon_core::PROTOCOL_VERSION;

/// Configuration shared by every ingestor the service spawns.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Grace period before a newly promoted leader starts acting as one,
    /// letting the prior leader's in-flight produces drain.
    pub promotion_delay: Duration,
    /// Number of shared consumers in the pool.
    pub consumer_pool_size: usize,
    /// How long a pool consumer sleeps when none of its subscriptions had
    /// data to deliver.
    pub poll_interval: Duration,
    /// Buffer size of actor command channels.
    pub channel_buffer: usize,
    /// Base delay of the produce retry backoff.
    pub produce_backoff_base: Duration,
    /// Ceiling of the produce retry backoff.
    pub produce_backoff_max: Duration,
    /// Produce attempts before giving up. The default is effectively
    /// infinite; a produce that cannot succeed is a cluster-level outage.
    pub produce_retries: u32,
    /// Budget for a non-draining stop before in-flight work is abandoned
    /// and replayed on the next start.
    pub drain_abort_budget: Duration,
    /// Envelope protocol version advertised by the producer fleet. The
    /// service refuses to start when this is newer than the build supports.
    pub advertised_protocol_version: u16,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            promotion_delay: Duration::from_secs(3),
            consumer_pool_size: 3,
            poll_interval: Duration::from_millis(10),
            channel_buffer: 64,
            produce_backoff_base: Duration::from_millis(10),
            produce_backoff_max: Duration::from_secs(5),
            produce_retries: u32::MAX,
            drain_abort_budget: Duration::from_secs(30),
            advertised_protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl IngestionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the promotion delay.
    #[must_use]
    pub const fn with_promotion_delay(mut self, delay: Duration) -> Self {
        self.promotion_delay = delay;
        self
    }

    /// Sets the consumer pool size.
    #[must_use]
    pub const fn with_consumer_pool_size(mut self, size: usize) -> Self {
        self.consumer_pool_size = size;
        self
    }

    /// Sets the advertised envelope protocol version.
    #[must_use]
    pub const fn with_advertised_protocol_version(mut self, version: u16) -> Self {
        self.advertised_protocol_version = version;
        self
    }

    /// Creates a configuration with timings suitable for tests.
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            promotion_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(2),
            produce_backoff_base: Duration::from_millis(1),
            produce_backoff_max: Duration::from_millis(50),
            drain_abort_budget: Duration::from_secs(2),
            ..Self::default()
        }
    }
}
