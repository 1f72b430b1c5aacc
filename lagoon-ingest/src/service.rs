//! The ingestion service.
//!
//! Owns the process-wide collaborators (log broker handle, storage engine,
//! shared consumer pool, membership oracle) and one partition ingestor per
//! leaf partition of every started store-version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lagoon_core::{Limits, PartitionId, StoreVersionConfig, StoreVersionNumber, TopicName,
    PROTOCOL_VERSION};
use lagoon_log::LogBroker;
use lagoon_store::StorageEngine;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::IngestionConfig;
use crate::error::{IngestionError, IngestionResult};
use crate::ingestor::{spawn_partition_ingestor, IngestorContext, PartitionIngestorHandle};
use crate::oracle::MembershipOracle;
use crate::pool::{spawn_consumer_pool, ConsumerPoolHandle};
use crate::status::{IngestionCounters, PushStatusEvent, ReplicaStatus};

/// The per-process ingestion service.
pub struct IngestionService {
    broker: LogBroker,
    engine: StorageEngine,
    pool: ConsumerPoolHandle,
    oracle: Arc<dyn MembershipOracle>,
    config: IngestionConfig,
    limits: Limits,
    ingestors: Mutex<HashMap<(TopicName, PartitionId), PartitionIngestorHandle>>,
}

impl IngestionService {
    /// Creates a service and spawns its shared consumer pool.
    ///
    /// # Errors
    /// Fails fast when the producer fleet advertises an envelope protocol
    /// newer than this build understands: ingesting records it cannot decode
    /// would poison every partition it touches.
    pub fn new(
        broker: LogBroker,
        engine: StorageEngine,
        oracle: Arc<dyn MembershipOracle>,
        config: IngestionConfig,
        limits: Limits,
    ) -> IngestionResult<Self> {
        if config.advertised_protocol_version > PROTOCOL_VERSION {
            return Err(IngestionError::ProtocolTooOld {
                local: PROTOCOL_VERSION,
                advertised: config.advertised_protocol_version,
            });
        }
        let pool = spawn_consumer_pool(broker.clone(), &config, limits);
        Ok(Self {
            broker,
            engine,
            pool,
            oracle,
            config,
            limits,
            ingestors: Mutex::new(HashMap::new()),
        })
    }

    /// Starts ingestion for every leaf partition of a store-version.
    ///
    /// Idempotent: partitions that already have a running ingestor are left
    /// alone, so a restart after partial failure resumes the missing ones
    /// from their checkpoints.
    ///
    /// # Errors
    /// Returns an error when the pool is gone.
    pub async fn start_version(&self, version: StoreVersionConfig) -> IngestionResult<()> {
        let vt = version.version_topic();
        let leaf_count = version.leaf_partition_count();
        self.broker.ensure_topic(&vt, leaf_count);
        if version.is_hybrid() {
            self.broker.ensure_topic(&version.real_time_topic(), leaf_count);
        }
        info!(topic = %vt, partitions = leaf_count, "starting version ingestion");

        for leaf in 0..leaf_count {
            let partition = PartitionId::new(u64::from(leaf));
            let key = (vt.clone(), partition);
            if self
                .ingestors
                .lock()
                .expect("service poisoned")
                .contains_key(&key)
            {
                continue;
            }

            // Leaf partitions share their user partition's leader: the
            // oracle is consulted per user partition only.
            let user_partition = version.user_partition(partition);
            let role_rx = self.oracle.subscribe(&vt, user_partition).await;
            let handle = spawn_partition_ingestor(IngestorContext {
                version: version.clone(),
                partition,
                broker: self.broker.clone(),
                store: self.engine.open_partition(&vt, partition),
                pool: self.pool.clone(),
                role_rx,
                config: self.config.clone(),
                limits: self.limits,
            });
            self.ingestors
                .lock()
                .expect("service poisoned")
                .insert(key, handle);
        }
        Ok(())
    }

    /// Stops every ingestor of a store-version.
    pub async fn stop_version(
        &self,
        store_name: &str,
        version: StoreVersionNumber,
        drain: bool,
    ) {
        let vt = TopicName::version_topic(store_name, version);
        let handles: Vec<PartitionIngestorHandle> = {
            let mut ingestors = self.ingestors.lock().expect("service poisoned");
            let keys: Vec<_> = ingestors
                .keys()
                .filter(|(topic, _)| *topic == vt)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| ingestors.remove(&key))
                .collect()
        };
        info!(topic = %vt, count = handles.len(), drain, "stopping version ingestion");
        for handle in handles {
            if let Err(err) = handle.stop(drain).await {
                warn!(partition = %handle.partition(), %err, "ingestor already gone");
            }
        }
    }

    /// Returns the ingestor handle for a partition.
    #[must_use]
    pub fn ingestor(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Option<PartitionIngestorHandle> {
        self.ingestors
            .lock()
            .expect("service poisoned")
            .get(&(topic.clone(), partition))
            .cloned()
    }

    /// Returns a partition replica's status.
    #[must_use]
    pub fn replica_status(&self, topic: &TopicName, partition: PartitionId) -> Option<ReplicaStatus> {
        self.ingestor(topic, partition).map(|h| h.status())
    }

    /// Subscribes to a partition replica's push status events.
    #[must_use]
    pub fn push_events(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Option<broadcast::Receiver<PushStatusEvent>> {
        self.ingestor(topic, partition).map(|h| h.push_events())
    }

    /// Returns a partition replica's ingestion counters.
    #[must_use]
    pub fn counters(
        &self,
        topic: &TopicName,
        partition: PartitionId,
    ) -> Option<Arc<IngestionCounters>> {
        self.ingestor(topic, partition).map(|h| h.counters())
    }

    /// Returns the storage engine (read serving lives outside the core).
    #[must_use]
    pub const fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    /// Returns the log broker handle.
    #[must_use]
    pub const fn broker(&self) -> &LogBroker {
        &self.broker
    }

    /// Stops every ingestor and the shared pool.
    pub async fn shutdown(&self, drain: bool) {
        let handles: Vec<PartitionIngestorHandle> = {
            let mut ingestors = self.ingestors.lock().expect("service poisoned");
            ingestors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.stop(drain).await;
        }
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field(
                "ingestors",
                &self.ingestors.lock().expect("service poisoned").len(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ManualMembership;

    fn make_service(config: IngestionConfig) -> IngestionResult<IngestionService> {
        IngestionService::new(
            LogBroker::new(),
            StorageEngine::new(),
            Arc::new(ManualMembership::new()),
            config,
            Limits::new(),
        )
    }

    #[tokio::test]
    async fn test_newer_advertised_protocol_fails_fast() {
        let config = IngestionConfig::fast_for_testing()
            .with_advertised_protocol_version(PROTOCOL_VERSION + 1);
        let err = make_service(config).unwrap_err();
        assert!(matches!(err, IngestionError::ProtocolTooOld { .. }));
    }

    #[tokio::test]
    async fn test_start_version_spawns_leaf_partitions() {
        let service = make_service(IngestionConfig::fast_for_testing()).unwrap();
        let version = StoreVersionConfig::new("svc", StoreVersionNumber::new(1))
            .with_partition_count(2)
            .with_amplification_factor(2);
        service.start_version(version.clone()).await.unwrap();

        let vt = version.version_topic();
        for leaf in 0..4u64 {
            assert!(service.replica_status(&vt, PartitionId::new(leaf)).is_some());
        }
        assert!(service.replica_status(&vt, PartitionId::new(4)).is_none());
        service.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_start_version_is_idempotent() {
        let service = make_service(IngestionConfig::fast_for_testing()).unwrap();
        let version = StoreVersionConfig::new("svc", StoreVersionNumber::new(1));
        service.start_version(version.clone()).await.unwrap();
        let first = service
            .ingestor(&version.version_topic(), PartitionId::new(0))
            .unwrap();
        // Starting again must not replace the running ingestor.
        service.start_version(version.clone()).await.unwrap();
        let second = service
            .ingestor(&version.version_topic(), PartitionId::new(0))
            .unwrap();
        assert!(Arc::ptr_eq(&first.counters(), &second.counters()));
        service.stop_version("svc", StoreVersionNumber::new(1), true).await;
        assert!(service
            .replica_status(&version.version_topic(), PartitionId::new(0))
            .is_none());
    }
}
