//! In-process cluster harness.
//!
//! A [`TestCluster`] is one shared log broker plus N replicas; each replica
//! owns its storage engine, its membership oracle, and an ingestion service.
//! Promotion is driven by hand through the oracles, one replica leading per
//! user partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lagoon_core::{
    ChecksumKind, ControlMessage, MessageEnvelope, Offset, PartitionId, Partitioner, Payload,
    ProducerGuid, ProducerMetadata, SchemaId, SegmentNumber, SequenceNumber, StoreVersionConfig,
    Timestamp, TopicName,
};
use lagoon_core::Limits;
use lagoon_div::checksum_update;
use lagoon_ingest::{
    IngestionConfig, IngestionService, ManualMembership, ReplicaRole,
};
use lagoon_log::LogBroker;
use lagoon_store::{PartitionStore, StorageEngine};

/// One replica: engine + oracle + service, sharing the cluster's broker.
pub struct TestReplica {
    /// This replica's storage engine.
    pub engine: StorageEngine,
    /// This replica's membership oracle.
    pub oracle: Arc<ManualMembership>,
    /// This replica's ingestion service.
    pub service: IngestionService,
}

/// A multi-replica in-process cluster.
pub struct TestCluster {
    /// The shared log transport.
    pub broker: LogBroker,
    /// The replicas.
    pub replicas: Vec<TestReplica>,
}

impl TestCluster {
    /// Creates a cluster with `replica_count` replicas and default limits.
    ///
    /// # Panics
    /// Panics when a service cannot be created.
    #[must_use]
    pub fn new(replica_count: usize) -> Self {
        Self::with_limits(replica_count, Limits::new())
    }

    /// Creates a cluster with custom limits.
    ///
    /// # Panics
    /// Panics when a service cannot be created.
    #[must_use]
    pub fn with_limits(replica_count: usize, limits: Limits) -> Self {
        init_tracing();
        let broker = LogBroker::new();
        let replicas = (0..replica_count)
            .map(|_| {
                let engine = StorageEngine::new();
                let oracle = Arc::new(ManualMembership::new());
                let service = IngestionService::new(
                    broker.clone(),
                    engine.clone(),
                    Arc::<ManualMembership>::clone(&oracle),
                    IngestionConfig::fast_for_testing(),
                    limits,
                )
                .expect("service creation");
                TestReplica {
                    engine,
                    oracle,
                    service,
                }
            })
            .collect();
        Self { broker, replicas }
    }

    /// Starts a version on every replica.
    ///
    /// # Panics
    /// Panics when a replica refuses to start the version.
    pub async fn start_version(&self, version: &StoreVersionConfig) {
        for replica in &self.replicas {
            replica
                .service
                .start_version(version.clone())
                .await
                .expect("start version");
        }
    }

    /// Makes `leader` the leader of `user_partition` and everybody else a
    /// follower.
    pub fn promote(&self, version: &StoreVersionConfig, user_partition: PartitionId, leader: usize) {
        let vt = version.version_topic();
        for (index, replica) in self.replicas.iter().enumerate() {
            let role = if index == leader {
                ReplicaRole::Leader
            } else {
                ReplicaRole::Follower
            };
            replica.oracle.set_role(&vt, user_partition, role);
        }
    }

    /// Demotes every replica of a partition.
    pub fn demote_all(&self, version: &StoreVersionConfig, user_partition: PartitionId) {
        let vt = version.version_topic();
        for replica in &self.replicas {
            replica
                .oracle
                .set_role(&vt, user_partition, ReplicaRole::Follower);
        }
    }

    /// Returns a replica's partition column for a version.
    #[must_use]
    pub fn store(
        &self,
        replica: usize,
        version: &StoreVersionConfig,
        partition: PartitionId,
    ) -> PartitionStore {
        self.replicas[replica]
            .engine
            .open_partition(&version.version_topic(), partition)
    }

    /// Reads a key from a replica's store.
    #[must_use]
    pub fn read(
        &self,
        replica: usize,
        version: &StoreVersionConfig,
        partition: PartitionId,
        key: &str,
    ) -> Option<Bytes> {
        self.store(replica, version, partition).get(key.as_bytes())
    }

    /// Stops one replica's ingestion of a version (simulating a kill when
    /// `drain` is false).
    pub async fn stop_replica(&self, replica: usize, version: &StoreVersionConfig, drain: bool) {
        self.replicas[replica]
            .service
            .stop_version(&version.store_name, version.version, drain)
            .await;
    }

    /// Restarts one replica's ingestion of a version from its checkpoints.
    ///
    /// # Panics
    /// Panics when the replica refuses to start the version.
    pub async fn restart_replica(&self, replica: usize, version: &StoreVersionConfig) {
        self.replicas[replica]
            .service
            .start_version(version.clone())
            .await
            .expect("restart version");
    }

    /// Shuts the whole cluster down.
    pub async fn shutdown(&self) {
        for replica in &self.replicas {
            replica.service.shutdown(true).await;
        }
    }
}

/// Per-partition producer state of a [`LogWriter`].
struct WriterSegment {
    segment: SegmentNumber,
    next_sequence: SequenceNumber,
    checksum: u32,
    open: bool,
}

impl Default for WriterSegment {
    fn default() -> Self {
        Self {
            segment: SegmentNumber::new(0),
            next_sequence: SequenceNumber::new(1),
            checksum: 0,
            open: false,
        }
    }
}

/// A test producer writing enveloped records into a topic.
///
/// Opens a DIV segment per partition before the first record, maintains the
/// running checksum, and routes keys through the same partitioner the
/// ingestors use.
pub struct LogWriter {
    broker: LogBroker,
    topic: TopicName,
    partition_count: u32,
    partitioner: Partitioner,
    guid: ProducerGuid,
    states: HashMap<PartitionId, WriterSegment>,
}

impl LogWriter {
    /// Creates a writer with a fresh producer GUID.
    #[must_use]
    pub fn new(broker: &LogBroker, topic: TopicName, partition_count: u32) -> Self {
        Self {
            broker: broker.clone(),
            topic,
            partition_count,
            partitioner: Partitioner::KeyHash,
            guid: ProducerGuid::random(),
            states: HashMap::new(),
        }
    }

    /// Returns the writer's producer GUID.
    #[must_use]
    pub const fn guid(&self) -> ProducerGuid {
        self.guid
    }

    /// Writes a put, routed by key.
    pub fn put(&mut self, key: &str, value: &str) {
        let partition = self.partitioner.partition_for(key.as_bytes(), self.partition_count);
        self.put_to(partition, key, value);
    }

    /// Writes a put to an explicit partition.
    pub fn put_to(&mut self, partition: PartitionId, key: &str, value: &str) {
        self.append(
            partition,
            Payload::Put {
                key: Bytes::from(key.to_string()),
                value: Bytes::from(value.to_string()),
                schema_id: SchemaId::new(1),
            },
        );
    }

    /// Writes a delete, routed by key.
    pub fn delete(&mut self, key: &str) {
        let partition = self.partitioner.partition_for(key.as_bytes(), self.partition_count);
        self.append(
            partition,
            Payload::Delete {
                key: Bytes::from(key.to_string()),
            },
        );
    }

    /// Writes a record with an explicit producer identity, bypassing the
    /// writer's own segment bookkeeping. For duplicate and gap scenarios.
    ///
    /// # Panics
    /// Panics when the topic does not exist.
    pub fn put_raw(
        &self,
        partition: PartitionId,
        key: &str,
        value: &str,
        guid: ProducerGuid,
        segment: u64,
        sequence: u64,
    ) {
        let envelope = MessageEnvelope::new(
            ProducerMetadata {
                guid,
                segment: SegmentNumber::new(segment),
                sequence: SequenceNumber::new(sequence),
                timestamp: Timestamp::now(),
            },
            Payload::Put {
                key: Bytes::from(key.to_string()),
                value: Bytes::from(value.to_string()),
                schema_id: SchemaId::new(1),
            },
        );
        self.broker
            .require(&self.topic)
            .expect("topic exists")
            .append(
                partition,
                Timestamp::now(),
                Bytes::from(key.to_string()),
                envelope.encode_to_bytes(),
            )
            .expect("append");
    }

    /// Broadcasts `StartOfPush` to every partition.
    pub fn broadcast_start_of_push(&mut self, chunking: bool) {
        self.broadcast(ControlMessage::StartOfPush {
            sorted: false,
            chunking,
            compression: lagoon_core::Compression::None,
            dict: None,
        });
    }

    /// Broadcasts `EndOfPush` to every partition, closing open segments
    /// first so batch checksums verify.
    pub fn broadcast_end_of_push(&mut self) {
        self.end_all_segments();
        self.broadcast(ControlMessage::EndOfPush);
    }

    /// Broadcasts a `TopicSwitch` to every partition.
    pub fn broadcast_topic_switch(&mut self, new_topic: TopicName, rewind_start: Timestamp) {
        self.broadcast(ControlMessage::TopicSwitch {
            source_clusters: vec!["local".to_string()],
            new_topic,
            rewind_start,
        });
    }

    /// Broadcasts a legacy `StartOfBufferReplay` to every partition.
    pub fn broadcast_start_of_buffer_replay(&mut self, offsets: Vec<Offset>, source: TopicName) {
        self.broadcast(ControlMessage::StartOfBufferReplay {
            offsets,
            source_topic: source,
        });
    }

    /// Broadcasts `StartOfIncrementalPush` to every partition.
    pub fn broadcast_start_of_incremental_push(&mut self, label: &str) {
        self.broadcast(ControlMessage::StartOfIncrementalPush {
            label: label.to_string(),
        });
    }

    /// Broadcasts `EndOfIncrementalPush` to every partition.
    pub fn broadcast_end_of_incremental_push(&mut self, label: &str) {
        self.broadcast(ControlMessage::EndOfIncrementalPush {
            label: label.to_string(),
        });
    }

    /// Closes the open segment of every partition with `EndOfSegment`.
    pub fn end_all_segments(&mut self) {
        for partition in 0..self.partition_count {
            let partition = PartitionId::new(u64::from(partition));
            let state = self.states.entry(partition).or_default();
            if !state.open {
                continue;
            }
            let checksum = state.checksum;
            self.append_in_segment(
                partition,
                Payload::Control(ControlMessage::EndOfSegment {
                    checksum,
                    is_final: true,
                }),
            );
            let state = self.states.entry(partition).or_default();
            state.open = false;
            state.segment = state.segment.next();
            state.next_sequence = SequenceNumber::new(1);
            state.checksum = 0;
        }
    }

    fn broadcast(&mut self, control: ControlMessage) {
        for partition in 0..self.partition_count {
            self.append(PartitionId::new(u64::from(partition)), Payload::Control(control.clone()));
        }
    }

    /// Appends a payload, opening the partition's segment first if needed.
    fn append(&mut self, partition: PartitionId, payload: Payload) {
        let open = self.states.entry(partition).or_default().open;
        if !open {
            self.states.entry(partition).or_default().open = true;
            self.append_in_segment(
                partition,
                Payload::Control(ControlMessage::StartOfSegment {
                    checksum_kind: ChecksumKind::Crc32,
                }),
            );
        }
        self.append_in_segment(partition, payload);
    }

    fn append_in_segment(&mut self, partition: PartitionId, payload: Payload) {
        let state = self.states.entry(partition).or_default();
        state.checksum = checksum_update(state.checksum, &payload);
        let envelope = MessageEnvelope::new(
            ProducerMetadata {
                guid: self.guid,
                segment: state.segment,
                sequence: state.next_sequence,
                timestamp: Timestamp::now(),
            },
            payload,
        );
        state.next_sequence = state.next_sequence.next();
        let key = envelope.payload.key().cloned().unwrap_or_default();
        self.broker
            .require(&self.topic)
            .expect("topic exists")
            .append(partition, Timestamp::now(), key, envelope.encode_to_bytes())
            .expect("append");
    }
}

/// Runs a complete batch push of `records` into a version topic.
pub fn run_batch_push(
    broker: &LogBroker,
    version: &StoreVersionConfig,
    records: &[(String, String)],
) {
    let mut writer = LogWriter::new(
        broker,
        version.version_topic(),
        version.leaf_partition_count(),
    );
    writer.broadcast_start_of_push(version.chunking_enabled);
    for (key, value) in records {
        writer.put(key, value);
    }
    writer.broadcast_end_of_push();
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// # Panics
/// Panics on timeout, naming `what`.
pub async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Installs the test tracing subscriber once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_opens_segments_per_partition() {
        let broker = LogBroker::new();
        let topic = TopicName::new("harness_v1");
        broker.create_topic(topic.clone(), 2).unwrap();
        let mut writer = LogWriter::new(&broker, topic.clone(), 2);

        writer.put_to(PartitionId::new(0), "a", "1");
        writer.put_to(PartitionId::new(1), "b", "2");
        writer.end_all_segments();

        let log = broker.require(&topic).unwrap();
        // Each partition: StartOfSegment, put, EndOfSegment.
        for partition in [PartitionId::new(0), PartitionId::new(1)] {
            assert_eq!(log.end_offset(partition).unwrap(), Offset::new(3));
        }
    }

    #[tokio::test]
    async fn test_cluster_boots_and_shuts_down() {
        let cluster = TestCluster::new(2);
        let version =
            StoreVersionConfig::new("boot", lagoon_core::StoreVersionNumber::new(1));
        cluster.start_version(&version).await;
        assert!(cluster.replicas[0]
            .service
            .replica_status(&version.version_topic(), PartitionId::new(0))
            .is_some());
        cluster.shutdown().await;
    }
}
