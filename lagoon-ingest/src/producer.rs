//! Leader-only version-topic producer.
//!
//! The leader re-produces every non-control upstream record into the same
//! partition of the version topic. Re-produced records carry the leader's
//! own identity — its GUID and its own segment/sequence numbering — because
//! the version topic is a single-producer log per partition. Provenance is
//! preserved in the leader footer so followers can resume the upstream where
//! the leader stopped.
//!
//! Payload bytes pass through unchanged; only oversized values are split
//! when the store-version has chunking enabled.

use bytes::{Bytes, BytesMut};
use lagoon_core::{
    ChecksumKind, ControlMessage, LeaderFooter, MessageEnvelope, Offset, PartitionId, Payload,
    ProducerGuid, ProducerMetadata, SchemaId, SegmentNumber, SequenceNumber, Timestamp, TopicName,
};
use lagoon_div::checksum_update;
use lagoon_log::LogBroker;
use tracing::{debug, warn};

use crate::config::IngestionConfig;
use crate::error::{IngestionError, IngestionResult};

/// Produces records into one partition of a version topic.
pub struct VersionTopicProducer {
    broker: LogBroker,
    topic: TopicName,
    partition: PartitionId,
    guid: ProducerGuid,
    segment: SegmentNumber,
    /// Next sequence number to assign; 1 means the segment is not open yet.
    next_sequence: SequenceNumber,
    /// Running checksum over the open segment's data records.
    checksum: u32,
    segment_open: bool,
    chunking_enabled: bool,
    max_user_payload_bytes: usize,
    backoff_base: std::time::Duration,
    backoff_max: std::time::Duration,
    retries: u32,
}

impl VersionTopicProducer {
    /// Creates a producer with a fresh GUID.
    #[must_use]
    pub fn new(
        broker: LogBroker,
        topic: TopicName,
        partition: PartitionId,
        chunking_enabled: bool,
        max_user_payload_bytes: usize,
        config: &IngestionConfig,
    ) -> Self {
        Self {
            broker,
            topic,
            partition,
            guid: ProducerGuid::random(),
            segment: SegmentNumber::new(0),
            next_sequence: SequenceNumber::new(1),
            checksum: 0,
            segment_open: false,
            chunking_enabled,
            max_user_payload_bytes,
            backoff_base: config.produce_backoff_base,
            backoff_max: config.produce_backoff_max,
            retries: config.produce_retries,
        }
    }

    /// Returns the producer GUID.
    #[must_use]
    pub const fn guid(&self) -> ProducerGuid {
        self.guid
    }

    /// Re-produces one upstream data payload.
    ///
    /// Splits oversized puts into chunks when chunking is enabled. Returns
    /// the version-topic offset of the last produced record (the one whose
    /// application completes the value).
    ///
    /// # Errors
    /// Returns `ProduceFailed` after the retry budget is exhausted.
    pub async fn produce_data(
        &mut self,
        payload: Payload,
        timestamp: Timestamp,
        footer: LeaderFooter,
    ) -> IngestionResult<Offset> {
        let payloads = match &payload {
            Payload::Put {
                key,
                value,
                schema_id,
            } if self.chunking_enabled && value.len() > self.max_user_payload_bytes => {
                crate::chunking::split_value(key, value, *schema_id, self.max_user_payload_bytes)
            }
            _ => vec![payload],
        };

        let mut last = Offset::earliest();
        for payload in payloads {
            last = self
                .produce_one(payload, timestamp, Some(footer.clone()))
                .await?;
        }
        Ok(last)
    }

    /// Produces a control message (topic switches, incremental push marks).
    ///
    /// # Errors
    /// Returns `ProduceFailed` after the retry budget is exhausted.
    pub async fn produce_control(&mut self, control: ControlMessage) -> IngestionResult<Offset> {
        self.produce_one(Payload::Control(control), Timestamp::now(), None)
            .await
    }

    /// Closes the open segment with `EndOfSegment`, if any.
    ///
    /// Called on graceful drain. A demoted leader must not call this: it has
    /// already lost the right to produce, and followers tolerate the
    /// unterminated segment.
    ///
    /// # Errors
    /// Returns `ProduceFailed` after the retry budget is exhausted.
    pub async fn finish(&mut self) -> IngestionResult<Option<Offset>> {
        if !self.segment_open {
            return Ok(None);
        }
        let end = ControlMessage::EndOfSegment {
            checksum: self.checksum,
            is_final: true,
        };
        let offset = self
            .append_envelope(Payload::Control(end), Timestamp::now(), None)
            .await?;
        debug!(topic = %self.topic, partition = %self.partition, segment = %self.segment, "segment closed");
        self.segment_open = false;
        self.segment = self.segment.next();
        self.next_sequence = SequenceNumber::new(1);
        self.checksum = 0;
        Ok(Some(offset))
    }

    async fn produce_one(
        &mut self,
        payload: Payload,
        timestamp: Timestamp,
        footer: Option<LeaderFooter>,
    ) -> IngestionResult<Offset> {
        if !self.segment_open {
            self.open_segment().await?;
        }
        self.checksum = checksum_update(self.checksum, &payload);
        self.append_envelope(payload, timestamp, footer).await
    }

    async fn open_segment(&mut self) -> IngestionResult<()> {
        debug_assert!(!self.segment_open);
        debug_assert!(self.next_sequence.get() == 1);
        let start = ControlMessage::StartOfSegment {
            checksum_kind: ChecksumKind::Crc32,
        };
        self.checksum = 0;
        self.append_envelope(Payload::Control(start), Timestamp::now(), None)
            .await?;
        self.segment_open = true;
        Ok(())
    }

    /// Builds the envelope, assigns the next sequence number, and appends
    /// with exponential backoff.
    async fn append_envelope(
        &mut self,
        payload: Payload,
        timestamp: Timestamp,
        footer: Option<LeaderFooter>,
    ) -> IngestionResult<Offset> {
        let sequence = self.next_sequence;
        let key = payload.key().cloned().unwrap_or_else(Bytes::new);
        let mut envelope = MessageEnvelope::new(
            ProducerMetadata {
                guid: self.guid,
                segment: self.segment,
                sequence,
                timestamp,
            },
            payload,
        );
        if let Some(footer) = footer {
            envelope = envelope.with_footer(footer);
        }
        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);
        let value = buf.freeze();

        let mut backoff = self.backoff_base;
        let mut attempts = 0u32;
        loop {
            match self.try_append(timestamp, &key, &value) {
                Some(offset) => {
                    self.next_sequence = sequence.next();
                    return Ok(offset);
                }
                None => {
                    attempts = attempts.saturating_add(1);
                    if attempts >= self.retries {
                        return Err(IngestionError::ProduceFailed {
                            topic: self.topic.as_str().to_string(),
                            attempts,
                        });
                    }
                    warn!(
                        topic = %self.topic,
                        partition = %self.partition,
                        attempts,
                        "produce failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
    }

    fn try_append(&self, timestamp: Timestamp, key: &Bytes, value: &Bytes) -> Option<Offset> {
        let topic = self.broker.get(&self.topic)?;
        topic
            .append(self.partition, timestamp, key.clone(), value.clone())
            .ok()
    }
}

impl std::fmt::Debug for VersionTopicProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionTopicProducer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("guid", &self.guid)
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}

/// Convenience constructor for a plain put payload.
#[must_use]
pub fn put_payload(key: impl Into<Bytes>, value: impl Into<Bytes>, schema_id: SchemaId) -> Payload {
    Payload::Put {
        key: key.into(),
        value: value.into(),
        schema_id,
    }
}
