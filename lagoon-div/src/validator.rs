//! Per-producer-segment continuity validation.
//!
//! Every record carries `(guid, segment, sequence)`. A segment is opened by
//! `StartOfSegment`, runs with sequence numbers increasing by one, and is
//! closed by `EndOfSegment` carrying a checksum over the segment's data
//! records. The validator enforces continuity, drops duplicates silently,
//! and maintains the running checksum.
//!
//! Tolerance is phase-dependent. Before `EndOfPush` the stream is a batch
//! push and violations are fatal. After `EndOfPush` producers restart across
//! push boundaries and rewinds can cut into the middle of a segment, so a
//! segment starting mid-stream is accepted and tracked from where it was
//! first observed.
//!
//! Duplicate suppression is a contract that must survive leader failover:
//! the whole validator state serializes into a blob that is co-committed
//! with the data it validated.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lagoon_core::{MessageEnvelope, Payload, ProducerGuid, SegmentNumber, SequenceNumber};
use lagoon_core::ControlMessage;
use tracing::{debug, warn};

use crate::error::{DivError, DivResult};

/// Validator behavior knobs derived from the store-version configuration.
#[derive(Debug, Clone, Copy)]
pub struct DivConfig {
    /// Whether sequence gaps after `EndOfPush` are tolerated (hybrid stores)
    /// or fatal (batch-only stores).
    pub tolerate_gaps_after_end_of_push: bool,
    /// Whether an `EndOfSegment` checksum mismatch after `EndOfPush` is
    /// fatal. Mismatches before `EndOfPush` are always fatal.
    pub verify_checksums: bool,
    /// Maximum segments tracked before ended segments are evicted.
    pub segments_max: usize,
}

impl Default for DivConfig {
    fn default() -> Self {
        Self {
            tolerate_gaps_after_end_of_push: true,
            verify_checksums: true,
            segments_max: 2048,
        }
    }
}

/// Outcome of validating one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivOutcome {
    /// The record is new; apply it.
    Accept,
    /// The record was already seen; drop it silently.
    Duplicate,
}

/// Tracking state for one `(guid, segment)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentState {
    /// Next expected sequence number.
    next_sequence: SequenceNumber,
    /// Running CRC32 over the segment's data records.
    checksum: u32,
    /// Whether the segment was opened by an observed `StartOfSegment`.
    started: bool,
    /// Whether `EndOfSegment` was observed.
    ended: bool,
}

/// Data integrity validator for one partition's record stream.
#[derive(Debug)]
pub struct DivValidator {
    /// Per-segment tracking state.
    segments: HashMap<(ProducerGuid, SegmentNumber), SegmentState>,
    /// Whether `EndOfPush` has been observed (arms tolerant mode).
    end_of_push: bool,
    /// Behavior knobs.
    config: DivConfig,
}

impl DivValidator {
    /// Creates a validator in the strict (pre-push-completion) phase.
    #[must_use]
    pub fn new(config: DivConfig) -> Self {
        Self {
            segments: HashMap::new(),
            end_of_push: false,
            config,
        }
    }

    /// Arms the tolerant mode that applies after `EndOfPush`.
    pub fn set_end_of_push(&mut self) {
        self.end_of_push = true;
    }

    /// Returns true once `EndOfPush` has been observed.
    #[must_use]
    pub const fn is_end_of_push(&self) -> bool {
        self.end_of_push
    }

    /// Returns the number of tracked segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Validates one record.
    ///
    /// On `Accept` the internal state has been advanced; the caller must
    /// apply the record. On `Duplicate` the record must be dropped without
    /// any downstream effect beyond advancing the log position.
    ///
    /// # Errors
    /// Returns a fatal integrity violation per the phase rules above.
    pub fn validate(&mut self, envelope: &MessageEnvelope) -> DivResult<DivOutcome> {
        let guid = envelope.producer.guid;
        let segment = envelope.producer.segment;
        let sequence = envelope.producer.sequence;
        let id = (guid, segment);

        let Some(state) = self.segments.get_mut(&id) else {
            return self.register_segment(envelope);
        };

        if sequence < state.next_sequence {
            debug!(%guid, %segment, %sequence, "dropping duplicate record");
            return Ok(DivOutcome::Duplicate);
        }

        if sequence > state.next_sequence {
            if self.end_of_push && self.config.tolerate_gaps_after_end_of_push {
                warn!(
                    %guid, %segment,
                    expected = %state.next_sequence,
                    received = %sequence,
                    "tolerating sequence gap after end of push"
                );
                state.next_sequence = sequence.next();
                Self::update_checksum(state, &envelope.payload);
                return Ok(DivOutcome::Accept);
            }
            return Err(DivError::DataGap {
                guid,
                segment,
                expected: state.next_sequence,
                received: sequence,
            });
        }

        // In-order record.
        state.next_sequence = sequence.next();

        if let Payload::Control(ControlMessage::EndOfSegment { checksum, .. }) = &envelope.payload
        {
            state.ended = true;
            if state.started && state.checksum != *checksum {
                let mismatch = DivError::ChecksumMismatch {
                    guid,
                    segment,
                    expected: *checksum,
                    actual: state.checksum,
                };
                if !self.end_of_push || self.config.verify_checksums {
                    return Err(mismatch);
                }
                warn!(%guid, %segment, "tolerating segment checksum mismatch: {mismatch}");
            }
            self.evict_ended_if_needed();
            return Ok(DivOutcome::Accept);
        }

        Self::update_checksum(state, &envelope.payload);
        Ok(DivOutcome::Accept)
    }

    /// Handles the first record seen for a `(guid, segment)`.
    fn register_segment(&mut self, envelope: &MessageEnvelope) -> DivResult<DivOutcome> {
        let guid = envelope.producer.guid;
        let segment = envelope.producer.segment;
        let sequence = envelope.producer.sequence;

        let opened_by_start = matches!(
            envelope.payload,
            Payload::Control(ControlMessage::StartOfSegment { .. })
        ) && sequence.get() == 1;

        if !opened_by_start && !self.end_of_push {
            return Err(DivError::MissingHead {
                guid,
                segment,
                sequence,
            });
        }

        let mut state = SegmentState {
            next_sequence: sequence.next(),
            checksum: 0,
            started: opened_by_start,
            ended: false,
        };
        if !opened_by_start {
            debug!(%guid, %segment, %sequence, "tracking segment from mid-stream");
            Self::update_checksum(&mut state, &envelope.payload);
        }
        self.segments.insert((guid, segment), state);
        self.evict_ended_if_needed();
        Ok(DivOutcome::Accept)
    }

    /// Folds a data payload into the segment's running checksum.
    fn update_checksum(state: &mut SegmentState, payload: &Payload) {
        state.checksum = checksum_update(state.checksum, payload);
    }

    /// Evicts ended segments once the tracked set exceeds the limit.
    fn evict_ended_if_needed(&mut self) {
        if self.segments.len() <= self.config.segments_max {
            return;
        }
        self.segments.retain(|_, state| !state.ended);
        if self.segments.len() > self.config.segments_max {
            warn!(
                tracked = self.segments.len(),
                max = self.config.segments_max,
                "validator tracking more open segments than the configured limit"
            );
        }
    }

    /// Serializes the validator state into a checkpoint blob.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Segment count bounded by segments_max.
    pub fn encode_state(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(u8::from(self.end_of_push));
        buf.put_u32_le(self.segments.len() as u32);
        for ((guid, segment), state) in &self.segments {
            buf.put_slice(guid.as_bytes());
            buf.put_u64_le(segment.get());
            buf.put_u64_le(state.next_sequence.get());
            buf.put_u32_le(state.checksum);
            buf.put_u8(u8::from(state.started));
            buf.put_u8(u8::from(state.ended));
        }
        buf.freeze()
    }

    /// Restores a validator from a checkpoint blob.
    ///
    /// # Errors
    /// Returns `StateCorrupt` on a malformed blob.
    pub fn decode_state(config: DivConfig, blob: &Bytes) -> DivResult<Self> {
        let mut buf = blob.clone();
        if buf.remaining() < 5 {
            return Err(state_corrupt("blob truncated in header"));
        }
        let end_of_push = buf.get_u8() != 0;
        let count = buf.get_u32_le() as usize;
        let mut segments = HashMap::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 16 + 8 + 8 + 4 + 2 {
                return Err(state_corrupt("blob truncated in segment entry"));
            }
            let mut guid = [0u8; 16];
            buf.copy_to_slice(&mut guid);
            let segment = SegmentNumber::new(buf.get_u64_le());
            let next_sequence = SequenceNumber::new(buf.get_u64_le());
            let checksum = buf.get_u32_le();
            let started = buf.get_u8() != 0;
            let ended = buf.get_u8() != 0;
            segments.insert(
                (ProducerGuid::from_bytes(guid), segment),
                SegmentState {
                    next_sequence,
                    checksum,
                    started,
                    ended,
                },
            );
        }
        Ok(Self {
            segments,
            end_of_push,
            config,
        })
    }
}

/// Folds one data payload into a running segment checksum.
///
/// Producers and the validator must agree on this rule byte for byte:
/// the key, then the value-bearing bytes of the payload, in payload order.
/// Control records other than the data-bearing ones contribute nothing.
#[must_use]
pub fn checksum_update(checksum: u32, payload: &Payload) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(checksum);
    match payload {
        Payload::Put { key, value, .. } => {
            hasher.update(key);
            hasher.update(value);
        }
        Payload::Delete { key } => hasher.update(key),
        Payload::Update { key, partial, .. } => {
            hasher.update(key);
            hasher.update(partial);
        }
        Payload::Chunk { key, data, .. } => {
            hasher.update(key);
            hasher.update(data);
        }
        Payload::ChunkManifest { key, .. } => hasher.update(key),
        Payload::Control(_) => return checksum,
    }
    hasher.finalize()
}

fn state_corrupt(message: &str) -> DivError {
    DivError::StateCorrupt {
        message: message.to_string(),
    }
}
