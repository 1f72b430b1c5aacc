//! Message envelope: the wire model of every record in a partitioned log.
//!
//! Each log entry's value is an encoded [`MessageEnvelope`] carrying producer
//! identity (guid, segment, sequence), a payload variant, and — for records a
//! leader re-produced into a version topic — a leader footer naming the
//! upstream position the record came from.
//!
//! The envelope schema is versioned. An ingestor whose schema is strictly
//! older than the one used by producers must fail fast; decoding therefore
//! rejects any envelope with a newer `protocol_version` before touching the
//! rest of the buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::Compression;
use crate::error::{CoreError, CoreResult};
use crate::topic::TopicName;
use crate::types::{Offset, ProducerGuid, SchemaId, SegmentNumber, SequenceNumber, Timestamp};

/// Current envelope schema version understood by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Producer identity and position attached to every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMetadata {
    /// Producer instance GUID.
    pub guid: ProducerGuid,
    /// Segment number within the producer's stream.
    pub segment: SegmentNumber,
    /// Sequence number within the segment, starting at 1.
    pub sequence: SequenceNumber,
    /// Producer-side timestamp.
    pub timestamp: Timestamp,
}

/// Provenance footer attached by a leader when re-producing an upstream
/// record into the version topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderFooter {
    /// Offset of the source record in the upstream topic.
    pub upstream_offset: Offset,
    /// The upstream topic the record was consumed from.
    pub upstream_topic: TopicName,
}

/// Kind of running checksum a producer maintains over a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChecksumKind {
    /// No checksum.
    None = 0,
    /// CRC32 over the key and payload bytes of each data record.
    #[default]
    Crc32 = 1,
}

impl ChecksumKind {
    /// Creates a checksum kind from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            _ => None,
        }
    }
}

/// Control messages embedded in the record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Opens the batch-push phase of a version.
    StartOfPush {
        /// Whether the batch data arrives sorted by key.
        sorted: bool,
        /// Whether values may arrive chunked.
        chunking: bool,
        /// Compression codec of the batch payloads.
        compression: Compression,
        /// Optional shared compression dictionary.
        dict: Option<Bytes>,
    },
    /// Closes the batch-push phase.
    EndOfPush,
    /// Legacy directive: re-source the upstream from `source_topic` at the
    /// supplied per-partition offsets.
    StartOfBufferReplay {
        /// Starting offset per partition of the source topic.
        offsets: Vec<Offset>,
        /// The topic to replay from.
        source_topic: TopicName,
    },
    /// Directive: re-source the upstream from `new_topic`, rewound to
    /// `rewind_start` (earliest when negative).
    TopicSwitch {
        /// Source clusters the new topic lives in.
        source_clusters: Vec<String>,
        /// The new upstream topic.
        new_topic: TopicName,
        /// Absolute timestamp to rewind to; negative means earliest.
        rewind_start: Timestamp,
    },
    /// Opens an incremental push identified by `label`.
    StartOfIncrementalPush {
        /// Incremental push label.
        label: String,
    },
    /// Closes the incremental push identified by `label`.
    EndOfIncrementalPush {
        /// Incremental push label.
        label: String,
    },
    /// Opens a producer segment.
    StartOfSegment {
        /// Checksum kind the producer maintains for this segment.
        checksum_kind: ChecksumKind,
    },
    /// Closes a producer segment.
    EndOfSegment {
        /// Final checksum over the segment's data records.
        checksum: u32,
        /// True when the producer will not open another segment.
        is_final: bool,
    },
}

impl ControlMessage {
    /// Returns a short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartOfPush { .. } => "StartOfPush",
            Self::EndOfPush => "EndOfPush",
            Self::StartOfBufferReplay { .. } => "StartOfBufferReplay",
            Self::TopicSwitch { .. } => "TopicSwitch",
            Self::StartOfIncrementalPush { .. } => "StartOfIncrementalPush",
            Self::EndOfIncrementalPush { .. } => "EndOfIncrementalPush",
            Self::StartOfSegment { .. } => "StartOfSegment",
            Self::EndOfSegment { .. } => "EndOfSegment",
        }
    }

    /// Returns true for the segment controls that only the DIV layer acts on.
    #[must_use]
    pub const fn is_segment_control(&self) -> bool {
        matches!(self, Self::StartOfSegment { .. } | Self::EndOfSegment { .. })
    }
}

/// Record payload: a tagged variant, not a class hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Full value write.
    Put {
        /// Record key.
        key: Bytes,
        /// Record value.
        value: Bytes,
        /// Schema the value was written with.
        schema_id: SchemaId,
    },
    /// Key deletion.
    Delete {
        /// Record key.
        key: Bytes,
    },
    /// Partial (write-compute) update.
    Update {
        /// Record key.
        key: Bytes,
        /// Partial update payload.
        partial: Bytes,
        /// Schema the partial update was written with.
        schema_id: SchemaId,
    },
    /// Embedded control message.
    Control(ControlMessage),
    /// One chunk of an oversized value.
    Chunk {
        /// Record key the chunk belongs to.
        key: Bytes,
        /// Zero-based chunk index.
        chunk_index: u32,
        /// Total number of chunks for this value.
        chunk_count: u32,
        /// Chunk bytes.
        data: Bytes,
    },
    /// Manifest closing a chunked value; persists once all chunks arrived.
    ChunkManifest {
        /// Record key the chunks belong to.
        key: Bytes,
        /// Total number of chunks.
        chunk_count: u32,
        /// Total reassembled size in bytes.
        total_bytes: u64,
        /// Schema of the reassembled value.
        schema_id: SchemaId,
    },
}

impl Payload {
    /// Returns true if this payload is a control message.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// Returns the record key for data payloads, `None` for controls.
    #[must_use]
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Self::Put { key, .. }
            | Self::Delete { key }
            | Self::Update { key, .. }
            | Self::Chunk { key, .. }
            | Self::ChunkManifest { key, .. } => Some(key),
            Self::Control(_) => None,
        }
    }
}

/// The envelope wrapping every record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Envelope schema version the producer encoded with.
    pub protocol_version: u16,
    /// Producer identity and position.
    pub producer: ProducerMetadata,
    /// Record payload.
    pub payload: Payload,
    /// Provenance footer, present on leader re-produced records.
    pub leader_footer: Option<LeaderFooter>,
}

impl MessageEnvelope {
    /// Creates an envelope at the current protocol version with no footer.
    #[must_use]
    pub const fn new(producer: ProducerMetadata, payload: Payload) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            producer,
            payload,
            leader_footer: None,
        }
    }

    /// Attaches a leader footer.
    #[must_use]
    pub fn with_footer(mut self, footer: LeaderFooter) -> Self {
        self.leader_footer = Some(footer);
        self
    }

    /// Encodes the envelope into `buf`.
    #[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.protocol_version);

        // Producer metadata.
        buf.put_slice(self.producer.guid.as_bytes());
        buf.put_u64_le(self.producer.segment.get());
        buf.put_u64_le(self.producer.sequence.get());
        buf.put_i64_le(self.producer.timestamp.as_millis());

        // Payload.
        encode_payload(&self.payload, buf);

        // Leader footer.
        match &self.leader_footer {
            Some(footer) => {
                buf.put_u8(1);
                buf.put_u64_le(footer.upstream_offset.get());
                put_str(buf, footer.upstream_topic.as_str());
            }
            None => buf.put_u8(0),
        }
    }

    /// Encodes the envelope into a fresh buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    /// Returns `ProtocolTooNew` when the envelope was encoded with a newer
    /// schema than this build understands, and `Codec` on malformed bytes.
    pub fn decode(buf: &mut impl Buf) -> CoreResult<Self> {
        if buf.remaining() < 2 {
            return Err(codec_err("envelope truncated before version"));
        }
        let protocol_version = buf.get_u16_le();
        if protocol_version > PROTOCOL_VERSION {
            return Err(CoreError::ProtocolTooNew {
                local: PROTOCOL_VERSION,
                observed: protocol_version,
            });
        }

        if buf.remaining() < 16 + 8 + 8 + 8 {
            return Err(codec_err("envelope truncated in producer metadata"));
        }
        let mut guid = [0u8; 16];
        buf.copy_to_slice(&mut guid);
        let producer = ProducerMetadata {
            guid: ProducerGuid::from_bytes(guid),
            segment: SegmentNumber::new(buf.get_u64_le()),
            sequence: SequenceNumber::new(buf.get_u64_le()),
            timestamp: Timestamp::from_millis(buf.get_i64_le()),
        };

        let payload = decode_payload(buf)?;

        if buf.remaining() < 1 {
            return Err(codec_err("envelope truncated before footer flag"));
        }
        let leader_footer = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 8 {
                    return Err(codec_err("envelope truncated in footer"));
                }
                let upstream_offset = Offset::new(buf.get_u64_le());
                let upstream_topic = TopicName::new(get_str(buf)?);
                Some(LeaderFooter {
                    upstream_offset,
                    upstream_topic,
                })
            }
            other => return Err(codec_err_owned(format!("bad footer flag {other}"))),
        };

        Ok(Self {
            protocol_version,
            producer,
            payload,
            leader_footer,
        })
    }
}

#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
fn encode_payload(payload: &Payload, buf: &mut BytesMut) {
    match payload {
        Payload::Put {
            key,
            value,
            schema_id,
        } => {
            buf.put_u8(0);
            put_bytes(buf, key);
            put_bytes(buf, value);
            buf.put_u64_le(schema_id.get());
        }
        Payload::Delete { key } => {
            buf.put_u8(1);
            put_bytes(buf, key);
        }
        Payload::Update {
            key,
            partial,
            schema_id,
        } => {
            buf.put_u8(2);
            put_bytes(buf, key);
            put_bytes(buf, partial);
            buf.put_u64_le(schema_id.get());
        }
        Payload::Control(control) => {
            buf.put_u8(3);
            encode_control(control, buf);
        }
        Payload::Chunk {
            key,
            chunk_index,
            chunk_count,
            data,
        } => {
            buf.put_u8(4);
            put_bytes(buf, key);
            buf.put_u32_le(*chunk_index);
            buf.put_u32_le(*chunk_count);
            put_bytes(buf, data);
        }
        Payload::ChunkManifest {
            key,
            chunk_count,
            total_bytes,
            schema_id,
        } => {
            buf.put_u8(5);
            put_bytes(buf, key);
            buf.put_u32_le(*chunk_count);
            buf.put_u64_le(*total_bytes);
            buf.put_u64_le(schema_id.get());
        }
    }
}

fn decode_payload(buf: &mut impl Buf) -> CoreResult<Payload> {
    if buf.remaining() < 1 {
        return Err(codec_err("payload truncated before tag"));
    }
    match buf.get_u8() {
        0 => {
            let key = get_bytes(buf)?;
            let value = get_bytes(buf)?;
            let schema_id = SchemaId::new(get_u64(buf)?);
            Ok(Payload::Put {
                key,
                value,
                schema_id,
            })
        }
        1 => Ok(Payload::Delete {
            key: get_bytes(buf)?,
        }),
        2 => {
            let key = get_bytes(buf)?;
            let partial = get_bytes(buf)?;
            let schema_id = SchemaId::new(get_u64(buf)?);
            Ok(Payload::Update {
                key,
                partial,
                schema_id,
            })
        }
        3 => Ok(Payload::Control(decode_control(buf)?)),
        4 => {
            let key = get_bytes(buf)?;
            let chunk_index = get_u32(buf)?;
            let chunk_count = get_u32(buf)?;
            let data = get_bytes(buf)?;
            Ok(Payload::Chunk {
                key,
                chunk_index,
                chunk_count,
                data,
            })
        }
        5 => {
            let key = get_bytes(buf)?;
            let chunk_count = get_u32(buf)?;
            let total_bytes = get_u64(buf)?;
            let schema_id = SchemaId::new(get_u64(buf)?);
            Ok(Payload::ChunkManifest {
                key,
                chunk_count,
                total_bytes,
                schema_id,
            })
        }
        other => Err(codec_err_owned(format!("bad payload tag {other}"))),
    }
}

#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
fn encode_control(control: &ControlMessage, buf: &mut BytesMut) {
    match control {
        ControlMessage::StartOfPush {
            sorted,
            chunking,
            compression,
            dict,
        } => {
            buf.put_u8(0);
            buf.put_u8(u8::from(*sorted));
            buf.put_u8(u8::from(*chunking));
            buf.put_u8(*compression as u8);
            match dict {
                Some(d) => {
                    buf.put_u8(1);
                    put_bytes(buf, d);
                }
                None => buf.put_u8(0),
            }
        }
        ControlMessage::EndOfPush => buf.put_u8(1),
        ControlMessage::StartOfBufferReplay {
            offsets,
            source_topic,
        } => {
            buf.put_u8(2);
            buf.put_u32_le(offsets.len() as u32);
            for offset in offsets {
                buf.put_u64_le(offset.get());
            }
            put_str(buf, source_topic.as_str());
        }
        ControlMessage::TopicSwitch {
            source_clusters,
            new_topic,
            rewind_start,
        } => {
            buf.put_u8(3);
            buf.put_u32_le(source_clusters.len() as u32);
            for cluster in source_clusters {
                put_str(buf, cluster);
            }
            put_str(buf, new_topic.as_str());
            buf.put_i64_le(rewind_start.as_millis());
        }
        ControlMessage::StartOfIncrementalPush { label } => {
            buf.put_u8(4);
            put_str(buf, label);
        }
        ControlMessage::EndOfIncrementalPush { label } => {
            buf.put_u8(5);
            put_str(buf, label);
        }
        ControlMessage::StartOfSegment { checksum_kind } => {
            buf.put_u8(6);
            buf.put_u8(*checksum_kind as u8);
        }
        ControlMessage::EndOfSegment { checksum, is_final } => {
            buf.put_u8(7);
            buf.put_u32_le(*checksum);
            buf.put_u8(u8::from(*is_final));
        }
    }
}

fn decode_control(buf: &mut impl Buf) -> CoreResult<ControlMessage> {
    if buf.remaining() < 1 {
        return Err(codec_err("control truncated before tag"));
    }
    match buf.get_u8() {
        0 => {
            if buf.remaining() < 4 {
                return Err(codec_err("StartOfPush truncated"));
            }
            let sorted = buf.get_u8() != 0;
            let chunking = buf.get_u8() != 0;
            let compression = Compression::from_byte(buf.get_u8())
                .ok_or_else(|| codec_err("bad compression byte"))?;
            let dict = match buf.get_u8() {
                0 => None,
                _ => Some(get_bytes(buf)?),
            };
            Ok(ControlMessage::StartOfPush {
                sorted,
                chunking,
                compression,
                dict,
            })
        }
        1 => Ok(ControlMessage::EndOfPush),
        2 => {
            let count = get_u32(buf)? as usize;
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(Offset::new(get_u64(buf)?));
            }
            let source_topic = TopicName::new(get_str(buf)?);
            Ok(ControlMessage::StartOfBufferReplay {
                offsets,
                source_topic,
            })
        }
        3 => {
            let count = get_u32(buf)? as usize;
            let mut source_clusters = Vec::with_capacity(count);
            for _ in 0..count {
                source_clusters.push(get_str(buf)?);
            }
            let new_topic = TopicName::new(get_str(buf)?);
            let rewind_start = Timestamp::from_millis(get_i64(buf)?);
            Ok(ControlMessage::TopicSwitch {
                source_clusters,
                new_topic,
                rewind_start,
            })
        }
        4 => Ok(ControlMessage::StartOfIncrementalPush {
            label: get_str(buf)?,
        }),
        5 => Ok(ControlMessage::EndOfIncrementalPush {
            label: get_str(buf)?,
        }),
        6 => {
            if buf.remaining() < 1 {
                return Err(codec_err("StartOfSegment truncated"));
            }
            let checksum_kind = ChecksumKind::from_byte(buf.get_u8())
                .ok_or_else(|| codec_err("bad checksum kind"))?;
            Ok(ControlMessage::StartOfSegment { checksum_kind })
        }
        7 => {
            if buf.remaining() < 5 {
                return Err(codec_err("EndOfSegment truncated"));
            }
            let checksum = buf.get_u32_le();
            let is_final = buf.get_u8() != 0;
            Ok(ControlMessage::EndOfSegment { checksum, is_final })
        }
        other => Err(codec_err_owned(format!("bad control tag {other}"))),
    }
}

#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
fn put_bytes(buf: &mut BytesMut, bytes: &Bytes) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_bytes(buf: &mut impl Buf) -> CoreResult<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(codec_err("byte field truncated"));
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_str(buf: &mut impl Buf) -> CoreResult<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| codec_err("string field not utf-8"))
}

fn get_u32(buf: &mut impl Buf) -> CoreResult<u32> {
    if buf.remaining() < 4 {
        return Err(codec_err("u32 field truncated"));
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut impl Buf) -> CoreResult<u64> {
    if buf.remaining() < 8 {
        return Err(codec_err("u64 field truncated"));
    }
    Ok(buf.get_u64_le())
}

fn get_i64(buf: &mut impl Buf) -> CoreResult<i64> {
    if buf.remaining() < 8 {
        return Err(codec_err("i64 field truncated"));
    }
    Ok(buf.get_i64_le())
}

fn codec_err(message: &'static str) -> CoreError {
    CoreError::Codec {
        message: message.to_string(),
    }
}

fn codec_err_owned(message: String) -> CoreError {
    CoreError::Codec { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_producer() -> ProducerMetadata {
        ProducerMetadata {
            guid: ProducerGuid::from_bytes([9; 16]),
            segment: SegmentNumber::new(4),
            sequence: SequenceNumber::new(17),
            timestamp: Timestamp::from_millis(1_234_567),
        }
    }

    fn roundtrip(envelope: &MessageEnvelope) -> MessageEnvelope {
        let bytes = envelope.encode_to_bytes();
        MessageEnvelope::decode(&mut bytes.clone()).unwrap()
    }

    #[test]
    fn test_put_roundtrip() {
        let envelope = MessageEnvelope::new(
            make_producer(),
            Payload::Put {
                key: Bytes::from("k1"),
                value: Bytes::from("v1"),
                schema_id: SchemaId::new(1),
            },
        );
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_footer_roundtrip() {
        let envelope = MessageEnvelope::new(
            make_producer(),
            Payload::Delete {
                key: Bytes::from("gone"),
            },
        )
        .with_footer(LeaderFooter {
            upstream_offset: Offset::new(88),
            upstream_topic: TopicName::new("store_rt"),
        });
        let decoded = roundtrip(&envelope);
        assert_eq!(decoded.leader_footer, envelope.leader_footer);
    }

    #[test]
    fn test_control_variants_roundtrip() {
        let controls = vec![
            ControlMessage::StartOfPush {
                sorted: true,
                chunking: false,
                compression: Compression::Gzip,
                dict: Some(Bytes::from("dict")),
            },
            ControlMessage::EndOfPush,
            ControlMessage::StartOfBufferReplay {
                offsets: vec![Offset::new(1), Offset::new(2)],
                source_topic: TopicName::new("store_rt"),
            },
            ControlMessage::TopicSwitch {
                source_clusters: vec!["local".to_string()],
                new_topic: TopicName::new("store_rt"),
                rewind_start: Timestamp::from_millis(-1),
            },
            ControlMessage::StartOfIncrementalPush {
                label: "inc-1".to_string(),
            },
            ControlMessage::EndOfIncrementalPush {
                label: "inc-1".to_string(),
            },
            ControlMessage::StartOfSegment {
                checksum_kind: ChecksumKind::Crc32,
            },
            ControlMessage::EndOfSegment {
                checksum: 0xDEAD_BEEF,
                is_final: true,
            },
        ];
        for control in controls {
            let envelope =
                MessageEnvelope::new(make_producer(), Payload::Control(control.clone()));
            assert_eq!(roundtrip(&envelope), envelope, "control {}", control.name());
        }
    }

    #[test]
    fn test_chunk_roundtrip() {
        let envelope = MessageEnvelope::new(
            make_producer(),
            Payload::Chunk {
                key: Bytes::from("big"),
                chunk_index: 2,
                chunk_count: 5,
                data: Bytes::from(vec![0u8; 64]),
            },
        );
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_newer_protocol_rejected() {
        let mut envelope = MessageEnvelope::new(
            make_producer(),
            Payload::Delete {
                key: Bytes::from("k"),
            },
        );
        envelope.protocol_version = PROTOCOL_VERSION + 1;
        let bytes = envelope.encode_to_bytes();
        let err = MessageEnvelope::decode(&mut bytes.clone()).unwrap_err();
        assert!(matches!(err, CoreError::ProtocolTooNew { .. }));
    }

    #[test]
    fn test_truncated_rejected() {
        let envelope = MessageEnvelope::new(
            make_producer(),
            Payload::Put {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
                schema_id: SchemaId::new(1),
            },
        );
        let bytes = envelope.encode_to_bytes();
        let mut short = bytes.slice(..bytes.len() - 3);
        assert!(MessageEnvelope::decode(&mut short).is_err());
    }

    #[test]
    fn test_payload_key() {
        let put = Payload::Put {
            key: Bytes::from("k"),
            value: Bytes::from("v"),
            schema_id: SchemaId::new(1),
        };
        assert_eq!(put.key(), Some(&Bytes::from("k")));
        assert!(Payload::Control(ControlMessage::EndOfPush).key().is_none());
        assert!(Payload::Control(ControlMessage::EndOfPush).is_control());
    }
}
