//! The per-partition replica checkpoint.
//!
//! The checkpoint is the tuple a restarting ingestor seeds itself from. It
//! travels inside every write batch, so data records and consumption
//! progress are crash-consistent by construction: either both landed or
//! neither did.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lagoon_core::{Offset, TopicName};

use crate::error::{StoreError, StoreResult};

/// Atomic consumption checkpoint of one partition replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCheckpoint {
    /// The streaming upstream topic (the version topic until a switch).
    pub upstream_topic: TopicName,
    /// Next offset to consume from the streaming upstream.
    pub upstream_offset: Offset,
    /// Next version-topic offset to apply locally.
    pub local_vt_offset: Offset,
    /// Serialized DIV validator state.
    pub div_state: Bytes,
    /// Whether `EndOfPush` has been observed.
    pub received_end_of_push: bool,
    /// How many upstream switches this replica has executed or observed.
    pub topic_switches: u32,
    /// Labels of completed incremental pushes.
    pub completed_incremental_labels: Vec<String>,
}

impl ReplicaCheckpoint {
    /// Creates the initial checkpoint for a fresh replica of a version.
    #[must_use]
    pub fn initial(version_topic: TopicName) -> Self {
        Self {
            upstream_topic: version_topic,
            upstream_offset: Offset::earliest(),
            local_vt_offset: Offset::earliest(),
            div_state: Bytes::new(),
            received_end_of_push: false,
            topic_switches: 0,
            completed_incremental_labels: Vec::new(),
        }
    }

    /// Encodes the checkpoint into a blob.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Field sizes bounded by limits.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, self.upstream_topic.as_str());
        buf.put_u64_le(self.upstream_offset.get());
        buf.put_u64_le(self.local_vt_offset.get());
        buf.put_u32_le(self.div_state.len() as u32);
        buf.put_slice(&self.div_state);
        buf.put_u8(u8::from(self.received_end_of_push));
        buf.put_u32_le(self.topic_switches);
        buf.put_u32_le(self.completed_incremental_labels.len() as u32);
        for label in &self.completed_incremental_labels {
            put_str(&mut buf, label);
        }
        buf.freeze()
    }

    /// Decodes a checkpoint blob.
    ///
    /// # Errors
    /// Returns `CheckpointCorrupt` on malformed bytes.
    pub fn decode(blob: &Bytes) -> StoreResult<Self> {
        let mut buf = blob.clone();
        let upstream_topic = TopicName::new(get_str(&mut buf)?);
        if buf.remaining() < 8 + 8 + 4 {
            return Err(corrupt("truncated in offsets"));
        }
        let upstream_offset = Offset::new(buf.get_u64_le());
        let local_vt_offset = Offset::new(buf.get_u64_le());
        let div_len = buf.get_u32_le() as usize;
        if buf.remaining() < div_len {
            return Err(corrupt("truncated in div state"));
        }
        let div_state = buf.copy_to_bytes(div_len);
        if buf.remaining() < 1 + 4 + 4 {
            return Err(corrupt("truncated in flags"));
        }
        let received_end_of_push = buf.get_u8() != 0;
        let topic_switches = buf.get_u32_le();
        let label_count = buf.get_u32_le() as usize;
        let mut completed_incremental_labels = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            completed_incremental_labels.push(get_str(&mut buf)?);
        }
        Ok(Self {
            upstream_topic,
            upstream_offset,
            local_vt_offset,
            div_state,
            received_end_of_push,
            topic_switches,
            completed_incremental_labels,
        })
    }
}

#[allow(clippy::cast_possible_truncation)] // Field sizes bounded by limits.
fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> StoreResult<String> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated before string length"));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(corrupt("truncated in string"));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("string not utf-8"))
}

fn corrupt(message: &str) -> StoreError {
    StoreError::CheckpointCorrupt {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_roundtrip() {
        let checkpoint = ReplicaCheckpoint {
            upstream_topic: TopicName::new("store_rt"),
            upstream_offset: Offset::new(42),
            local_vt_offset: Offset::new(117),
            div_state: Bytes::from_static(&[1, 2, 3]),
            received_end_of_push: true,
            topic_switches: 2,
            completed_incremental_labels: vec!["inc-1".to_string(), "inc-2".to_string()],
        };
        let decoded = ReplicaCheckpoint::decode(&checkpoint.encode()).unwrap();
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn test_initial_checkpoint() {
        let checkpoint = ReplicaCheckpoint::initial(TopicName::new("store_v1"));
        assert_eq!(checkpoint.upstream_topic.as_str(), "store_v1");
        assert_eq!(checkpoint.local_vt_offset, Offset::earliest());
        assert!(!checkpoint.received_end_of_push);
        assert!(checkpoint.completed_incremental_labels.is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let checkpoint = ReplicaCheckpoint::initial(TopicName::new("store_v1"));
        let blob = checkpoint.encode();
        let short = blob.slice(..blob.len() - 2);
        assert!(ReplicaCheckpoint::decode(&short).is_err());
    }
}
