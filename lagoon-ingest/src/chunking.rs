//! Chunk splitting and reassembly.
//!
//! Values larger than `max_user_payload_bytes` cannot travel as one log
//! record. The producer splits them into chunk records followed by a
//! manifest; the ingestor buffers chunks per `(producer, key)` and persists
//! the reassembled value when the manifest arrives. Codec internals (how a
//! chunked value is laid out inside the store) stay out of the core: the
//! reassembled bytes are persisted like any other value.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use lagoon_core::{Payload, ProducerGuid, SchemaId};

use crate::error::{IngestionError, IngestionResult};

/// Splits an oversized value into chunk payloads plus a closing manifest.
///
/// Values at or under `max_bytes` are returned as a single `Put`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Chunk counts bounded by limits.
pub fn split_value(
    key: &Bytes,
    value: &Bytes,
    schema_id: SchemaId,
    max_bytes: usize,
) -> Vec<Payload> {
    if value.len() <= max_bytes {
        return vec![Payload::Put {
            key: key.clone(),
            value: value.clone(),
            schema_id,
        }];
    }

    let chunk_count = value.len().div_ceil(max_bytes) as u32;
    let mut payloads = Vec::with_capacity(chunk_count as usize + 1);
    for (index, chunk) in value.chunks(max_bytes).enumerate() {
        payloads.push(Payload::Chunk {
            key: key.clone(),
            chunk_index: index as u32,
            chunk_count,
            data: value.slice_ref(chunk),
        });
    }
    payloads.push(Payload::ChunkManifest {
        key: key.clone(),
        chunk_count,
        total_bytes: value.len() as u64,
        schema_id,
    });
    payloads
}

/// Buffers in-flight chunks until their manifest arrives.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    pending: HashMap<(ProducerGuid, Bytes), Vec<Option<Bytes>>>,
    /// Maximum chunks per value.
    chunks_max: u32,
}

impl ChunkAssembler {
    /// Creates an assembler bounded at `chunks_max` chunks per value.
    #[must_use]
    pub fn new(chunks_max: u32) -> Self {
        Self {
            pending: HashMap::new(),
            chunks_max,
        }
    }

    /// Buffers one chunk.
    ///
    /// # Errors
    /// Returns `ChunkAssembly` on inconsistent chunk metadata.
    pub fn accept_chunk(
        &mut self,
        guid: ProducerGuid,
        key: &Bytes,
        chunk_index: u32,
        chunk_count: u32,
        data: Bytes,
    ) -> IngestionResult<()> {
        if chunk_count == 0 || chunk_count > self.chunks_max {
            return Err(assembly_err(format!(
                "chunk count {chunk_count} outside (0, {}]",
                self.chunks_max
            )));
        }
        if chunk_index >= chunk_count {
            return Err(assembly_err(format!(
                "chunk index {chunk_index} >= count {chunk_count}"
            )));
        }
        let slots = self
            .pending
            .entry((guid, key.clone()))
            .or_insert_with(|| vec![None; chunk_count as usize]);
        if slots.len() != chunk_count as usize {
            return Err(assembly_err(format!(
                "chunk count changed mid-value: {} != {chunk_count}",
                slots.len()
            )));
        }
        slots[chunk_index as usize] = Some(data);
        Ok(())
    }

    /// Closes a chunked value, returning the reassembled bytes.
    ///
    /// # Errors
    /// Returns `ChunkAssembly` when chunks are missing or sizes disagree.
    pub fn complete(
        &mut self,
        guid: ProducerGuid,
        key: &Bytes,
        chunk_count: u32,
        total_bytes: u64,
    ) -> IngestionResult<Bytes> {
        let slots = self
            .pending
            .remove(&(guid, key.clone()))
            .ok_or_else(|| assembly_err("manifest without any chunks".to_string()))?;
        if slots.len() != chunk_count as usize {
            return Err(assembly_err(format!(
                "manifest expects {chunk_count} chunks, buffered {}",
                slots.len()
            )));
        }
        let mut value = BytesMut::with_capacity(total_bytes as usize);
        for (index, slot) in slots.into_iter().enumerate() {
            let chunk = slot.ok_or_else(|| assembly_err(format!("missing chunk {index}")))?;
            value.extend_from_slice(&chunk);
        }
        if value.len() as u64 != total_bytes {
            return Err(assembly_err(format!(
                "reassembled {} bytes, manifest says {total_bytes}",
                value.len()
            )));
        }
        Ok(value.freeze())
    }

    /// Returns the number of values currently being assembled.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

fn assembly_err(message: String) -> IngestionError {
    IngestionError::ChunkAssembly { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid() -> ProducerGuid {
        ProducerGuid::from_bytes([3; 16])
    }

    #[test]
    fn test_small_value_stays_put() {
        let payloads = split_value(
            &Bytes::from("k"),
            &Bytes::from("small"),
            SchemaId::new(1),
            1024,
        );
        assert_eq!(payloads.len(), 1);
        assert!(matches!(payloads[0], Payload::Put { .. }));
    }

    #[test]
    fn test_split_and_reassemble() {
        let key = Bytes::from("big-key");
        let value = Bytes::from(vec![7u8; 2500]);
        let payloads = split_value(&key, &value, SchemaId::new(1), 1000);
        // 3 chunks + manifest.
        assert_eq!(payloads.len(), 4);

        let mut assembler = ChunkAssembler::new(16);
        for payload in &payloads {
            match payload {
                Payload::Chunk {
                    key,
                    chunk_index,
                    chunk_count,
                    data,
                } => assembler
                    .accept_chunk(guid(), key, *chunk_index, *chunk_count, data.clone())
                    .unwrap(),
                Payload::ChunkManifest {
                    key,
                    chunk_count,
                    total_bytes,
                    ..
                } => {
                    let reassembled = assembler
                        .complete(guid(), key, *chunk_count, *total_bytes)
                        .unwrap();
                    assert_eq!(reassembled, value);
                }
                _ => panic!("unexpected payload"),
            }
        }
        assert_eq!(assembler.in_flight(), 0);
    }

    #[test]
    fn test_missing_chunk_detected() {
        let mut assembler = ChunkAssembler::new(16);
        let key = Bytes::from("k");
        assembler
            .accept_chunk(guid(), &key, 0, 2, Bytes::from("aa"))
            .unwrap();
        // Chunk 1 never arrives.
        let err = assembler.complete(guid(), &key, 2, 4).unwrap_err();
        assert!(matches!(err, IngestionError::ChunkAssembly { .. }));
    }

    #[test]
    fn test_chunk_metadata_validated() {
        let mut assembler = ChunkAssembler::new(4);
        let key = Bytes::from("k");
        assert!(assembler
            .accept_chunk(guid(), &key, 5, 2, Bytes::new())
            .is_err());
        assert!(assembler
            .accept_chunk(guid(), &key, 0, 100, Bytes::new())
            .is_err());
    }

    #[test]
    fn test_distinct_producers_do_not_collide() {
        let mut assembler = ChunkAssembler::new(16);
        let key = Bytes::from("k");
        let other = ProducerGuid::from_bytes([9; 16]);
        assembler
            .accept_chunk(guid(), &key, 0, 1, Bytes::from("a"))
            .unwrap();
        assembler
            .accept_chunk(other, &key, 0, 1, Bytes::from("b"))
            .unwrap();
        assert_eq!(
            assembler.complete(guid(), &key, 1, 1).unwrap(),
            Bytes::from("a")
        );
        assert_eq!(
            assembler.complete(other, &key, 1, 1).unwrap(),
            Bytes::from("b")
        );
    }
}
