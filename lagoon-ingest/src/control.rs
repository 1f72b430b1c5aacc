//! Control message interpretation.
//!
//! Control messages embedded in the record stream mutate ingestor state.
//! This module translates each control message into a directive the drainer
//! applies; segment controls are not interpreted here because only the DIV
//! layer acts on them.

use lagoon_core::{Compression, ControlMessage, Offset, Timestamp, TopicName};

/// An upstream switch the ingestor should execute.
///
/// The starting position resolves in priority order: an explicit resume
/// offset (leader failover continuing where the prior leader stopped), the
/// per-partition offsets a `StartOfBufferReplay` supplied, and finally the
/// rewind timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchDirective {
    /// The new upstream topic.
    pub topic: TopicName,
    /// Explicit resume offset (from a prior leader's footer trail).
    pub resume_at: Option<Offset>,
    /// Per-partition starting offsets (`StartOfBufferReplay`).
    pub start_offsets: Option<Vec<Offset>>,
    /// Rewind timestamp; negative means earliest.
    pub rewind_start: Timestamp,
}

/// What the drainer should do with a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDirective {
    /// Initialize the batch phase.
    InitBatch {
        /// Whether batch data arrives sorted.
        sorted: bool,
        /// Whether values may arrive chunked.
        chunking: bool,
        /// Batch payload compression.
        compression: Compression,
    },
    /// Close the batch phase.
    CloseBatch,
    /// Replace the pending upstream switch. The latest directive wins.
    SwitchUpstream(SwitchDirective),
    /// Start tagging persisted batches with an incremental-push label.
    BeginIncrementalPush {
        /// The label.
        label: String,
    },
    /// Close an incremental-push label and report completion.
    EndIncrementalPush {
        /// The label.
        label: String,
    },
    /// Segment boundary; the DIV layer already acted on it.
    SegmentBoundary,
}

/// Translates a control message into a directive.
#[must_use]
pub fn interpret(control: &ControlMessage) -> ControlDirective {
    match control {
        ControlMessage::StartOfPush {
            sorted,
            chunking,
            compression,
            ..
        } => ControlDirective::InitBatch {
            sorted: *sorted,
            chunking: *chunking,
            compression: *compression,
        },
        ControlMessage::EndOfPush => ControlDirective::CloseBatch,
        ControlMessage::StartOfBufferReplay {
            offsets,
            source_topic,
        } => ControlDirective::SwitchUpstream(SwitchDirective {
            topic: source_topic.clone(),
            resume_at: None,
            start_offsets: Some(offsets.clone()),
            rewind_start: Timestamp::none(),
        }),
        ControlMessage::TopicSwitch {
            new_topic,
            rewind_start,
            ..
        } => ControlDirective::SwitchUpstream(SwitchDirective {
            topic: new_topic.clone(),
            resume_at: None,
            start_offsets: None,
            rewind_start: *rewind_start,
        }),
        ControlMessage::StartOfIncrementalPush { label } => {
            ControlDirective::BeginIncrementalPush {
                label: label.clone(),
            }
        }
        ControlMessage::EndOfIncrementalPush { label } => ControlDirective::EndIncrementalPush {
            label: label.clone(),
        },
        ControlMessage::StartOfSegment { .. } | ControlMessage::EndOfSegment { .. } => {
            ControlDirective::SegmentBoundary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagoon_core::ChecksumKind;

    #[test]
    fn test_start_of_push() {
        let directive = interpret(&ControlMessage::StartOfPush {
            sorted: true,
            chunking: true,
            compression: Compression::Zstd,
            dict: None,
        });
        assert_eq!(
            directive,
            ControlDirective::InitBatch {
                sorted: true,
                chunking: true,
                compression: Compression::Zstd,
            }
        );
    }

    #[test]
    fn test_topic_switch_keeps_rewind() {
        let directive = interpret(&ControlMessage::TopicSwitch {
            source_clusters: vec![],
            new_topic: TopicName::new("store_rt"),
            rewind_start: Timestamp::from_millis(5000),
        });
        let ControlDirective::SwitchUpstream(switch) = directive else {
            panic!("expected switch");
        };
        assert_eq!(switch.topic.as_str(), "store_rt");
        assert_eq!(switch.rewind_start, Timestamp::from_millis(5000));
        assert!(switch.start_offsets.is_none());
        assert!(switch.resume_at.is_none());
    }

    #[test]
    fn test_buffer_replay_carries_offsets() {
        let directive = interpret(&ControlMessage::StartOfBufferReplay {
            offsets: vec![Offset::new(3), Offset::new(9)],
            source_topic: TopicName::new("store_rt"),
        });
        let ControlDirective::SwitchUpstream(switch) = directive else {
            panic!("expected switch");
        };
        assert_eq!(switch.start_offsets, Some(vec![Offset::new(3), Offset::new(9)]));
        assert!(switch.rewind_start.is_none());
    }

    #[test]
    fn test_segment_controls_are_boundaries() {
        assert_eq!(
            interpret(&ControlMessage::StartOfSegment {
                checksum_kind: ChecksumKind::Crc32
            }),
            ControlDirective::SegmentBoundary
        );
        assert_eq!(
            interpret(&ControlMessage::EndOfSegment {
                checksum: 0,
                is_final: false
            }),
            ControlDirective::SegmentBoundary
        );
    }
}
