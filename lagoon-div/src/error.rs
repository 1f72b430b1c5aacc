//! DIV error types.

use lagoon_core::{ProducerGuid, SegmentNumber, SequenceNumber};

/// Result type for DIV operations.
pub type DivResult<T> = Result<T, DivError>;

/// Data integrity violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivError {
    /// A segment started mid-stream without `StartOfSegment` while the
    /// stream is still in the strict (pre-`EndOfPush`) phase.
    MissingHead {
        /// Producer GUID.
        guid: ProducerGuid,
        /// Segment number.
        segment: SegmentNumber,
        /// Sequence number of the offending record.
        sequence: SequenceNumber,
    },
    /// A gap in sequence numbers.
    DataGap {
        /// Producer GUID.
        guid: ProducerGuid,
        /// Segment number.
        segment: SegmentNumber,
        /// Sequence number that was expected.
        expected: SequenceNumber,
        /// Sequence number that arrived.
        received: SequenceNumber,
    },
    /// The running checksum disagrees with the `EndOfSegment` checksum.
    ChecksumMismatch {
        /// Producer GUID.
        guid: ProducerGuid,
        /// Segment number.
        segment: SegmentNumber,
        /// Checksum the producer declared.
        expected: u32,
        /// Checksum computed over the received records.
        actual: u32,
    },
    /// A checkpointed validator state blob failed to decode.
    StateCorrupt {
        /// What failed.
        message: String,
    },
}

impl std::fmt::Display for DivError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHead {
                guid,
                segment,
                sequence,
            } => write!(
                f,
                "segment {segment} of producer {guid} started at {sequence} without StartOfSegment"
            ),
            Self::DataGap {
                guid,
                segment,
                expected,
                received,
            } => write!(
                f,
                "gap in segment {segment} of producer {guid}: expected {expected}, got {received}"
            ),
            Self::ChecksumMismatch {
                guid,
                segment,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch in segment {segment} of producer {guid}: expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::StateCorrupt { message } => write!(f, "corrupt validator state: {message}"),
        }
    }
}

impl std::error::Error for DivError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DivError::DataGap {
            guid: ProducerGuid::from_bytes([1; 16]),
            segment: SegmentNumber::new(3),
            expected: SequenceNumber::new(5),
            received: SequenceNumber::new(9),
        };
        let msg = format!("{err}");
        assert!(msg.contains("seq-5"));
        assert!(msg.contains("seq-9"));
    }
}
