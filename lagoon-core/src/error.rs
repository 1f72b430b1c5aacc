//! Core error types.

use std::fmt;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from core codec and naming operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed bytes on the wire.
    Codec {
        /// What failed to decode.
        message: String,
    },
    /// The envelope was encoded with a newer schema than this build knows.
    ProtocolTooNew {
        /// Protocol version compiled into this build.
        local: u16,
        /// Protocol version observed on the wire.
        observed: u16,
    },
    /// A topic name does not follow the naming scheme.
    InvalidTopic {
        /// The offending name.
        name: String,
    },
    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec { message } => write!(f, "codec error: {message}"),
            Self::ProtocolTooNew { local, observed } => write!(
                f,
                "envelope protocol {observed} is newer than supported {local}"
            ),
            Self::InvalidTopic { name } => write!(f, "invalid topic name: {name}"),
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::ProtocolTooNew {
            local: 1,
            observed: 2,
        };
        let msg = format!("{err}");
        assert!(msg.contains('1'));
        assert!(msg.contains('2'));
    }
}
