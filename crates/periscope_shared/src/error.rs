//! # Protocol Error Types
//!
//! Errors raised while decoding or validating protocol data.

use thiserror::Error;

/// Errors that can occur while handling protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A version string is not `major.minor.patch`.
    #[error("invalid protocol version: {0:?}")]
    InvalidVersion(String),

    /// A message body does not match the shape its type requires.
    #[error("malformed {message_type} message: {reason}")]
    Malformed {
        /// The wire type of the message.
        message_type: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A binary payload has the wrong length.
    #[error("binary payload of {actual} bytes, expected a multiple of {expected}")]
    BadPayloadLength {
        /// Size of one record.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },
}

impl ProtocolError {
    pub(crate) fn malformed(message_type: &str, error: &serde_json::Error) -> Self {
        Self::Malformed {
            message_type: message_type.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
