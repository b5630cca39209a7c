//! # Messaging Error Types
//!
//! All errors that can occur between a manager, its channels and the
//! native bridge.

use periscope_shared::{ErrorPayload, ProtocolError, ProtocolVersion};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the messaging layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Content speaks a newer protocol than the manager.
    #[error("content requires protocol {content}, manager speaks {manager}")]
    ProtocolVersionMismatch {
        /// Version announced by the content.
        content: ProtocolVersion,
        /// Version of the manager.
        manager: ProtocolVersion,
    },

    /// No handler is registered for a request type.
    #[error("unhandled request type: {0}")]
    UnhandledRequestType(String),

    /// The remote side rejected a request.
    #[error("remote error: {}", .0.message)]
    Remote(ErrorPayload),

    /// The channel unloaded while a request was in flight.
    #[error("channel unloaded before the request settled")]
    ChannelUnloaded,

    /// The counterpart went away.
    #[error("counterpart disconnected")]
    Disconnected,

    /// The dedicated port is closed.
    #[error("message port closed")]
    PortClosed,

    /// A bounded wait expired.
    #[error("{what} timed out after {after_ms} ms")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The bound.
        after_ms: u64,
    },

    /// A capability is not available on this platform.
    #[error("{0} capability is not available on this platform")]
    CapabilityUnavailable(String),

    /// A capability probe was made without a capability name.
    #[error("capability is required")]
    CapabilityRequired,

    /// A protocol message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl MessagingError {
    /// Serialized form for a `reject` reply.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Remote(payload) => payload.clone(),
            other => ErrorPayload::new(other.to_string()),
        }
    }
}

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Failure returned by a request handler; becomes a `reject` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// Human-readable message.
    pub message: String,
    /// Optional detail, sent as the remote stack.
    pub stack: Option<String>,
}

impl HandlerError {
    /// A handler error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<MessagingError> for HandlerError {
    fn from(error: MessagingError) -> Self {
        let payload = error.to_payload();
        Self {
            message: payload.message,
            stack: payload.stack,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(format!("invalid request payload: {error}"))
    }
}

impl From<HandlerError> for ErrorPayload {
    fn from(error: HandlerError) -> Self {
        Self {
            message: error.message,
            stack: error.stack,
        }
    }
}
