//! # Error Types
//!
//! Errors raised by realities, reality views, contexts and configuration.

use periscope_core::FrameError;
use periscope_messaging::MessagingError;
use periscope_shared::RealityId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from realities, contexts and the manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealityError {
    /// Pose resolution failed, e.g. a FIXED position at the exact origin.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A message could not be delivered.
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// No reality is registered under this id.
    #[error("unknown reality: {0}")]
    UnknownReality(RealityId),
}

/// Result type for reality operations.
pub type RealityResult<T> = Result<T, RealityError>;

/// A failed reality commit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// A declared stylesheet or script could not be loaded.
    #[error("failed to load {url}: {reason}")]
    ResourceLoadFailure {
        /// The resource.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// The sandbox could not be built or its render routine failed on attach.
    #[error("sandbox failure: {0}")]
    SandboxFailure(String),

    /// No tokio runtime was running when the commit had to start.
    #[error("no async runtime to drive the commit")]
    NoRuntime,

    /// The task driving the commit panicked or was aborted.
    #[error("commit task aborted: {0}")]
    Aborted(String),
}

/// Result type for commits.
pub type CommitResult<T> = Result<T, CommitError>;

/// Failure reported by a [`Sandbox`](crate::reality_view::Sandbox) or a
/// [`ResourceLoader`](crate::reality_view::ResourceLoader).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ResourceError(pub String);

impl ResourceError {
    /// Creates an error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
