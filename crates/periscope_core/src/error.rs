//! # Frame Error Types
//!
//! Errors raised while resolving poses across reference frames.

use crate::entity::EntityId;
use thiserror::Error;

/// Errors that can occur during frame resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// An entity resolved to exactly `(0, 0, 0)` in the FIXED frame.
    ///
    /// This is an uninitialized coordinate, not a location at the center
    /// of the planet, so no default orientation can be synthesized.
    #[error("degenerate position: entity {0} is at the exact origin of the FIXED frame")]
    DegeneratePosition(EntityId),

    /// A frame chain is deeper than the resolver allows. Almost always a cycle.
    #[error("reference frame chain from entity {entity} exceeds depth {depth}")]
    ChainTooDeep {
        /// Entity whose chain was being walked.
        entity: EntityId,
        /// Depth limit that was hit.
        depth: usize,
    },

    /// An id named a frame that is not registered.
    #[error("unknown reference frame: {0}")]
    UnknownFrame(String),
}

/// Result type for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;
