//! # Periscope Shared
//!
//! Types exchanged across trust boundaries: between the manager and its
//! channels, and between the manager and the native bridge.
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER depend on:
//! - `tokio`
//! - `crossbeam-channel`
//! - Anything that owns a thread or a task
//!
//! Everything here is plain data plus (de)serialization and validation.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod constants;
pub mod error;
pub mod frame_state;
pub mod protocol;
pub mod reality_config;
pub mod version;

pub use constants::{
    CONNECT_TIMEOUT_MS, DEFAULT_FOV, FRAME_NUMBER_WRAP, RECENTER_THRESHOLD_SQUARED, UNHANDLED_REQUEST, UNKNOWN_URL,
    UNPREFIXED_SINCE,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame_state::{FrameOrientation, FramePosition, FrameRef, FrameState, Frustum, RealityRef};
pub use protocol::{
    ChannelAnnouncement, ConnectPayload, DevicePoseSample, ErrorPayload, Message, PresentationMode, Request,
    RequestId, Response, ResponseOutcome, WireMessage,
};
pub use reality_config::{RealityConfiguration, RealityId};
pub use version::{ProtocolVersion, VersionCompatibility};
