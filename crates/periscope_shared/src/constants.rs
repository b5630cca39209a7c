//! # Protocol Constants
//!
//! Values both sides of every boundary must agree on.

use std::f64::consts::PI;

// =============================================================================
// FRAME PIPELINE
// =============================================================================

/// Squared eye-to-origin distance (m²) beyond which the local origin is recentered.
///
/// 5 km keeps local coordinates small enough for f32 renderers.
pub const RECENTER_THRESHOLD_SQUARED: f64 = 25_000_000.0;

/// Frame numbers wrap back to zero at this value.
pub const FRAME_NUMBER_WRAP: u32 = 15_000_000;

/// Default horizontal field of view of the eye frustum, in radians.
pub const DEFAULT_FOV: f64 = PI * 0.4;

/// Default near plane of the eye frustum, in meters.
pub const DEFAULT_NEAR: f64 = 0.0001;

/// Default far plane of the eye frustum, in meters.
pub const DEFAULT_FAR: f64 = 100_000_000.0;

// =============================================================================
// MESSAGING
// =============================================================================

/// How long content waits for the manager's connect message before
/// assuming it runs standalone.
pub const CONNECT_TIMEOUT_MS: u64 = 500;

/// How long a capability probe waits before reporting unavailable.
pub const CAPABILITY_TIMEOUT_MS: u64 = 500;

/// The protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.2.0";

/// Content at or above this version uses unprefixed message names.
pub const UNPREFIXED_SINCE: &str = "1.1.0";

/// URL recorded when content navigates without the manager asking it to.
pub const UNKNOWN_URL: &str = "***";

/// Rejection message for requests nobody handles.
pub const UNHANDLED_REQUEST: &str = "unhandled request";

/// Id of the entity that tracks the physical device.
pub const DEVICE_ENTITY_ID: &str = "DEVICE";
