//! # Frame State
//!
//! The per-tick pose snapshot published by a reality and consumed by
//! contexts, sandboxes and channels.
//!
//! A `FrameState` is plain data. Producers fill a scratch value while
//! ticking and hand out clones, so a published snapshot never changes.

use crate::constants::{DEFAULT_FOV, FRAME_NUMBER_WRAP};
use crate::reality_config::RealityId;
use periscope_core::{Cartesian3, EntityId, Quaternion, Timestamp};
use serde::{Deserialize, Serialize};

/// Root reference frame of a snapshot, as sent over the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRef {
    /// The earth-fixed frame.
    #[default]
    #[serde(rename = "FIXED")]
    Fixed,
    /// A root entity, by id.
    #[serde(rename = "entity")]
    Entity {
        /// The entity id.
        id: EntityId,
    },
}

impl FrameRef {
    /// True for the FIXED frame.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed)
    }
}

/// Eye position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePosition {
    /// Position in the snapshot's reference frame.
    pub cartesian: Cartesian3,
    /// `[longitude, latitude, height]` in degrees, only for the FIXED frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cartographic_degrees: Option<[f64; 3]>,
}

/// Eye orientation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameOrientation {
    /// Orientation in the snapshot's reference frame.
    pub unit_quaternion: Quaternion,
    /// Orientation relative to the local East-North-Up frame at the eye.
    /// Equals `unit_quaternion` when the root is not FIXED.
    pub unit_quaternion_relative: Quaternion,
}

/// Perspective frustum parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frustum {
    /// Field of view along the wider axis, in radians.
    pub fov: f64,
    /// Width over height.
    pub aspect_ratio: f64,
}

impl Frustum {
    /// Vertical field of view.
    #[must_use]
    pub fn fovy(&self) -> f64 {
        if self.aspect_ratio <= 1.0 {
            self.fov
        } else {
            ((self.fov * 0.5).tan() / self.aspect_ratio).atan() * 2.0
        }
    }
}

impl Default for Frustum {
    fn default() -> Self {
        Self {
            fov: DEFAULT_FOV,
            aspect_ratio: 1.0,
        }
    }
}

/// Reference to the reality that produced a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityRef {
    /// Reality id.
    pub id: RealityId,
}

/// One immutable pose/time/frustum snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameState {
    /// Wrapping frame counter.
    pub frame_number: u32,
    /// Simulation time of the snapshot.
    pub time: Timestamp,
    /// Root frame the pose is expressed in.
    pub reference_frame: FrameRef,
    /// Eye position.
    pub position: FramePosition,
    /// Eye orientation.
    pub orientation: FrameOrientation,
    /// Eye frustum.
    pub frustum: Frustum,
    /// Producing reality.
    pub reality: RealityRef,
}

impl FrameState {
    /// Next frame number, wrapping at [`FRAME_NUMBER_WRAP`].
    #[must_use]
    pub const fn next_frame_number(current: u32) -> u32 {
        let next = current.saturating_add(1);
        if next >= FRAME_NUMBER_WRAP {
            0
        } else {
            next
        }
    }
}
