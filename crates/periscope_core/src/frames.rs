//! # Frame Resolver
//!
//! Pure conversion of an entity's pose into an arbitrary target frame.
//!
//! Every frame chain ends at a root: FIXED, or an entity that has no
//! parent frame. Two frames are comparable only when they share a root.
//!
//! ```text
//!   entity ─> frame ─> frame ─> ... ─> root
//!                  pose in root = P_n ∘ ... ∘ P_1
//! ```
//!
//! Nothing here caches across calls; chains are walked on demand.

use crate::ellipsoid::Ellipsoid;
use crate::entity::{Entity, ReferenceFrame};
use crate::error::{FrameError, FrameResult};
use crate::math::{Cartesian3, Quaternion};
use crate::time::Timestamp;
use std::sync::Arc;

/// Longest frame chain the resolver will walk.
pub const MAX_FRAME_DEPTH: usize = 64;

/// A rigid transform from a local frame into its root frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    /// Origin of the local frame, in root coordinates.
    pub position: Cartesian3,
    /// Rotation of the local axes into root axes.
    pub orientation: Quaternion,
}

impl Pose {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        position: Cartesian3::ZERO,
        orientation: Quaternion::IDENTITY,
    };

    /// Maps a point from local into root coordinates.
    #[must_use]
    pub fn apply(&self, point: Cartesian3) -> Cartesian3 {
        self.position + self.orientation.rotate(point)
    }

    /// Maps a point from root into local coordinates.
    #[must_use]
    pub fn apply_inverse(&self, point: Cartesian3) -> Cartesian3 {
        self.orientation.conjugate().rotate(point - self.position)
    }

    /// `self ∘ inner`: first `inner`, then `self`.
    #[must_use]
    pub fn compose(&self, inner: &Self) -> Self {
        Self {
            position: self.apply(inner.position),
            orientation: (self.orientation * inner.orientation).normalize(),
        }
    }
}

/// The frame an entity's position is expressed in, treating a root entity
/// as its own frame. `None` if the entity has no position property.
#[must_use]
pub fn native_frame(entity: &Arc<Entity>) -> Option<ReferenceFrame> {
    entity
        .position_frame()
        .map(|frame| frame.unwrap_or_else(|| ReferenceFrame::Entity(Arc::clone(entity))))
}

/// Frames from `frame` (inclusive) up to its root (inclusive).
///
/// # Errors
///
/// Returns [`FrameError::ChainTooDeep`] when the chain is longer than
/// [`MAX_FRAME_DEPTH`].
pub fn ancestor_frames(frame: &ReferenceFrame) -> FrameResult<Vec<ReferenceFrame>> {
    let mut chain = vec![frame.clone()];
    let mut current = frame.clone();
    while let ReferenceFrame::Entity(entity) = &current {
        let Some(Some(parent)) = entity.position_frame() else {
            break;
        };
        if chain.len() >= MAX_FRAME_DEPTH {
            return Err(FrameError::ChainTooDeep {
                entity: entity.id().clone(),
                depth: MAX_FRAME_DEPTH,
            });
        }
        chain.push(parent.clone());
        current = parent;
    }
    Ok(chain)
}

/// The root of `frame`'s chain.
///
/// # Errors
///
/// Same as [`ancestor_frames`].
pub fn root_frame(frame: &ReferenceFrame) -> FrameResult<ReferenceFrame> {
    let chain = ancestor_frames(frame)?;
    Ok(chain.last().cloned().unwrap_or_else(|| frame.clone()))
}

/// Root of `frame` and the pose of `frame` inside it at `time`.
///
/// `None` when an intermediate frame has no pose at `time` or the chain is
/// too deep.
#[must_use]
pub fn frame_to_root(frame: &ReferenceFrame, time: Timestamp) -> Option<(ReferenceFrame, Pose)> {
    let mut current = match frame {
        ReferenceFrame::Fixed => return Some((ReferenceFrame::Fixed, Pose::IDENTITY)),
        ReferenceFrame::Entity(entity) => Arc::clone(entity),
    };
    let mut pose = Pose::IDENTITY;

    for _ in 0..MAX_FRAME_DEPTH {
        let parent = match current.position_frame() {
            None | Some(None) => return Some((ReferenceFrame::Entity(current), pose)),
            Some(Some(parent)) => parent,
        };
        let (position, _) = current.position_value(time)?;
        let orientation = current.orientation_value(time)?;
        pose = Pose {
            position,
            orientation,
        }
        .compose(&pose);
        match parent {
            ReferenceFrame::Fixed => return Some((ReferenceFrame::Fixed, pose)),
            ReferenceFrame::Entity(next) => current = next,
        }
    }

    tracing::error!(entity = %current.id(), depth = MAX_FRAME_DEPTH, "reference frame chain too deep");
    None
}

/// Position of `entity` at `time`, expressed in `target`.
///
/// `None` if the entity has no position at `time`, or its chain cannot
/// reach `target`.
#[must_use]
pub fn position_in_frame(entity: &Arc<Entity>, time: Timestamp, target: &ReferenceFrame) -> Option<Cartesian3> {
    let (value, frame) = entity.position_value(time)?;
    let (source, local) = match frame {
        Some(frame) => (frame, value),
        None => (ReferenceFrame::Entity(Arc::clone(entity)), Cartesian3::ZERO),
    };
    convert_point(local, &source, target, time)
}

/// Converts a point between two frames sharing a root.
#[must_use]
pub fn convert_point(
    point: Cartesian3,
    source: &ReferenceFrame,
    target: &ReferenceFrame,
    time: Timestamp,
) -> Option<Cartesian3> {
    if source.same_as(target) {
        return Some(point);
    }
    let (source_root, source_pose) = frame_to_root(source, time)?;
    let (target_root, target_pose) = frame_to_root(target, time)?;
    if !source_root.same_as(&target_root) {
        return None;
    }
    Some(target_pose.apply_inverse(source_pose.apply(point)))
}

/// Converts an orientation between two frames sharing a root.
#[must_use]
pub fn convert_orientation(
    orientation: Quaternion,
    source: &ReferenceFrame,
    target: &ReferenceFrame,
    time: Timestamp,
) -> Option<Quaternion> {
    if source.same_as(target) {
        return Some(orientation);
    }
    let (source_root, source_pose) = frame_to_root(source, time)?;
    let (target_root, target_pose) = frame_to_root(target, time)?;
    if !source_root.same_as(&target_root) {
        return None;
    }
    Some((target_pose.orientation.conjugate() * source_pose.orientation * orientation).normalize())
}

/// Orientation of `entity` at `time`, expressed in `target`.
///
/// An explicit orientation is converted from the entity's frame. Without
/// one, the local East-North-Up orientation at the entity's FIXED position
/// is used; when that position cannot be resolved the identity is returned.
///
/// # Errors
///
/// Returns [`FrameError::DegeneratePosition`] when the FIXED position is
/// exactly `(0, 0, 0)`.
pub fn orientation_in_frame(
    entity: &Arc<Entity>,
    time: Timestamp,
    target: &ReferenceFrame,
) -> FrameResult<Option<Quaternion>> {
    let Some(source) = native_frame(entity) else {
        return Ok(None);
    };

    if let Some(orientation) = entity.orientation_value(time) {
        return Ok(convert_orientation(orientation, &source, target, time));
    }

    let Some(fixed) = position_in_frame(entity, time, &ReferenceFrame::Fixed) else {
        return Ok(Some(Quaternion::IDENTITY));
    };
    if fixed.is_exact_zero() {
        return Err(FrameError::DegeneratePosition(entity.id().clone()));
    }
    let enu = Ellipsoid::WGS84
        .east_north_up_quaternion(fixed)
        .ok_or_else(|| FrameError::DegeneratePosition(entity.id().clone()))?;
    Ok(convert_orientation(enu, &ReferenceFrame::Fixed, target, time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ellipsoid::Cartographic;
    use crate::entity::EntityId;
    use std::f64::consts::FRAC_PI_2;

    const T: Timestamp = Timestamp::EPOCH;

    fn chain() -> (Arc<Entity>, Arc<Entity>, Arc<Entity>) {
        let ground = Ellipsoid::WGS84.cartographic_to_cartesian(Cartographic::from_degrees(-84.39, 33.77, 250.0));
        let station = Entity::named("station")
            .with_position(ground, Some(ReferenceFrame::Fixed))
            .with_orientation(Ellipsoid::WGS84.east_north_up_quaternion(ground).unwrap())
            .into_shared();
        let arm = Entity::named("arm")
            .with_position(Cartesian3::new(3.0, 0.0, 1.5), Some(station.clone().into()))
            .with_orientation(Quaternion::from_axis_angle(Cartesian3::UNIT_Z, FRAC_PI_2))
            .into_shared();
        let tip = Entity::named("tip")
            .with_position(Cartesian3::new(0.5, 0.25, 0.0), Some(arm.clone().into()))
            .into_shared();
        (station, arm, tip)
    }

    #[test]
    fn test_position_round_trip_through_fixed() {
        let (_, arm, tip) = chain();
        let fixed = position_in_frame(&tip, T, &ReferenceFrame::Fixed).unwrap();

        let mirror = Entity::named("mirror")
            .with_position(fixed, Some(ReferenceFrame::Fixed))
            .into_shared();
        let back = position_in_frame(&mirror, T, &arm.into()).unwrap();
        assert!(back.equals_epsilon(Cartesian3::new(0.5, 0.25, 0.0), 1e-6));
    }

    #[test]
    fn test_rotation_applies_to_child_offset() {
        let (station, _, tip) = chain();
        let in_station = position_in_frame(&tip, T, &station.into()).unwrap();
        // The arm is yawed 90°, so the tip's +X offset becomes +Y.
        assert!(in_station.equals_epsilon(Cartesian3::new(2.75, 0.5, 1.5), 1e-6));
    }

    #[test]
    fn test_root_entity_is_origin_of_own_frame() {
        let device = Entity::new(EntityId::new("DEVICE"))
            .with_position(Cartesian3::new(9.0, 9.0, 9.0), None)
            .with_orientation(Quaternion::IDENTITY)
            .into_shared();
        let frame = ReferenceFrame::Entity(device.clone());
        assert_eq!(position_in_frame(&device, T, &frame), Some(Cartesian3::ZERO));
        assert!(position_in_frame(&device, T, &ReferenceFrame::Fixed).is_none());
    }

    #[test]
    fn test_missing_intermediate_orientation_is_unresolvable() {
        let parent = Entity::named("parent")
            .with_position(Cartesian3::new(7e6, 0.0, 0.0), Some(ReferenceFrame::Fixed))
            .into_shared();
        let child = Entity::named("child")
            .with_position(Cartesian3::UNIT_X, Some(parent.into()))
            .into_shared();
        assert!(position_in_frame(&child, T, &ReferenceFrame::Fixed).is_none());
    }

    #[test]
    fn test_default_orientation_is_local_enu() {
        let position = Ellipsoid::WGS84.cartographic_to_cartesian(Cartographic::from_degrees(10.0, 45.0, 0.0));
        let entity = Entity::named("marker")
            .with_position(position, Some(ReferenceFrame::Fixed))
            .into_shared();
        let q = orientation_in_frame(&entity, T, &ReferenceFrame::Fixed).unwrap().unwrap();
        let expected = Ellipsoid::WGS84.east_north_up_quaternion(position).unwrap();
        assert!(q.equals_epsilon(expected, 1e-12));
    }

    #[test]
    fn test_zero_fixed_position_is_fatal() {
        let entity = Entity::named("uninitialized")
            .with_position(Cartesian3::ZERO, Some(ReferenceFrame::Fixed))
            .into_shared();
        let result = orientation_in_frame(&entity, T, &ReferenceFrame::Fixed);
        assert!(matches!(result, Err(FrameError::DegeneratePosition(_))));
    }

    #[test]
    fn test_unresolvable_fixed_position_defaults_to_identity() {
        let device = Entity::new(EntityId::new("DEVICE"))
            .with_position(Cartesian3::ZERO, None)
            .into_shared();
        let q = orientation_in_frame(&device, T, &ReferenceFrame::Entity(device.clone())).unwrap();
        assert_eq!(q, Some(Quaternion::IDENTITY));
    }

    #[test]
    fn test_no_position_means_absent() {
        let entity = Entity::named("bare").into_shared();
        assert!(position_in_frame(&entity, T, &ReferenceFrame::Fixed).is_none());
        assert_eq!(orientation_in_frame(&entity, T, &ReferenceFrame::Fixed), Ok(None));
    }

    #[test]
    fn test_ancestor_frames() {
        let (station, arm, _) = chain();
        let chain = ancestor_frames(&arm.into()).unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain[1].same_as(&station.into()));
        assert!(chain[2].is_fixed());
    }
}
