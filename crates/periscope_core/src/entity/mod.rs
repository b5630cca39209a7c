//! # Entities
//!
//! An entity is an identity plus optional time-varying `position` and
//! `orientation` properties. A position is expressed relative to a
//! [`ReferenceFrame`]: the absolute FIXED frame, or another entity.
//!
//! ## Ownership
//!
//! ```text
//!   child ──position.frame──> parent ──position.frame──> FIXED
//! ```
//!
//! Children hold a strong reference to their parent frame; parents never
//! know their children. Frame chains are therefore DAGs by construction.
//! Building a cycle is a programming error.

mod collection;
mod property;

pub use collection::EntityCollection;
pub use property::{Extrapolation, Interpolate, OrientationProperty, PositionProperty, SampledSeries};

use crate::math::{Cartesian3, Quaternion};
use crate::time::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identifier of an entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an id from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, process-unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A frame that positions and orientations can be expressed in.
#[derive(Clone, Debug)]
pub enum ReferenceFrame {
    /// The absolute earth-fixed frame.
    Fixed,
    /// The local frame of an entity.
    Entity(Arc<Entity>),
}

impl ReferenceFrame {
    /// Frame equality: FIXED equals FIXED, entity frames compare by id.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Fixed, Self::Fixed) => true,
            (Self::Entity(a), Self::Entity(b)) => a.id() == b.id(),
            _ => false,
        }
    }

    /// True for the FIXED frame.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed)
    }

    /// The entity behind an entity frame.
    #[must_use]
    pub fn entity(&self) -> Option<&Arc<Entity>> {
        match self {
            Self::Fixed => None,
            Self::Entity(entity) => Some(entity),
        }
    }
}

impl From<Arc<Entity>> for ReferenceFrame {
    fn from(entity: Arc<Entity>) -> Self {
        Self::Entity(entity)
    }
}

/// A named object with time-varying pose.
///
/// Properties sit behind locks so a shared `Arc<Entity>` can be updated
/// in place every frame while other chains keep referencing it.
pub struct Entity {
    id: EntityId,
    name: Option<String>,
    position: RwLock<Option<PositionProperty>>,
    orientation: RwLock<Option<OrientationProperty>>,
}

impl Entity {
    /// Creates an entity with no pose.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            name: None,
            position: RwLock::new(None),
            orientation: RwLock::new(None),
        }
    }

    /// Creates a named entity with a generated id.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(EntityId::generate())
        }
    }

    /// Builder: sets a constant position.
    #[must_use]
    pub fn with_position(self, value: Cartesian3, frame: Option<ReferenceFrame>) -> Self {
        self.set_position(PositionProperty::constant(value, frame));
        self
    }

    /// Builder: sets a constant orientation.
    #[must_use]
    pub fn with_orientation(self, value: Quaternion) -> Self {
        self.set_orientation(OrientationProperty::Constant(value));
        self
    }

    /// Wraps the entity in an `Arc` for sharing as a frame.
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The entity id.
    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The display name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Replaces the position property.
    pub fn set_position(&self, property: PositionProperty) {
        *self.position.write() = Some(property);
    }

    /// Sets a constant position, reusing the existing property slot.
    pub fn set_position_value(&self, value: Cartesian3, frame: Option<ReferenceFrame>) {
        self.set_position(PositionProperty::constant(value, frame));
    }

    /// Removes the position property.
    pub fn clear_position(&self) {
        *self.position.write() = None;
    }

    /// Replaces the orientation property.
    pub fn set_orientation(&self, property: OrientationProperty) {
        *self.orientation.write() = Some(property);
    }

    /// Sets a constant orientation.
    pub fn set_orientation_value(&self, value: Quaternion) {
        self.set_orientation(OrientationProperty::Constant(value));
    }

    /// Removes the orientation property.
    pub fn clear_orientation(&self) {
        *self.orientation.write() = None;
    }

    /// Appends a position sample, converting a constant property into a
    /// sampled one in `frame` when needed.
    pub fn add_position_sample(&self, time: Timestamp, value: Cartesian3, frame: Option<ReferenceFrame>) {
        let mut slot = self.position.write();
        match slot.as_mut() {
            Some(PositionProperty::Sampled { samples, frame: existing })
                if frames_match(existing.as_ref(), frame.as_ref()) =>
            {
                samples.add_sample(time, value);
            }
            _ => {
                let mut samples = SampledSeries::new(Extrapolation::Hold);
                samples.add_sample(time, value);
                *slot = Some(PositionProperty::Sampled { samples, frame });
            }
        }
    }

    /// Appends an orientation sample.
    pub fn add_orientation_sample(&self, time: Timestamp, value: Quaternion) {
        let mut slot = self.orientation.write();
        if let Some(OrientationProperty::Sampled(samples)) = slot.as_mut() {
            samples.add_sample(time, value);
            return;
        }
        let mut samples = SampledSeries::new(Extrapolation::Hold);
        samples.add_sample(time, value);
        *slot = Some(OrientationProperty::Sampled(samples));
    }

    /// True if a position property is defined (regardless of its value at any time).
    #[must_use]
    pub fn has_position(&self) -> bool {
        self.position.read().is_some()
    }

    /// The frame the position is expressed in.
    ///
    /// Outer `None`: no position property. Inner `None`: the entity is a
    /// root and defines its own frame.
    #[must_use]
    pub fn position_frame(&self) -> Option<Option<ReferenceFrame>> {
        self.position.read().as_ref().map(|p| p.reference_frame().cloned())
    }

    /// Position value and its frame at `time`, in the property's own frame.
    #[must_use]
    pub fn position_value(&self, time: Timestamp) -> Option<(Cartesian3, Option<ReferenceFrame>)> {
        let guard = self.position.read();
        let property = guard.as_ref()?;
        let value = property.value(time)?;
        Some((value, property.reference_frame().cloned()))
    }

    /// Explicit orientation value at `time`, relative to the position frame.
    #[must_use]
    pub fn orientation_value(&self, time: Timestamp) -> Option<Quaternion> {
        self.orientation.read().as_ref()?.value(time)
    }

    /// True if this entity has no parent frame (it is the root of its chain).
    #[must_use]
    pub fn is_root(&self) -> bool {
        !matches!(self.position_frame(), Some(Some(_)))
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn frames_match(a: Option<&ReferenceFrame>, b: Option<&ReferenceFrame>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_as(b),
        _ => false,
    }
}
