//! # Periscope Core
//!
//! Reference frames and pose math for an AR viewpoint engine.
//!
//! - f64 vector/quaternion math and the WGS84 ellipsoid
//! - Entities with time-sampled position and orientation
//! - The frame resolver: an entity's pose in any frame sharing its root
//! - A typed event emitter used by every stateful object
//!
//! ## CRITICAL RULE
//!
//! This crate knows nothing about messaging, sandboxes or async runtimes.
//! Everything here is a pure function of `(entity, time, frame)`.
//!
//! ## Example
//!
//! ```rust
//! use periscope_core::{frames, Cartesian3, Entity, ReferenceFrame, Timestamp};
//!
//! let parent = Entity::named("parent")
//!     .with_position(Cartesian3::new(10.0, 0.0, 0.0), None)
//!     .into_shared();
//! let child = Entity::named("child")
//!     .with_position(Cartesian3::new(1.0, 2.0, 3.0), Some(parent.clone().into()))
//!     .into_shared();
//!
//! let p = frames::position_in_frame(&child, Timestamp::EPOCH, &parent.into());
//! assert_eq!(p, Some(Cartesian3::new(1.0, 2.0, 3.0)));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod ellipsoid;
pub mod entity;
pub mod error;
pub mod events;
pub mod frames;
pub mod math;
pub mod time;

pub use ellipsoid::{Cartographic, Ellipsoid};
pub use entity::{
    Entity, EntityCollection, EntityId, Extrapolation, OrientationProperty, PositionProperty, ReferenceFrame,
    SampledSeries,
};
pub use error::{FrameError, FrameResult};
pub use events::{EventHandler, ListenerId};
pub use frames::Pose;
pub use math::{Cartesian3, Matrix3, Quaternion};
pub use time::Timestamp;
