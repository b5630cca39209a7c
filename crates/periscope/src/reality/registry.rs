//! Process-wide list of live realities.

use super::{Reality, RealityKind};
use parking_lot::RwLock;
use periscope_core::{Cartesian3, Entity, EntityCollection, EntityId, Quaternion};
use periscope_shared::constants::DEVICE_ENTITY_ID;
use periscope_shared::{RealityConfiguration, RealityId};
use serde_json::Value;
use std::sync::Arc;

/// Live realities, in registration order.
///
/// Every reality's eye sits at the origin of the `DEVICE` entity in the
/// shared entity collection.
pub struct RealityRegistry {
    entities: EntityCollection,
    realities: RwLock<Vec<Arc<Reality>>>,
    target_frame_rate: Option<f64>,
}

impl RealityRegistry {
    /// Creates an empty registry whose realities tick on every display frame.
    #[must_use]
    pub fn new(entities: EntityCollection) -> Self {
        Self::with_frame_rate(entities, None)
    }

    /// Creates an empty registry whose auto-ticking realities are capped at `rate`.
    #[must_use]
    pub fn with_frame_rate(entities: EntityCollection, rate: Option<f64>) -> Self {
        Self {
            entities,
            realities: RwLock::new(Vec::new()),
            target_frame_rate: rate,
        }
    }

    /// The entity collection eyes are anchored in.
    #[must_use]
    pub fn entities(&self) -> &EntityCollection {
        &self.entities
    }

    /// Creates and registers a reality of `kind` with a fresh id.
    pub fn create(&self, kind: RealityKind) -> Arc<Reality> {
        let config = RealityConfiguration {
            id: generate_id(),
            kind: kind.tag().map(str::to_string),
            ..RealityConfiguration::default()
        };
        self.insert(Reality::new(config, kind, self.make_eye(), self.target_frame_rate))
    }

    /// Creates and registers a Color reality painted `color`.
    pub fn color(&self, color: &str) -> Arc<Reality> {
        let reality = self.create(RealityKind::Color);
        reality.options().set("color", Value::String(color.to_string()));
        reality
    }

    /// Returns the registered reality with `config.id`, or rebuilds one.
    ///
    /// Unknown kinds are rebuilt as generic realities marked untrusted.
    pub fn from_configuration(&self, config: &RealityConfiguration) -> Arc<Reality> {
        if let Some(existing) = self.get(&config.id) {
            return existing;
        }
        let kind = RealityKind::from_tag(config.kind.as_deref());
        if !kind.is_trusted() {
            tracing::warn!(reality = %config.id, kind = ?config.kind, "unknown reality kind, rebuilding as untrusted");
        }
        self.insert(Reality::new(config.clone(), kind, self.make_eye(), self.target_frame_rate))
    }

    /// Looks up a reality.
    #[must_use]
    pub fn get(&self, id: &RealityId) -> Option<Arc<Reality>> {
        self.realities.read().iter().find(|r| r.id() == id).cloned()
    }

    /// Looks up a reality, creating a generic one under `id` if absent.
    pub fn get_or_create(&self, id: &RealityId) -> Arc<Reality> {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        let config = RealityConfiguration {
            id: id.clone(),
            ..RealityConfiguration::default()
        };
        self.insert(Reality::new(
            config,
            RealityKind::Generic,
            self.make_eye(),
            self.target_frame_rate,
        ))
    }

    /// Every live reality, in registration order.
    #[must_use]
    pub fn query(&self) -> Vec<Arc<Reality>> {
        self.realities.read().clone()
    }

    /// Number of live realities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.realities.read().len()
    }

    /// True if no reality is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.realities.read().is_empty()
    }

    /// Unregisters and tears down a reality. Other holders learn about it
    /// through the reality's `teardown` event.
    pub fn destroy(&self, id: &RealityId) -> bool {
        let removed = {
            let mut realities = self.realities.write();
            realities
                .iter()
                .position(|r| r.id() == id)
                .map(|index| realities.remove(index))
        };
        match removed {
            Some(reality) => {
                reality.destroy();
                true
            }
            None => false,
        }
    }

    fn insert(&self, reality: Reality) -> Arc<Reality> {
        let mut realities = self.realities.write();
        // A concurrent insert under the same id wins.
        if let Some(existing) = realities.iter().find(|r| r.id() == reality.id()) {
            return Arc::clone(existing);
        }
        let reality = Arc::new(reality);
        tracing::debug!(reality = %reality.id(), kind = ?reality.kind(), "reality registered");
        realities.push(Arc::clone(&reality));
        reality
    }

    fn make_eye(&self) -> Arc<Entity> {
        let device = self.entities.get_or_create(&EntityId::new(DEVICE_ENTITY_ID));
        if !device.has_position() {
            device.set_position_value(Cartesian3::ZERO, None);
        }
        Entity::named("eye")
            .with_position(Cartesian3::ZERO, Some(device.into()))
            .with_orientation(Quaternion::IDENTITY)
            .into_shared()
    }
}

impl std::fmt::Debug for RealityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealityRegistry")
            .field("realities", &self.len())
            .field("target_frame_rate", &self.target_frame_rate)
            .finish_non_exhaustive()
    }
}

fn generate_id() -> RealityId {
    RealityId::new(uuid::Uuid::new_v4().to_string())
}
