//! Registry of shared entities keyed by id.

use super::{Entity, EntityId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared entity registry.
///
/// Cloning the collection clones the handle; all clones see the same set.
#[derive(Clone, Default)]
pub struct EntityCollection {
    entities: Arc<RwLock<HashMap<EntityId, Arc<Entity>>>>,
}

impl EntityCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entity, replacing any entity with the same id.
    pub fn add(&self, entity: Arc<Entity>) -> Arc<Entity> {
        self.entities.write().insert(entity.id().clone(), Arc::clone(&entity));
        entity
    }

    /// Looks up an entity by id.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.entities.read().get(id).cloned()
    }

    /// Returns the entity with `id`, creating a bare one if absent.
    pub fn get_or_create(&self, id: &EntityId) -> Arc<Entity> {
        if let Some(existing) = self.get(id) {
            return existing;
        }
        let mut entities = self.entities.write();
        Arc::clone(
            entities
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Entity::new(id.clone()))),
        )
    }

    /// Removes an entity. Holders of the `Arc` keep it alive.
    pub fn remove(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.entities.write().remove(id)
    }

    /// True if an entity with `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.read().contains_key(id)
    }

    /// Number of registered entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// True if the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl std::fmt::Debug for EntityCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCollection").field("len", &self.len()).finish()
    }
}
