//! # Context
//!
//! One presentation session: turns frame states into a navigable,
//! recenterable coordinate system.
//!
//! ```text
//!   RealityView.update ──┐
//!   manager "update" ────┴──> update(frame_state)
//!                               ├─ eye, eyeOrigin      (frame state's root frame)
//!                               ├─ localOrigin         (recentered when far or reframed)
//!                               │     └─ localOriginEastUpSouth (Y-up child)
//!                               ├─ realityChange       (reality id changed)
//!                               └─ update
//! ```
//!
//! ## Recentering
//!
//! The local origin moves only when the root frame changes or the eye
//! drifts more than `sqrt(recenter_threshold_squared)` meters from it.
//! In the FIXED frame the origin takes the East-North-Up orientation at
//! the eye; in an entity frame it sits at that entity's origin.

use crate::config::PeriscopeConfig;
use crate::error::{RealityError, RealityResult};
use crate::options::Options;
use crate::reality::Reality;
use crate::reality_view::{Commit, RealityView};
use parking_lot::Mutex;
use periscope_core::{
    Cartesian3, Ellipsoid, Entity, EntityCollection, EventHandler, FrameError, ListenerId, Quaternion,
    ReferenceFrame, Timestamp,
};
use periscope_shared::{FrameRef, FrameState, Frustum, RealityRef};
use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

/// The reality producing frame states changed.
#[derive(Clone, Debug, PartialEq)]
pub struct RealityChange {
    /// The new reality.
    pub reality: RealityRef,
    /// The reality seen before, if any.
    pub previous: Option<RealityRef>,
}

/// The required reality changed.
#[derive(Clone, Debug)]
pub struct RequiredRealityChange {
    /// The new requirement.
    pub reality: Option<Arc<Reality>>,
    /// The previous requirement.
    pub previous: Option<Arc<Reality>>,
}

/// Viewport size in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportSize {
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

/// Events of a context.
#[derive(Debug, Default)]
pub struct ContextEvents {
    /// A frame state was applied.
    pub update: EventHandler<FrameState>,
    /// The local origin moved.
    pub origin_change: EventHandler<()>,
    /// Frame states now come from another reality. Fires before `update`.
    pub reality_change: EventHandler<RealityChange>,
    /// The required reality changed.
    pub required_reality: EventHandler<RequiredRealityChange>,
    /// Required capabilities changed.
    pub required_capabilities: EventHandler<Vec<String>>,
    /// Required reference frames changed.
    pub required_reference_frames: EventHandler<Vec<String>>,
    /// The viewport was resized.
    pub resize: EventHandler<ViewportSize>,
}

#[derive(Default)]
struct ContextState {
    frustum: Frustum,
    size: Option<ViewportSize>,
    frame_state: Option<FrameState>,
    current_reality: Option<RealityRef>,
    required_capabilities: Vec<String>,
    required_reference_frames: Vec<String>,
}

/// A presentation session.
pub struct Context {
    entities: EntityCollection,
    eye: Arc<Entity>,
    eye_origin: Arc<Entity>,
    local_origin: Arc<Entity>,
    local_origin_east_up_south: Arc<Entity>,
    view: RealityView,
    options: Options,
    recenter_threshold_squared: f64,
    state: Mutex<ContextState>,
    view_listener: Mutex<Option<ListenerId>>,
    events: ContextEvents,
}

impl Context {
    /// Creates a context rendering through `view` and registers its
    /// entities in `entities`. The view's updates feed [`Context::update`].
    #[must_use]
    pub fn new(entities: EntityCollection, view: RealityView, config: &PeriscopeConfig) -> Arc<Self> {
        let local_origin = entities.add(Entity::named("localOrigin").into_shared());
        let local_origin_east_up_south = entities.add(
            Entity::named("localOriginEastUpSouth")
                .with_position(Cartesian3::ZERO, Some(ReferenceFrame::Entity(Arc::clone(&local_origin))))
                .with_orientation(Quaternion::from_axis_angle(Cartesian3::UNIT_X, -FRAC_PI_2))
                .into_shared(),
        );
        let context = Arc::new(Self {
            eye: entities.add(Entity::named("eye").into_shared()),
            eye_origin: entities.add(Entity::named("eyeOrigin").into_shared()),
            local_origin,
            local_origin_east_up_south,
            entities,
            view,
            options: Options::default(),
            recenter_threshold_squared: config.context.recenter_threshold_squared,
            state: Mutex::new(ContextState::default()),
            view_listener: Mutex::new(None),
            events: ContextEvents::default(),
        });

        let weak = Arc::downgrade(&context);
        let listener = context.view.events().update.on(move |frame_state| {
            if let Some(context) = weak.upgrade() {
                if let Err(error) = context.update(frame_state) {
                    tracing::error!(%error, "local frame state rejected");
                }
            }
        });
        *context.view_listener.lock() = Some(listener);
        context
    }

    /// Applies one frame state.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::DegeneratePosition`] when the frame state is in
    /// the FIXED frame and its position is the exact origin. The eye has
    /// already moved; no events are emitted.
    pub fn update(&self, frame_state: &FrameState) -> RealityResult<()> {
        let frame = match &frame_state.reference_frame {
            FrameRef::Fixed => ReferenceFrame::Fixed,
            FrameRef::Entity { id } => ReferenceFrame::Entity(self.entities.get_or_create(id)),
        };
        let position = frame_state.position.cartesian;

        self.eye.set_position_value(position, Some(frame.clone()));
        self.eye
            .set_orientation_value(frame_state.orientation.unit_quaternion);
        self.eye_origin.set_position_value(position, Some(frame.clone()));

        self.update_origin(frame_state.time, position, &frame)?;

        let change = {
            let mut state = self.state.lock();
            state.frustum = frame_state.frustum;
            state.frame_state = Some(frame_state.clone());
            if state.current_reality.as_ref() == Some(&frame_state.reality) {
                None
            } else {
                let previous = state.current_reality.replace(frame_state.reality.clone());
                Some(RealityChange {
                    reality: frame_state.reality.clone(),
                    previous,
                })
            }
        };
        if let Some(change) = change {
            tracing::debug!(reality = %change.reality.id, "frame states now from another reality");
            self.events.reality_change.emit(&change);
        }

        if self.view.is_enabled()
            && self
                .view
                .reality()
                .is_some_and(|required| required.id() != &frame_state.reality.id)
        {
            tracing::debug!(reality = %frame_state.reality.id, "updates from a foreign reality, disabling local view");
            self.view.disable();
        }

        self.events.update.emit(frame_state);
        Ok(())
    }

    fn update_origin(&self, time: Timestamp, position: Cartesian3, frame: &ReferenceFrame) -> RealityResult<()> {
        let recenter = match self.local_origin.position_value(time) {
            None => true,
            Some((origin, origin_frame)) => {
                !origin_frame.is_some_and(|f| f.same_as(frame))
                    || origin.distance_squared(position) > self.recenter_threshold_squared
            }
        };
        if !recenter {
            return Ok(());
        }

        if frame.is_fixed() {
            let degenerate = || RealityError::Frame(FrameError::DegeneratePosition(self.eye.id().clone()));
            if position.is_exact_zero() {
                return Err(degenerate());
            }
            let enu = Ellipsoid::WGS84
                .east_north_up_quaternion(position)
                .ok_or_else(degenerate)?;
            self.local_origin
                .set_position_value(position, Some(ReferenceFrame::Fixed));
            self.local_origin.set_orientation_value(enu);
        } else {
            self.local_origin
                .set_position_value(Cartesian3::ZERO, Some(frame.clone()));
            self.local_origin.set_orientation_value(Quaternion::IDENTITY);
        }
        tracing::debug!(fixed = frame.is_fixed(), "local origin recentered");
        self.events.origin_change.emit(&());
        Ok(())
    }

    /// Switches the required reality. Returns a handle to the commit the
    /// view started, or `None` if `reality` is already required.
    pub fn set_required_reality(&self, reality: Option<Arc<Reality>>) -> Option<Commit> {
        let previous = self.view.reality();
        let unchanged = match (&previous, &reality) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return None;
        }
        let commit = self.view.set_reality(reality.clone());
        self.events
            .required_reality
            .emit(&RequiredRealityChange { reality, previous });
        Some(commit)
    }

    /// The required reality.
    #[must_use]
    pub fn required_reality(&self) -> Option<Arc<Reality>> {
        self.view.reality()
    }

    /// The reality the last frame state came from.
    #[must_use]
    pub fn current_reality(&self) -> Option<RealityRef> {
        self.state.lock().current_reality.clone()
    }

    /// Declares the capabilities this session needs.
    pub fn set_required_capabilities(&self, capabilities: Vec<String>) {
        self.state.lock().required_capabilities = capabilities.clone();
        self.events.required_capabilities.emit(&capabilities);
    }

    /// Declared capabilities.
    #[must_use]
    pub fn required_capabilities(&self) -> Vec<String> {
        self.state.lock().required_capabilities.clone()
    }

    /// Declares the reference frames this session needs.
    pub fn set_required_reference_frames(&self, frames: Vec<String>) {
        self.state.lock().required_reference_frames = frames.clone();
        self.events.required_reference_frames.emit(&frames);
    }

    /// Declared reference frames.
    #[must_use]
    pub fn required_reference_frames(&self) -> Vec<String> {
        self.state.lock().required_reference_frames.clone()
    }

    /// Records a new viewport size and updates the view's default aspect.
    pub fn resize(&self, width: f64, height: f64) {
        let size = ViewportSize { width, height };
        self.view.resize(width, height);
        self.state.lock().size = Some(size);
        self.events.resize.emit(&size);
    }

    /// Last viewport size.
    #[must_use]
    pub fn size(&self) -> Option<ViewportSize> {
        self.state.lock().size
    }

    /// Frustum of the last frame state.
    #[must_use]
    pub fn frustum(&self) -> Frustum {
        self.state.lock().frustum
    }

    /// Last applied frame state.
    #[must_use]
    pub fn frame_state(&self) -> Option<FrameState> {
        self.state.lock().frame_state.clone()
    }

    /// The viewpoint.
    #[must_use]
    pub fn eye(&self) -> &Arc<Entity> {
        &self.eye
    }

    /// The eye position, without orientation.
    #[must_use]
    pub fn eye_origin(&self) -> &Arc<Entity> {
        &self.eye_origin
    }

    /// Origin of the local, recentered coordinate system (Z-up).
    #[must_use]
    pub fn local_origin(&self) -> &Arc<Entity> {
        &self.local_origin
    }

    /// The local origin rotated into a Y-up convention.
    #[must_use]
    pub fn local_origin_east_up_south(&self) -> &Arc<Entity> {
        &self.local_origin_east_up_south
    }

    /// Entity collection the session's entities live in.
    #[must_use]
    pub fn entities(&self) -> &EntityCollection {
        &self.entities
    }

    /// The owned reality view.
    #[must_use]
    pub fn reality_view(&self) -> &RealityView {
        &self.view
    }

    /// Session options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Events.
    #[must_use]
    pub fn events(&self) -> &ContextEvents {
        &self.events
    }

    /// Detaches the view and releases the session's entities.
    pub fn destroy(&self) {
        if let Some(listener) = self.view_listener.lock().take() {
            self.view.events().update.remove(listener);
        }
        self.view.set_reality(None).detach();
        for entity in [
            &self.eye,
            &self.eye_origin,
            &self.local_origin,
            &self.local_origin_east_up_south,
        ] {
            self.entities.remove(entity.id());
        }
        tracing::debug!("context destroyed");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("view", &self.view)
            .field("current_reality", &self.current_reality())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessSandbox, StaticLoader};
    use crate::reality::{RealityKind, RealityRegistry};
    use periscope_core::{frames, Cartographic, EntityId};
    use periscope_shared::{FrameOrientation, FramePosition, RealityId};

    fn context() -> (Arc<Context>, RealityRegistry) {
        let entities = EntityCollection::new();
        let (view, _sandbox) = HeadlessSandbox::view(Arc::new(StaticLoader::new()), periscope_shared::DEFAULT_FOV);
        let context = Context::new(entities.clone(), view, &PeriscopeConfig::default());
        (context, RealityRegistry::new(entities))
    }

    fn fixed_state(position: Cartesian3, reality: &str) -> FrameState {
        FrameState {
            reference_frame: FrameRef::Fixed,
            position: FramePosition {
                cartesian: position,
                cartographic_degrees: None,
            },
            orientation: FrameOrientation {
                unit_quaternion: Quaternion::IDENTITY,
                unit_quaternion_relative: Quaternion::IDENTITY,
            },
            reality: RealityRef {
                id: RealityId::new(reality),
            },
            ..FrameState::default()
        }
    }

    fn counter<E: 'static>(handler: &EventHandler<E>) -> Arc<Mutex<usize>> {
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        handler.on(move |_| *c.lock() += 1);
        count
    }

    fn ground(height: f64) -> Cartesian3 {
        Ellipsoid::WGS84.cartographic_to_cartesian(Cartographic::from_degrees(-84.39, 33.77, height))
    }

    #[test]
    fn test_origin_recenters_past_threshold() {
        let (context, _) = context();
        let changes = counter(&context.events().origin_change);

        context.update(&fixed_state(ground(0.0), "r")).unwrap();
        assert_eq!(*changes.lock(), 1);

        // 4 km up: inside the 5 km threshold.
        context.update(&fixed_state(ground(4_000.0), "r")).unwrap();
        assert_eq!(*changes.lock(), 1);

        // 6 km up: outside.
        context.update(&fixed_state(ground(6_000.0), "r")).unwrap();
        assert_eq!(*changes.lock(), 2);

        let (origin, _) = context.local_origin().position_value(Timestamp::EPOCH).unwrap();
        assert!(origin.equals_epsilon(ground(6_000.0), 1e-6));
        let enu = Ellipsoid::WGS84.east_north_up_quaternion(ground(6_000.0)).unwrap();
        assert!(context
            .local_origin()
            .orientation_value(Timestamp::EPOCH)
            .unwrap()
            .equals_epsilon(enu, 1e-12));
    }

    #[test]
    fn test_frame_change_recenters_at_entity_origin() {
        let (context, _) = context();
        let changes = counter(&context.events().origin_change);
        context.update(&fixed_state(ground(0.0), "r")).unwrap();

        let mut state = fixed_state(Cartesian3::new(1.0, 2.0, 3.0), "r");
        state.reference_frame = FrameRef::Entity {
            id: EntityId::new("DEVICE"),
        };
        context.update(&state).unwrap();
        assert_eq!(*changes.lock(), 2);

        let (origin, frame) = context.local_origin().position_value(Timestamp::EPOCH).unwrap();
        assert_eq!(origin, Cartesian3::ZERO);
        assert_eq!(frame.unwrap().entity().unwrap().id().as_str(), "DEVICE");
        let eye = frames::position_in_frame(context.eye(), Timestamp::EPOCH, &frame_of(context.local_origin()));
        assert_eq!(eye, Some(Cartesian3::new(1.0, 2.0, 3.0)));
    }

    fn frame_of(entity: &Arc<Entity>) -> ReferenceFrame {
        ReferenceFrame::Entity(Arc::clone(entity))
    }

    #[test]
    fn test_zero_fixed_position_is_fatal() {
        let (context, _) = context();
        let updates = counter(&context.events().update);
        let result = context.update(&fixed_state(Cartesian3::ZERO, "r"));
        assert!(matches!(
            result,
            Err(RealityError::Frame(FrameError::DegeneratePosition(_)))
        ));
        assert_eq!(*updates.lock(), 0);
    }

    #[test]
    fn test_reality_change_precedes_update() {
        let (context, _) = context();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        context
            .events()
            .reality_change
            .on(move |change| o.lock().push(format!("change:{}", change.reality.id)));
        let o = Arc::clone(&order);
        context
            .events()
            .update
            .on(move |state| o.lock().push(format!("update:{}", state.reality.id)));

        context.update(&fixed_state(ground(0.0), "a")).unwrap();
        context.update(&fixed_state(ground(0.0), "a")).unwrap();
        context.update(&fixed_state(ground(0.0), "b")).unwrap();

        assert_eq!(
            *order.lock(),
            vec!["change:a", "update:a", "update:a", "change:b", "update:b"]
        );
        assert_eq!(context.current_reality().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_required_reality_only_emits_on_change() {
        let (context, registry) = context();
        let changes = counter(&context.events().required_reality);
        let reality = registry.create(RealityKind::Color);

        assert!(context.set_required_reality(Some(reality.clone())).is_some());
        assert!(context.set_required_reality(Some(reality.clone())).is_none());
        assert!(context.set_required_reality(None).is_some());
        assert!(context.set_required_reality(None).is_none());
        assert_eq!(*changes.lock(), 2);
    }

    #[tokio::test]
    async fn test_required_reality_commits_without_awaiting() {
        let (context, registry) = context();
        let reality = registry.color("red");
        drop(context.set_required_reality(Some(reality)));

        for _ in 0..16 {
            if context.reality_view().is_ready() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(context.reality_view().is_ready());
    }

    #[test]
    fn test_foreign_reality_disables_local_view() {
        let (context, registry) = context();
        let local = registry.create(RealityKind::Color);
        let _ = context.set_required_reality(Some(local.clone()));
        assert!(context.reality_view().is_enabled());

        context.update(&fixed_state(ground(0.0), local.id().as_str())).unwrap();
        assert!(context.reality_view().is_enabled());

        context.update(&fixed_state(ground(0.0), "managed")).unwrap();
        assert!(!context.reality_view().is_enabled());
    }

    #[test]
    fn test_declarations_and_resize() {
        let (context, _) = context();
        let resized = counter(&context.events().resize);
        context.set_required_capabilities(vec!["geolocation".into()]);
        context.set_required_reference_frames(vec!["DEVICE".into()]);
        context.resize(300.0, 150.0);

        assert_eq!(context.required_capabilities(), vec!["geolocation".to_string()]);
        assert_eq!(context.required_reference_frames(), vec!["DEVICE".to_string()]);
        assert_eq!(*resized.lock(), 1);
        assert!((context.reality_view().default_frustum().aspect_ratio - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_east_up_south_follows_local_origin() {
        let (context, _) = context();
        context.update(&fixed_state(ground(0.0), "r")).unwrap();
        let eus = context.local_origin_east_up_south();

        let fixed = frames::position_in_frame(eus, Timestamp::EPOCH, &ReferenceFrame::Fixed).unwrap();
        assert!(fixed.equals_epsilon(ground(0.0), 1e-6));
        let relative = frames::orientation_in_frame(eus, Timestamp::EPOCH, &frame_of(context.local_origin()))
            .unwrap()
            .unwrap();
        assert!(relative.equals_epsilon(Quaternion::from_axis_angle(Cartesian3::UNIT_X, -FRAC_PI_2), 1e-12));
    }

    #[test]
    fn test_destroy_releases_entities() {
        let (context, _) = context();
        let entities = context.entities().clone();
        assert!(entities.contains(context.eye().id()));
        context.destroy();
        assert!(!entities.contains(context.eye().id()));
        assert!(!entities.contains(context.local_origin().id()));
    }
}
