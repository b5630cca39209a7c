//! # Realities
//!
//! A reality is a source of ticks plus a declarative description of what
//! to render: stylesheets, scripts, a render routine and options.
//!
//! ```text
//!   display refresh ──> on_display_frame ──FramePacer──> tick ──enabled?──> events.tick {time}
//!                              ^
//!              run_loop ───────┘   (only while auto_tick)
//! ```
//!
//! The loop keeps running while the reality is disabled so it can resume
//! on the next frame; only the `tick` event is gated.

mod kind;
mod pacer;
mod registry;

pub use kind::RealityKind;
pub use pacer::{FramePacer, TickStats};
pub use registry::RealityRegistry;

use crate::options::Options;
use parking_lot::Mutex;
use periscope_core::{Entity, EventHandler, Timestamp};
use periscope_shared::{Frustum, RealityConfiguration, RealityId, WireMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Payload of a reality tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RealityTick {
    /// Time of the tick.
    pub time: Timestamp,
}

/// Events of a reality.
#[derive(Debug, Default)]
pub struct RealityEvents {
    /// A tick while enabled.
    pub tick: EventHandler<RealityTick>,
    /// A named message for the sandbox rendering this reality.
    pub message: EventHandler<WireMessage>,
    /// The reality was destroyed. Holders should drop it.
    pub teardown: EventHandler<RealityId>,
}

/// A tick source with a rendering description.
pub struct Reality {
    id: RealityId,
    kind: RealityKind,
    trusted: bool,
    eye: Arc<Entity>,
    css_deps: Vec<String>,
    js_deps: Vec<String>,
    render_script: String,
    frustum: Mutex<Option<Frustum>>,
    options: Options,
    enabled: AtomicBool,
    auto_tick: watch::Sender<bool>,
    pacer: Mutex<FramePacer>,
    destroyed: AtomicBool,
    events: RealityEvents,
}

impl Reality {
    /// Builds a reality from a descriptor. Empty resource lists and render
    /// script fall back to the kind's own; descriptor options override the
    /// kind's defaults.
    pub(crate) fn new(
        config: RealityConfiguration,
        kind: RealityKind,
        eye: Arc<Entity>,
        target_frame_rate: Option<f64>,
    ) -> Self {
        let defaults = kind.defaults();
        let mut options = defaults.options;
        options.extend(config.options);
        let pick = |given: Vec<String>, default: Vec<String>| if given.is_empty() { default } else { given };

        Self {
            trusted: kind.is_trusted(),
            id: config.id,
            eye,
            css_deps: pick(config.css_deps, defaults.css_deps),
            js_deps: pick(config.js_deps, defaults.js_deps),
            render_script: if config.render_script.is_empty() {
                defaults.render_script
            } else {
                config.render_script
            },
            frustum: Mutex::new(None),
            options: Options::new(options),
            enabled: AtomicBool::new(false),
            auto_tick: watch::channel(defaults.auto_tick).0,
            pacer: Mutex::new(FramePacer::with_rate(target_frame_rate)),
            destroyed: AtomicBool::new(false),
            events: RealityEvents::default(),
            kind,
        }
    }

    /// Stable id.
    #[must_use]
    pub fn id(&self) -> &RealityId {
        &self.id
    }

    /// Kind.
    #[must_use]
    pub fn kind(&self) -> &RealityKind {
        &self.kind
    }

    /// False when rebuilt from a descriptor of an unknown kind. Messages from
    /// an untrusted reality's sandbox must be validated before use.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// The viewpoint this reality renders from.
    #[must_use]
    pub fn eye(&self) -> &Arc<Entity> {
        &self.eye
    }

    /// Stylesheet URLs.
    #[must_use]
    pub fn css_deps(&self) -> &[String] {
        &self.css_deps
    }

    /// Script URLs.
    #[must_use]
    pub fn js_deps(&self) -> &[String] {
        &self.js_deps
    }

    /// Render routine source.
    #[must_use]
    pub fn render_script(&self) -> &str {
        &self.render_script
    }

    /// Frustum override; views fall back to their own default.
    #[must_use]
    pub fn frustum(&self) -> Option<Frustum> {
        *self.frustum.lock()
    }

    /// Sets or clears the frustum override.
    pub fn set_frustum(&self, frustum: Option<Frustum>) {
        *self.frustum.lock() = frustum;
    }

    /// Options forwarded to the sandbox.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Events.
    #[must_use]
    pub fn events(&self) -> &RealityEvents {
        &self.events
    }

    /// Serializable descriptor for rebuilding this reality elsewhere.
    #[must_use]
    pub fn configuration(&self) -> RealityConfiguration {
        RealityConfiguration {
            id: self.id.clone(),
            kind: self.kind.tag().map(str::to_string),
            css_deps: self.css_deps.clone(),
            js_deps: self.js_deps.clone(),
            render_script: self.render_script.clone(),
            options: self.options.snapshot(),
        }
    }

    /// True while ticks are emitted.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Gates the `tick` event.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            tracing::debug!(reality = %self.id, enabled, "reality toggled");
        }
    }

    /// True while display frames drive ticks.
    #[must_use]
    pub fn auto_tick(&self) -> bool {
        *self.auto_tick.borrow()
    }

    /// Starts or stops driving ticks from display frames.
    pub fn set_auto_tick(&self, auto_tick: bool) {
        self.auto_tick.send_replace(auto_tick);
    }

    /// Caps the auto-tick rate. `None` ticks on every display frame.
    pub fn set_target_frame_rate(&self, rate: Option<f64>) {
        self.pacer.lock().set_rate(rate);
    }

    /// Pacer statistics.
    #[must_use]
    pub fn tick_stats(&self) -> TickStats {
        *self.pacer.lock().stats()
    }

    /// Emits a tick at `time` if enabled. Returns whether it was emitted.
    pub fn tick(&self, time: Timestamp) -> bool {
        if !self.is_enabled() || self.is_destroyed() {
            return false;
        }
        self.events.tick.emit(&RealityTick { time });
        true
    }

    /// Display-refresh callback. Ticks at `time` when auto-ticking and the
    /// pacer lets `frame_time` through.
    pub fn on_display_frame(&self, frame_time: Duration, time: Timestamp) -> bool {
        if !self.auto_tick() {
            return false;
        }
        let due = self.pacer.lock().should_tick(frame_time);
        due && self.tick(time)
    }

    /// Drives [`Reality::on_display_frame`] from a fixed refresh interval
    /// until the reality is destroyed. Parks while auto-tick is off.
    pub async fn run_loop(&self, refresh: Duration) {
        let mut auto_tick = self.auto_tick.subscribe();
        let mut display = tokio::time::interval(refresh);
        display.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let start = tokio::time::Instant::now();

        while !self.is_destroyed() {
            if !*auto_tick.borrow_and_update() {
                if auto_tick.changed().await.is_err() {
                    break;
                }
                continue;
            }
            tokio::select! {
                instant = display.tick() => {
                    self.on_display_frame(instant.duration_since(start), Timestamp::now());
                }
                changed = auto_tick.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(reality = %self.id, "reality loop stopped");
    }

    /// Sends a named message to whichever sandbox renders this reality.
    pub fn send(&self, message: WireMessage) {
        self.events.message.emit(&message);
    }

    /// True after [`Reality::destroy`].
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Stops ticking and announces teardown. Idempotent.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.enabled.store(false, Ordering::Release);
        self.auto_tick.send_replace(false);
        tracing::debug!(reality = %self.id, "reality destroyed");
        self.events.teardown.emit(&self.id);
    }
}

impl std::fmt::Debug for Reality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reality")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trusted", &self.trusted)
            .field("enabled", &self.is_enabled())
            .field("auto_tick", &self.auto_tick())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::EntityCollection;
    use serde_json::json;

    fn counter(reality: &Reality) -> Arc<Mutex<Vec<Timestamp>>> {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&ticks);
        reality.events().tick.on(move |tick| t.lock().push(tick.time));
        ticks
    }

    #[test]
    fn test_tick_only_while_enabled() {
        let registry = RealityRegistry::new(EntityCollection::new());
        let reality = registry.create(RealityKind::Generic);
        let ticks = counter(&reality);

        assert!(!reality.tick(Timestamp::from_seconds(1.0)));
        reality.set_enabled(true);
        assert!(reality.tick(Timestamp::from_seconds(2.0)));
        reality.set_enabled(false);
        assert!(!reality.tick(Timestamp::from_seconds(3.0)));

        assert_eq!(*ticks.lock(), vec![Timestamp::from_seconds(2.0)]);
    }

    #[test]
    fn test_display_frames_need_auto_tick() {
        let registry = RealityRegistry::new(EntityCollection::new());
        let reality = registry.create(RealityKind::Generic);
        reality.set_enabled(true);
        assert!(!reality.auto_tick());
        assert!(!reality.on_display_frame(Duration::from_millis(16), Timestamp::EPOCH));

        reality.set_auto_tick(true);
        assert!(reality.on_display_frame(Duration::from_millis(32), Timestamp::EPOCH));
        assert_eq!(reality.tick_stats().skipped_frames, 0);
    }

    #[test]
    fn test_configuration_round_trip() {
        let registry = RealityRegistry::new(EntityCollection::new());
        let reality = registry.color("black");
        let config = reality.configuration();
        assert_eq!(config.kind.as_deref(), Some("Color"));
        assert_eq!(config.options.get("color"), Some(&json!("black")));

        let other = RealityRegistry::new(EntityCollection::new());
        let rebuilt = other.from_configuration(&config);
        assert_eq!(rebuilt.id(), reality.id());
        assert_eq!(rebuilt.render_script(), reality.render_script());
        assert!(rebuilt.is_trusted());
    }

    #[test]
    fn test_destroy_announces_and_stops() {
        let registry = RealityRegistry::new(EntityCollection::new());
        let reality = registry.create(RealityKind::Color);
        let torn = Arc::new(Mutex::new(None));
        let t = Arc::clone(&torn);
        reality.events().teardown.on(move |id| *t.lock() = Some(id.clone()));

        reality.set_enabled(true);
        reality.destroy();
        reality.destroy();
        assert_eq!(torn.lock().as_ref(), Some(reality.id()));
        assert!(!reality.tick(Timestamp::EPOCH));
        assert!(!reality.auto_tick());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_ticks_and_stops_on_destroy() {
        let registry = RealityRegistry::new(EntityCollection::new());
        let reality = registry.create(RealityKind::Color);
        reality.set_enabled(true);
        let ticks = counter(&reality);

        let looping = Arc::clone(&reality);
        let handle = tokio::spawn(async move { looping.run_loop(Duration::from_millis(16)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ticks.lock().is_empty());

        registry.destroy(reality.id());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits after destroy")
            .unwrap();
    }
}
