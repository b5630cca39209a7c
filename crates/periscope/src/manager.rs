//! # Immersive Manager
//!
//! The privileged side: owns the presentation context, hosts content
//! channels and decides which reality is rendered.
//!
//! ```text
//!   channel messages ──> per-channel requirements
//!                           │  requiredReality / capabilities / frames / options
//!                           v
//!   focus(channel) ──> RealityPolicy::choose ──> Context::set_required_reality
//!                                                        │
//!   reality ticks ──> RealityView ──> Context.update ────┴──> broadcast "update"
//! ```
//!
//! Requirements are kept per channel. Only the focused channel's
//! requirements drive the context; the others are remembered until their
//! channel is focused or unloaded.

use crate::config::PeriscopeConfig;
use crate::context::Context;
use crate::reality::{Reality, RealityRegistry};
use parking_lot::Mutex;
use periscope_core::Timestamp;
use periscope_messaging::{ChannelId, ChannelManager, ChannelMessage};
use periscope_shared::{Message, PresentationMode, RealityConfiguration};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

// =============================================================================
// POLICY
// =============================================================================

/// What a policy decides from.
#[derive(Debug)]
pub struct PolicyRequest<'a> {
    /// The focused channel, if any.
    pub channel: Option<ChannelId>,
    /// The reality that channel asked for.
    pub required: Option<Arc<Reality>>,
    /// Every live reality.
    pub realities: &'a RealityRegistry,
    /// The manager's fallback reality.
    pub default: &'a Arc<Reality>,
}

/// Picks the reality to render.
pub trait RealityPolicy: Send + Sync {
    /// The reality to render, or `None` to render nothing.
    fn choose(&self, request: &PolicyRequest<'_>) -> Option<Arc<Reality>>;
}

/// The focused channel's requirement, else the first registered reality,
/// else the default.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPolicy;

impl RealityPolicy for DefaultPolicy {
    fn choose(&self, request: &PolicyRequest<'_>) -> Option<Arc<Reality>> {
        request
            .required
            .clone()
            .or_else(|| request.realities.query().into_iter().next())
            .or_else(|| Some(Arc::clone(request.default)))
    }
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Default)]
struct Requirements {
    reality: HashMap<ChannelId, Arc<Reality>>,
    capabilities: HashMap<ChannelId, Vec<String>>,
    reference_frames: HashMap<ChannelId, Vec<String>>,
    options: HashMap<ChannelId, Map<String, Value>>,
    presentation_mode: Option<PresentationMode>,
}

struct ManagerInner {
    context: Arc<Context>,
    channels: ChannelManager,
    realities: Arc<RealityRegistry>,
    policy: Arc<dyn RealityPolicy>,
    default_reality: Arc<Reality>,
    requirements: Mutex<Requirements>,
}

/// Arbitrates realities and presentation between content channels.
#[derive(Clone)]
pub struct ImmersiveManager {
    inner: Arc<ManagerInner>,
}

impl ImmersiveManager {
    /// Creates a manager with the [`DefaultPolicy`].
    #[must_use]
    pub fn new(
        context: Arc<Context>,
        channels: ChannelManager,
        realities: Arc<RealityRegistry>,
        config: &PeriscopeConfig,
    ) -> Self {
        Self::with_policy(context, channels, realities, config, Arc::new(DefaultPolicy))
    }

    /// Creates a manager choosing realities with `policy`.
    #[must_use]
    pub fn with_policy(
        context: Arc<Context>,
        channels: ChannelManager,
        realities: Arc<RealityRegistry>,
        config: &PeriscopeConfig,
        policy: Arc<dyn RealityPolicy>,
    ) -> Self {
        let default_reality = realities.color(&config.reality.default_color);
        let inner = Arc::new(ManagerInner {
            context,
            channels,
            realities,
            policy,
            default_reality,
            requirements: Mutex::new(Requirements::default()),
        });
        wire(&inner);
        tracing::info!(
            version = %inner.channels.version(),
            default_reality = %inner.default_reality.id(),
            "immersive manager ready"
        );
        Self { inner }
    }

    /// The presentation context.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    /// The hosted channels.
    #[must_use]
    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    /// Live realities.
    #[must_use]
    pub fn realities(&self) -> &Arc<RealityRegistry> {
        &self.inner.realities
    }

    /// Rendered when nothing else is chosen.
    #[must_use]
    pub fn default_reality(&self) -> &Arc<Reality> {
        &self.inner.default_reality
    }

    /// The reality `channel` requires.
    #[must_use]
    pub fn required_reality_of(&self, channel: ChannelId) -> Option<Arc<Reality>> {
        self.inner.requirements.lock().reality.get(&channel).cloned()
    }

    /// Capabilities `channel` requires.
    #[must_use]
    pub fn required_capabilities_of(&self, channel: ChannelId) -> Vec<String> {
        self.inner
            .requirements
            .lock()
            .capabilities
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Reference frames `channel` requires.
    #[must_use]
    pub fn required_reference_frames_of(&self, channel: ChannelId) -> Vec<String> {
        self.inner
            .requirements
            .lock()
            .reference_frames
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Context options `channel` published.
    #[must_use]
    pub fn options_of(&self, channel: ChannelId) -> Option<Map<String, Value>> {
        self.inner.requirements.lock().options.get(&channel).cloned()
    }

    /// Last presentation mode set.
    #[must_use]
    pub fn presentation_mode(&self) -> Option<PresentationMode> {
        self.inner.requirements.lock().presentation_mode
    }

    /// Switches presentation and tells the focused channel.
    pub fn set_presentation_mode(&self, mode: PresentationMode) {
        self.inner.requirements.lock().presentation_mode = Some(mode);
        if let Some(channel) = self.inner.channels.focused_channel() {
            if let Err(error) = channel.send(&Message::PresentationMode { mode }) {
                tracing::debug!(channel = %channel.id(), %error, "presentation mode not delivered");
            }
        }
    }

    /// Ticks the rendered reality. Returns false if nothing ticked.
    pub fn tick(&self, time: Timestamp) -> bool {
        self.inner
            .context
            .required_reality()
            .is_some_and(|reality| reality.tick(time))
    }

    /// Processes every pending channel message.
    pub fn pump(&self) -> usize {
        self.inner.channels.pump()
    }
}

impl std::fmt::Debug for ImmersiveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmersiveManager")
            .field("channels", &self.inner.channels)
            .field("realities", &self.inner.realities)
            .finish_non_exhaustive()
    }
}

fn wire(inner: &Arc<ManagerInner>) {
    let weak = Arc::downgrade(inner);
    let channels = inner.channels.clone();
    inner.context.events().update.on(move |frame_state| {
        if weak.strong_count() > 0 {
            channels.broadcast(&Message::Update(Box::new(frame_state.clone())));
        }
    });

    let events = inner.channels.events();
    let weak = Arc::downgrade(inner);
    events.focus.on(move |channel| with(&weak, |inner| inner.on_focus(*channel)));
    let weak = Arc::downgrade(inner);
    events.unload.on(move |channel| with(&weak, |inner| inner.on_unload(*channel)));
    let weak = Arc::downgrade(inner);
    events.message.on(move |message| with(&weak, |inner| inner.on_message(message)));
}

fn with(weak: &Weak<ManagerInner>, f: impl FnOnce(&ManagerInner)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

impl ManagerInner {
    fn is_focused(&self, channel: ChannelId) -> bool {
        self.channels.focused() == Some(channel)
    }

    fn on_focus(&self, channel: ChannelId) {
        let (options, required) = {
            let requirements = self.requirements.lock();
            (
                requirements.options.get(&channel).cloned(),
                requirements.reality.get(&channel).cloned(),
            )
        };
        if let Some(options) = options {
            self.context.options().set_options(&options);
        }
        self.select_reality(Some(channel), required);
    }

    fn on_unload(&self, channel: ChannelId) {
        let reality = {
            let mut requirements = self.requirements.lock();
            requirements.capabilities.remove(&channel);
            requirements.reference_frames.remove(&channel);
            requirements.options.remove(&channel);
            requirements.reality.remove(&channel)
        };
        if let Some(reality) = reality {
            tracing::debug!(%channel, reality = %reality.id(), "destroying unloaded channel's reality");
            self.realities.destroy(reality.id());
        }
        if self.is_focused(channel) {
            self.select_reality(Some(channel), None);
        }
    }

    fn on_message(&self, received: &ChannelMessage) {
        let channel = received.channel;
        match &received.message {
            Message::RequiredReality { configuration } => self.on_required_reality(channel, configuration.as_ref()),
            Message::RequiredRealityOptionsChange { id, value } => {
                let reality = self.requirements.lock().reality.get(&channel).cloned();
                match reality {
                    Some(reality) => reality.options().set(id.clone(), value.clone()),
                    None => tracing::warn!(%channel, option = %id, "option change without a required reality"),
                }
            }
            Message::RequiredCapabilities { capabilities } => {
                tracing::debug!(%channel, ?capabilities, "capabilities required");
                self.requirements
                    .lock()
                    .capabilities
                    .insert(channel, capabilities.clone());
            }
            Message::RequiredReferenceFrames { frames } => {
                tracing::debug!(%channel, ?frames, "reference frames required");
                self.requirements
                    .lock()
                    .reference_frames
                    .insert(channel, frames.clone());
            }
            Message::Options(options) => {
                self.requirements.lock().options.insert(channel, options.clone());
                if self.is_focused(channel) {
                    self.context.options().set_options(options);
                }
            }
            other => tracing::trace!(%channel, kind = other.message_type(), "message ignored"),
        }
    }

    fn on_required_reality(&self, channel: ChannelId, configuration: Option<&RealityConfiguration>) {
        let reality = configuration.map(|config| self.realities.from_configuration(config));
        let previous = {
            let mut requirements = self.requirements.lock();
            match &reality {
                Some(reality) => requirements.reality.insert(channel, Arc::clone(reality)),
                None => requirements.reality.remove(&channel),
            }
        };
        if let Some(previous) = previous {
            if !reality.as_ref().is_some_and(|r| Arc::ptr_eq(r, &previous)) {
                self.realities.destroy(previous.id());
            }
        }
        tracing::debug!(%channel, reality = ?reality.as_ref().map(|r| r.id().clone()), "reality required");
        if self.is_focused(channel) {
            self.select_reality(Some(channel), reality);
        }
    }

    fn select_reality(&self, channel: Option<ChannelId>, required: Option<Arc<Reality>>) {
        let chosen = self.policy.choose(&PolicyRequest {
            channel,
            required,
            realities: &self.realities,
            default: &self.default_reality,
        });
        if let Some(commit) = self.context.set_required_reality(chosen) {
            commit.detach();
        }
    }
}
