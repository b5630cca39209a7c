//! # Content Session
//!
//! The content side of the immersive protocol: binds a [`Context`] to a
//! [`ManagerPort`].
//!
//! ```text
//!   manager ──update──────────> Context::update
//!           ──presentationMode─> events.presentation_mode
//!           ──focus / blur─────> events.focus
//!
//!   Context.required_reality ──> requiredReality {configuration}
//!        reality options ──────> requiredRealityOptionsChange {id, value}
//!   Context.required_* ────────> requiredCapabilities / requiredReferenceFrames
//!   Context options ───────────> options {...}
//! ```
//!
//! Without a manager the session runs standalone: it renders its own
//! reality through the context's view, falling back to a transparent
//! Color reality.

use crate::context::Context;
use crate::reality::{Reality, RealityRegistry};
use parking_lot::Mutex;
use periscope_core::{EventHandler, ListenerId};
use periscope_messaging::{Connection, ManagerPort};
use periscope_shared::{Message, PresentationMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Color of the reality a standalone session falls back to.
pub const STANDALONE_COLOR: &str = "transparent";

/// Events of a content session.
#[derive(Debug, Default)]
pub struct SessionEvents {
    /// The manager switched presentation.
    pub presentation_mode: EventHandler<PresentationMode>,
    /// Focus gained (`true`) or lost (`false`).
    pub focus: EventHandler<bool>,
}

/// Content-side glue between a context and its manager.
pub struct ContentSession {
    context: Arc<Context>,
    port: ManagerPort,
    realities: Arc<RealityRegistry>,
    standalone: AtomicBool,
    focused: AtomicBool,
    presentation_mode: Mutex<Option<PresentationMode>>,
    option_forward: Mutex<Option<(Arc<Reality>, ListenerId)>>,
    events: SessionEvents,
}

impl ContentSession {
    /// Binds `context` to `port`. The context's view stays disabled until
    /// [`ContentSession::start`] finds no manager.
    #[must_use]
    pub fn new(context: Arc<Context>, port: ManagerPort, realities: Arc<RealityRegistry>) -> Arc<Self> {
        context.reality_view().disable();
        let session = Arc::new(Self {
            context,
            port,
            realities,
            standalone: AtomicBool::new(false),
            focused: AtomicBool::new(false),
            presentation_mode: Mutex::new(None),
            option_forward: Mutex::new(None),
            events: SessionEvents::default(),
        });
        wire(&session);
        session
    }

    /// Waits up to `limit` for the manager.
    ///
    /// Managed sessions keep the local view disabled and render the
    /// manager's updates. Standalone sessions enable it, installing a
    /// transparent reality if none is required.
    pub async fn start(&self, limit: Duration) -> Connection {
        let connection = self.port.when_connected(limit).await;
        match &connection {
            Connection::Managed(payload) => {
                self.focused.store(payload.focus, Ordering::Release);
                self.context.reality_view().disable();
                tracing::info!(manager = %payload.version, focus = payload.focus, "managed session");
            }
            Connection::Standalone => {
                self.standalone.store(true, Ordering::Release);
                if self.context.required_reality().is_none() {
                    let reality = self.realities.color(STANDALONE_COLOR);
                    if let Some(commit) = self.context.set_required_reality(Some(reality)) {
                        commit.detach();
                    }
                }
                if let Some(commit) = self.context.reality_view().enable() {
                    commit.detach();
                }
                tracing::info!("standalone session");
            }
        }
        connection
    }

    /// The presentation context.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// The port to the manager.
    #[must_use]
    pub fn port(&self) -> &ManagerPort {
        &self.port
    }

    /// True once [`ContentSession::start`] gave up on a manager.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.standalone.load(Ordering::Acquire)
    }

    /// True while the manager focuses this content.
    #[must_use]
    pub fn has_focus(&self) -> bool {
        self.focused.load(Ordering::Acquire)
    }

    /// Last presentation mode the manager set.
    #[must_use]
    pub fn presentation_mode(&self) -> Option<PresentationMode> {
        *self.presentation_mode.lock()
    }

    /// Events.
    #[must_use]
    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Processes every message from the manager.
    pub fn pump(&self) -> usize {
        self.port.pump()
    }

    fn publish(&self, message: &Message) {
        if !self.is_standalone() {
            self.port.send(message);
        }
    }

    fn on_message(&self, message: &Message) {
        match message {
            Message::Update(frame_state) => {
                if let Err(error) = self.context.update(frame_state) {
                    tracing::error!(%error, "frame state from manager rejected");
                }
            }
            Message::PresentationMode { mode } => {
                *self.presentation_mode.lock() = Some(*mode);
                self.events.presentation_mode.emit(mode);
            }
            Message::Focus => self.set_focus(true),
            Message::Blur => self.set_focus(false),
            other => tracing::trace!(kind = other.message_type(), "message ignored"),
        }
    }

    fn set_focus(&self, focus: bool) {
        if self.focused.swap(focus, Ordering::AcqRel) != focus {
            self.events.focus.emit(&focus);
        }
    }

    fn on_required_reality(self: &Arc<Self>, reality: Option<&Arc<Reality>>) {
        let previous = self.option_forward.lock().take();
        if let Some((reality, listener)) = previous {
            reality.options().on_change().remove(listener);
        }
        if let Some(reality) = reality {
            let weak = Arc::downgrade(self);
            let listener = reality.options().on_change().on(move |change| {
                with(&weak, |session| {
                    session.publish(&Message::RequiredRealityOptionsChange {
                        id: change.id.clone(),
                        value: change.value.clone(),
                    });
                });
            });
            *self.option_forward.lock() = Some((Arc::clone(reality), listener));
        }
        self.publish(&Message::RequiredReality {
            configuration: reality.map(|r| r.configuration()),
        });
    }
}

impl std::fmt::Debug for ContentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentSession")
            .field("port", &self.port)
            .field("standalone", &self.is_standalone())
            .field("focused", &self.has_focus())
            .finish_non_exhaustive()
    }
}

fn with(weak: &Weak<ContentSession>, f: impl FnOnce(&Arc<ContentSession>)) {
    if let Some(session) = weak.upgrade() {
        f(&session);
    }
}

fn wire(session: &Arc<ContentSession>) {
    let weak = Arc::downgrade(session);
    session
        .port
        .messages()
        .on(move |message| with(&weak, |s| s.on_message(message)));

    let events = session.context.events();
    let weak = Arc::downgrade(session);
    events
        .required_reality
        .on(move |change| with(&weak, |s| s.on_required_reality(change.reality.as_ref())));

    let weak = Arc::downgrade(session);
    events.required_capabilities.on(move |capabilities| {
        with(&weak, |s| {
            s.publish(&Message::RequiredCapabilities {
                capabilities: capabilities.clone(),
            });
        });
    });

    let weak = Arc::downgrade(session);
    events.required_reference_frames.on(move |frames| {
        with(&weak, |s| {
            s.publish(&Message::RequiredReferenceFrames { frames: frames.clone() });
        });
    });

    let weak = Arc::downgrade(session);
    session.context.options().on_change().on(move |_| {
        with(&weak, |s| s.publish(&Message::Options(s.context.options().snapshot())));
    });
}
