//! # Reality View
//!
//! Renders one reality inside an isolated sandbox and relays frame states
//! into it.
//!
//! ```text
//!   set_reality(r) ──> Commit ──load css/js──> materialize(key) ──> sandbox
//!                        │                                           │
//!                        │         receive(key, "connect") <─────────┤
//!                        │   post(key, "startRenderScript") ─────────>│
//!                        └── ready <── receive(key, "ready") <────────┘
//!                             └──> post(key, "options")
//!
//!   r.tick ──> FrameState ──> post(key, "update")   (ready sandbox only)
//!                        └──> events.update          (always, while enabled)
//! ```
//!
//! Every commit gets a fresh [`SandboxKey`]. Messages carrying any other
//! key are stale and dropped, and a superseded commit settles as
//! [`CommitOutcome::Cancelled`]. Messages are posted outside the view's
//! lock, so a sandbox may answer synchronously.
//!
//! Sandboxes of untrusted realities may only send object or empty events
//! that decode as protocol messages; anything else is dropped.

use crate::error::{CommitError, CommitResult, RealityError, RealityResult, ResourceError};
use crate::reality::{Reality, RealityTick};
use async_trait::async_trait;
use parking_lot::Mutex;
use periscope_core::{frames, Ellipsoid, Entity, EventHandler, FrameError, ListenerId, ReferenceFrame, Timestamp};
use periscope_shared::{
    FrameOrientation, FramePosition, FrameRef, FrameState, Frustum, Message, ProtocolError, ProtocolResult,
    RealityId, RealityRef, WireMessage,
};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Message types exchanged with a sandbox.
pub mod messages {
    /// Sandbox to view: the sandbox's port is up.
    pub const CONNECT: &str = "connect";
    /// View to sandbox: run the render routine.
    pub const START_RENDER_SCRIPT: &str = "startRenderScript";
    /// Sandbox to view: the render routine attached.
    pub const READY: &str = "ready";
    /// Sandbox to view: the render routine failed.
    pub const ERROR: &str = "error";
}

/// Identifies one materialized sandbox document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SandboxKey(String);

impl SandboxKey {
    /// A fresh, process-unique key.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a sandbox needs to build its document.
#[derive(Clone, Debug, PartialEq)]
pub struct SandboxDocument {
    /// Key the sandbox must tag its replies with.
    pub key: SandboxKey,
    /// Loaded stylesheet sources, in declaration order.
    pub stylesheets: Vec<String>,
    /// Loaded script sources, in declaration order.
    pub scripts: Vec<String>,
    /// Render routine source; run on `startRenderScript`.
    pub render_script: String,
}

/// An isolated execution environment for reality content.
///
/// Implementations report back through [`RealityView::receive`].
pub trait Sandbox: Send + Sync {
    /// Replaces the current document with `document`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document could not be built.
    fn materialize(&self, document: SandboxDocument) -> Result<(), ResourceError>;

    /// Delivers a message to the document tagged `key`.
    fn post(&self, key: &SandboxKey, message: WireMessage);

    /// Tears the document down.
    fn detach(&self);
}

/// Fetches declared stylesheets and scripts.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Loads `url` as text.
    async fn load(&self, url: &str) -> Result<String, ResourceError>;
}

// =============================================================================
// COMMITS
// =============================================================================

/// Cancels a commit.
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// A fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(false).0),
        }
    }

    /// Cancels. Idempotent.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // `self` keeps the sender alive, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// How a commit settled without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The sandbox acknowledged and has the current options.
    Ready,
    /// A newer `set_reality` or a disable superseded this commit.
    Cancelled,
    /// The view was cleared; nothing to commit.
    Detached,
    /// The view is disabled; the commit runs when it is enabled again.
    Deferred,
}

enum Settlement {
    Settled(CommitResult<CommitOutcome>),
    Running(JoinHandle<CommitResult<CommitOutcome>>),
}

/// Handle to a reality commit.
///
/// The commit runs on the tokio runtime from the moment it starts and logs
/// its own result. Awaiting the handle yields the outcome; dropping it
/// leaves the commit running.
pub struct Commit {
    token: CancelToken,
    settlement: Settlement,
}

impl Commit {
    fn settled(outcome: CommitResult<CommitOutcome>) -> Self {
        Self {
            token: CancelToken::new(),
            settlement: Settlement::Settled(outcome),
        }
    }

    fn start(inner: Arc<ViewInner>, token: CancelToken, reality: Arc<Reality>) -> Self {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(reality = %reality.id(), "no async runtime, reality commit not started");
            return Self {
                token,
                settlement: Settlement::Settled(Err(CommitError::NoRuntime)),
            };
        };
        let task = runtime.spawn({
            let token = token.clone();
            async move {
                let id = reality.id().clone();
                let result = run_commit(inner, token, reality).await;
                match &result {
                    Ok(outcome) => tracing::debug!(reality = %id, ?outcome, "reality commit settled"),
                    Err(error) => tracing::error!(reality = %id, %error, "reality commit failed"),
                }
                result
            }
        });
        Self {
            token,
            settlement: Settlement::Running(task),
        }
    }

    fn is_running(&self) -> bool {
        matches!(self.settlement, Settlement::Running(_))
    }

    /// This commit's cancel token.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Cancels this commit.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Releases the handle. A running commit keeps running.
    pub fn detach(self) {}
}

impl Future for Commit {
    type Output = CommitResult<CommitOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match &mut self.settlement {
            Settlement::Settled(outcome) => Poll::Ready(outcome.clone()),
            Settlement::Running(task) => Pin::new(task)
                .poll(cx)
                .map(|joined| joined.unwrap_or_else(|error| Err(CommitError::Aborted(error.to_string())))),
        }
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("running", &self.is_running())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// VIEW
// =============================================================================

/// Events of a reality view.
#[derive(Debug, Default)]
pub struct RealityViewEvents {
    /// A frame state computed from a tick.
    pub update: EventHandler<FrameState>,
    /// A message from the sandbox that is not part of the commit handshake.
    pub message: EventHandler<WireMessage>,
}

struct Subscriptions {
    reality: Arc<Reality>,
    tick: ListenerId,
    options: ListenerId,
    message: ListenerId,
    teardown: ListenerId,
}

impl Subscriptions {
    fn cancel(self) {
        let events = self.reality.events();
        events.tick.remove(self.tick);
        events.message.remove(self.message);
        events.teardown.remove(self.teardown);
        self.reality.options().on_change().remove(self.options);
    }
}

struct Attachment {
    key: SandboxKey,
    reality: RealityId,
    trusted: bool,
    ready: bool,
    ack: Option<oneshot::Sender<CommitResult<()>>>,
}

struct ViewState {
    enabled: bool,
    reality: Option<Arc<Reality>>,
    subscriptions: Option<Subscriptions>,
    pending: Option<CancelToken>,
    attachment: Option<Attachment>,
    default_frustum: Frustum,
    frame_number: u32,
}

impl ViewState {
    /// Key of the ready sandbox rendering `reality`.
    fn ready_key(&self, reality: &RealityId) -> Option<SandboxKey> {
        self.attachment
            .as_ref()
            .filter(|a| a.ready && &a.reality == reality)
            .map(|a| a.key.clone())
    }

    fn is_current(&self, reality: &RealityId) -> bool {
        self.reality.as_ref().is_some_and(|r| r.id() == reality)
    }
}

struct ViewInner {
    sandbox: Arc<dyn Sandbox>,
    loader: Arc<dyn ResourceLoader>,
    state: Mutex<ViewState>,
    events: RealityViewEvents,
}

/// Renders a reality in a sandbox.
#[derive(Clone)]
pub struct RealityView {
    inner: Arc<ViewInner>,
}

/// Non-owning handle to a [`RealityView`], for sandboxes that answer it.
#[derive(Clone, Debug)]
pub struct WeakRealityView(Weak<ViewInner>);

impl WeakRealityView {
    /// The view, if still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<RealityView> {
        self.0.upgrade().map(|inner| RealityView { inner })
    }
}

impl fmt::Debug for ViewInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewInner").finish_non_exhaustive()
    }
}

impl RealityView {
    /// Creates an enabled view with no reality and a frustum of `default_fov`.
    #[must_use]
    pub fn new(sandbox: Arc<dyn Sandbox>, loader: Arc<dyn ResourceLoader>, default_fov: f64) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                sandbox,
                loader,
                state: Mutex::new(ViewState {
                    enabled: true,
                    reality: None,
                    subscriptions: None,
                    pending: None,
                    attachment: None,
                    default_frustum: Frustum {
                        fov: default_fov,
                        ..Frustum::default()
                    },
                    frame_number: 0,
                }),
                events: RealityViewEvents::default(),
            }),
        }
    }

    /// A non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakRealityView {
        WeakRealityView(Arc::downgrade(&self.inner))
    }

    /// Events.
    #[must_use]
    pub fn events(&self) -> &RealityViewEvents {
        &self.inner.events
    }

    /// The reality being rendered.
    #[must_use]
    pub fn reality(&self) -> Option<Arc<Reality>> {
        self.inner.state.lock().reality.clone()
    }

    /// True while ticks are forwarded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// True once the current reality's sandbox acknowledged.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.inner.state.lock();
        state
            .reality
            .as_ref()
            .is_some_and(|r| state.ready_key(r.id()).is_some())
    }

    /// Frustum used when the reality supplies none.
    #[must_use]
    pub fn default_frustum(&self) -> Frustum {
        self.inner.state.lock().default_frustum
    }

    /// Updates the default frustum's aspect ratio from a viewport size.
    pub fn resize(&self, width: f64, height: f64) {
        if width > 0.0 && height > 0.0 {
            self.inner.state.lock().default_frustum.aspect_ratio = width / height;
        }
    }

    /// Switches to `reality`, or detaches with `None`.
    ///
    /// Cancels any commit still in flight. With a reality and an enabled
    /// view a commit starts on the current tokio runtime: it loads,
    /// materializes and waits for the sandbox. On a disabled view the
    /// handle settles as [`CommitOutcome::Deferred`].
    pub fn set_reality(&self, reality: Option<Arc<Reality>>) -> Commit {
        let (previous, pending) = {
            let mut state = self.inner.state.lock();
            state.attachment = None;
            (
                state.subscriptions.take().map(|subs| {
                    let reality = Arc::clone(&subs.reality);
                    subs.cancel();
                    reality
                }),
                state.pending.take(),
            )
        };
        if let Some(token) = pending {
            token.cancel();
        }
        if let Some(previous) = &previous {
            previous.set_enabled(false);
        }

        let Some(reality) = reality else {
            self.inner.state.lock().reality = None;
            self.inner.sandbox.detach();
            return Commit::settled(Ok(CommitOutcome::Detached));
        };

        let subscriptions = self.subscribe(&reality);
        reality.set_enabled(true);
        let mut state = self.inner.state.lock();
        state.reality = Some(Arc::clone(&reality));
        state.subscriptions = Some(subscriptions);
        if state.enabled {
            self.start_commit(&mut state, reality)
        } else {
            Commit::settled(Ok(CommitOutcome::Deferred))
        }
    }

    /// Enables or disables the view. See [`RealityView::enable`] and
    /// [`RealityView::disable`].
    pub fn set_enabled(&self, enabled: bool) -> Option<Commit> {
        if enabled {
            self.enable()
        } else {
            self.disable();
            None
        }
    }

    /// Resumes forwarding. Starts a commit, and returns its handle, if the
    /// current reality is not yet committed.
    pub fn enable(&self) -> Option<Commit> {
        let mut state = self.inner.state.lock();
        if state.enabled {
            return None;
        }
        state.enabled = true;
        let reality = state.reality.clone()?;
        if state.ready_key(reality.id()).is_some() || state.pending.is_some() {
            return None;
        }
        Some(self.start_commit(&mut state, reality))
    }

    /// Stops forwarding and cancels an in-flight commit. A committed
    /// sandbox stays loaded.
    pub fn disable(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.enabled = false;
            let pending = state.pending.take();
            if pending.is_some() {
                // The cancelled commit never attached; forget its key.
                if state.attachment.as_ref().is_some_and(|a| !a.ready) {
                    state.attachment = None;
                }
            }
            pending
        };
        if let Some(token) = pending {
            tracing::debug!("reality commit cancelled by disable");
            token.cancel();
        }
    }

    /// Handles a message from the sandbox document tagged `key`.
    pub fn receive(&self, key: &SandboxKey, message: WireMessage) {
        enum Action {
            Start,
            Emit(WireMessage),
        }

        let action = {
            let mut state = self.inner.state.lock();
            let Some(attachment) = state.attachment.as_mut().filter(|a| &a.key == key) else {
                tracing::debug!(%key, message_type = %message.message_type, "stale sandbox message dropped");
                return;
            };
            match message.message_type.as_str() {
                messages::CONNECT => Some(Action::Start),
                messages::READY => {
                    if let Some(ack) = attachment.ack.take() {
                        let _ = ack.send(Ok(()));
                    }
                    None
                }
                messages::ERROR => {
                    let reason = error_text(&message.event);
                    match attachment.ack.take() {
                        Some(ack) => {
                            let _ = ack.send(Err(CommitError::SandboxFailure(reason)));
                        }
                        None => tracing::error!(%key, %reason, "render routine failed"),
                    }
                    None
                }
                _ if !attachment.trusted => match validate_untrusted(message) {
                    Ok(message) => Some(Action::Emit(message)),
                    Err(error) => {
                        tracing::warn!(%key, %error, "message from untrusted reality dropped");
                        None
                    }
                },
                _ => Some(Action::Emit(message)),
            }
        };

        match action {
            Some(Action::Start) => self.inner.sandbox.post(
                key,
                WireMessage {
                    message_type: messages::START_RENDER_SCRIPT.to_string(),
                    event: Value::Null,
                },
            ),
            Some(Action::Emit(message)) => self.inner.events.message.emit(&message),
            None => {}
        }
    }

    fn start_commit(&self, state: &mut ViewState, reality: Arc<Reality>) -> Commit {
        if let Some(previous) = state.pending.take() {
            previous.cancel();
        }
        let token = CancelToken::new();
        let commit = Commit::start(Arc::clone(&self.inner), token.clone(), reality);
        if commit.is_running() {
            state.pending = Some(token);
        }
        commit
    }

    fn subscribe(&self, reality: &Arc<Reality>) -> Subscriptions {
        let events = reality.events();

        let weak_view = Arc::downgrade(&self.inner);
        let weak_reality = Arc::downgrade(reality);
        let tick = events.tick.on(move |tick| {
            if let (Some(inner), Some(reality)) = (weak_view.upgrade(), weak_reality.upgrade()) {
                on_tick(&inner, &reality, *tick);
            }
        });

        let weak_view = Arc::downgrade(&self.inner);
        let weak_reality = Arc::downgrade(reality);
        let options = reality.options().on_change().on(move |_| {
            if let (Some(inner), Some(reality)) = (weak_view.upgrade(), weak_reality.upgrade()) {
                let key = {
                    let state = inner.state.lock();
                    if !state.enabled {
                        return;
                    }
                    state.ready_key(reality.id())
                };
                if let Some(key) = key {
                    inner.sandbox.post(&key, options_message(&reality));
                }
            }
        });

        let weak_view = Arc::downgrade(&self.inner);
        let id = reality.id().clone();
        let message = events.message.on(move |message| {
            if let Some(inner) = weak_view.upgrade() {
                let key = inner.state.lock().ready_key(&id);
                if let Some(key) = key {
                    inner.sandbox.post(&key, message.clone());
                }
            }
        });

        let weak_view = Arc::downgrade(&self.inner);
        let teardown = events.teardown.on(move |id| {
            if let Some(inner) = weak_view.upgrade() {
                let view = RealityView { inner };
                if view.reality().is_some_and(|r| r.id() == id) {
                    tracing::debug!(reality = %id, "rendered reality torn down, detaching");
                    view.set_reality(None).detach();
                }
            }
        });

        Subscriptions {
            reality: Arc::clone(reality),
            tick,
            options,
            message,
            teardown,
        }
    }
}

impl fmt::Debug for RealityView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RealityView")
            .field("reality", &state.reality.as_ref().map(|r| r.id().clone()))
            .field("enabled", &state.enabled)
            .field("committing", &state.pending.is_some())
            .finish_non_exhaustive()
    }
}

async fn run_commit(inner: Arc<ViewInner>, token: CancelToken, reality: Arc<Reality>) -> CommitResult<CommitOutcome> {
    if token.is_cancelled() {
        return Ok(CommitOutcome::Cancelled);
    }
    let loaded = tokio::select! {
        biased;
        () = token.cancelled() => return Ok(CommitOutcome::Cancelled),
        loaded = load_resources(inner.loader.as_ref(), &reality) => loaded,
    };
    let (stylesheets, scripts) = match loaded {
        Ok(loaded) => loaded,
        Err(error) => {
            settle_pending(&inner, &token);
            return Err(error);
        }
    };

    let key = SandboxKey::generate();
    let (ack_tx, ack_rx) = oneshot::channel();
    {
        let mut state = inner.state.lock();
        if token.is_cancelled() {
            return Ok(CommitOutcome::Cancelled);
        }
        state.attachment = Some(Attachment {
            key: key.clone(),
            reality: reality.id().clone(),
            trusted: reality.is_trusted(),
            ready: false,
            ack: Some(ack_tx),
        });
    }

    let document = SandboxDocument {
        key: key.clone(),
        stylesheets,
        scripts,
        render_script: reality.render_script().to_string(),
    };
    if let Err(error) = inner.sandbox.materialize(document) {
        forget(&inner, &token, &key);
        return Err(CommitError::SandboxFailure(error.0));
    }

    let acknowledged = tokio::select! {
        biased;
        () = token.cancelled() => return Ok(CommitOutcome::Cancelled),
        ack = ack_rx => ack,
    };
    match acknowledged {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            forget(&inner, &token, &key);
            return Err(error);
        }
        // Attachment replaced before the sandbox answered.
        Err(_) => return Ok(CommitOutcome::Cancelled),
    }

    {
        let mut state = inner.state.lock();
        if token.is_cancelled() {
            return Ok(CommitOutcome::Cancelled);
        }
        match state.attachment.as_mut() {
            Some(attachment) if attachment.key == key => attachment.ready = true,
            _ => return Ok(CommitOutcome::Cancelled),
        }
        state.pending = None;
    }
    inner.sandbox.post(&key, options_message(&reality));
    tracing::debug!(reality = %reality.id(), %key, "reality committed");
    Ok(CommitOutcome::Ready)
}

async fn load_resources(
    loader: &dyn ResourceLoader,
    reality: &Reality,
) -> CommitResult<(Vec<String>, Vec<String>)> {
    let mut stylesheets = Vec::with_capacity(reality.css_deps().len());
    for url in reality.css_deps() {
        stylesheets.push(load_one(loader, url).await?);
    }
    let mut scripts = Vec::with_capacity(reality.js_deps().len());
    for url in reality.js_deps() {
        scripts.push(load_one(loader, url).await?);
    }
    Ok((stylesheets, scripts))
}

async fn load_one(loader: &dyn ResourceLoader, url: &str) -> CommitResult<String> {
    loader.load(url).await.map_err(|error| {
        tracing::warn!(%url, %error, "reality resource failed to load");
        CommitError::ResourceLoadFailure {
            url: url.to_string(),
            reason: error.0,
        }
    })
}

/// Clears the pending slot if it still belongs to `token`.
fn settle_pending(inner: &ViewInner, token: &CancelToken) {
    let mut state = inner.state.lock();
    if state
        .pending
        .as_ref()
        .is_some_and(|pending| Arc::ptr_eq(&pending.state, &token.state))
    {
        state.pending = None;
    }
}

/// Drops a failed commit's attachment and pending slot.
fn forget(inner: &ViewInner, token: &CancelToken, key: &SandboxKey) {
    settle_pending(inner, token);
    let mut state = inner.state.lock();
    if state.attachment.as_ref().is_some_and(|a| &a.key == key) {
        state.attachment = None;
    }
}

fn on_tick(inner: &ViewInner, reality: &Reality, tick: RealityTick) {
    let frustum = {
        let state = inner.state.lock();
        if !state.enabled || !state.is_current(reality.id()) {
            return;
        }
        reality.frustum().unwrap_or(state.default_frustum)
    };

    let mut frame_state = match frame_state_for(reality.eye(), tick.time, frustum, reality.id()) {
        Ok(Some(frame_state)) => frame_state,
        Ok(None) => {
            tracing::trace!(reality = %reality.id(), "eye pose unavailable, tick skipped");
            return;
        }
        Err(error) => {
            tracing::error!(reality = %reality.id(), %error, "frame state failed");
            return;
        }
    };

    let key = {
        let mut state = inner.state.lock();
        state.frame_number = FrameState::next_frame_number(state.frame_number);
        frame_state.frame_number = state.frame_number;
        state.ready_key(reality.id())
    };
    if let Some(key) = key {
        inner
            .sandbox
            .post(&key, Message::Update(Box::new(frame_state.clone())).to_wire());
    }
    inner.events.update.emit(&frame_state);
}

fn options_message(reality: &Reality) -> WireMessage {
    Message::Options(reality.options().snapshot()).to_wire()
}

fn validate_untrusted(message: WireMessage) -> ProtocolResult<WireMessage> {
    if !(message.event.is_object() || message.event.is_null()) {
        return Err(ProtocolError::Malformed {
            message_type: message.message_type,
            reason: "event must be an object".to_string(),
        });
    }
    Message::from_wire(message.clone())?;
    Ok(message)
}

fn error_text(event: &Value) -> String {
    event
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| event.to_string(), str::to_string)
}

/// Computes the frame state of `eye` at `time`, expressed in the root of
/// the eye's own frame chain. The frame number is left at zero.
///
/// Returns `Ok(None)` when the eye has no pose at `time`.
///
/// # Errors
///
/// Returns [`FrameError::DegeneratePosition`] when the root is FIXED and the
/// eye sits at its exact origin, and [`FrameError::ChainTooDeep`] for a
/// cyclic chain.
pub fn frame_state_for(
    eye: &Arc<Entity>,
    time: Timestamp,
    frustum: Frustum,
    reality: &RealityId,
) -> RealityResult<Option<FrameState>> {
    let Some(native) = frames::native_frame(eye) else {
        return Ok(None);
    };
    let root = frames::root_frame(&native)?;
    let Some(cartesian) = frames::position_in_frame(eye, time, &root) else {
        return Ok(None);
    };
    let Some(unit_quaternion) = frames::orientation_in_frame(eye, time, &root)? else {
        return Ok(None);
    };

    let (reference_frame, cartographic_degrees, unit_quaternion_relative) = match &root {
        ReferenceFrame::Fixed => {
            let degenerate = || RealityError::Frame(FrameError::DegeneratePosition(eye.id().clone()));
            if cartesian.is_exact_zero() {
                return Err(degenerate());
            }
            let enu = Ellipsoid::WGS84
                .east_north_up_quaternion(cartesian)
                .ok_or_else(degenerate)?;
            (
                FrameRef::Fixed,
                Ellipsoid::WGS84
                    .cartesian_to_cartographic(cartesian)
                    .map(|c| c.to_degrees_array()),
                enu.conjugate() * unit_quaternion,
            )
        }
        ReferenceFrame::Entity(root) => (FrameRef::Entity { id: root.id().clone() }, None, unit_quaternion),
    };

    Ok(Some(FrameState {
        frame_number: 0,
        time,
        reference_frame,
        position: FramePosition {
            cartesian,
            cartographic_degrees,
        },
        orientation: FrameOrientation {
            unit_quaternion,
            unit_quaternion_relative,
        },
        frustum,
        reality: RealityRef { id: reality.clone() },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reality::{RealityKind, RealityRegistry};
    use periscope_core::{Cartesian3, Cartographic, EntityCollection, Quaternion};
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingSandbox {
        documents: Mutex<Vec<SandboxDocument>>,
        posted: Mutex<Vec<(SandboxKey, WireMessage)>>,
        fail: Mutex<Option<String>>,
        detached: Mutex<usize>,
    }

    impl RecordingSandbox {
        fn last_key(&self) -> SandboxKey {
            self.documents.lock().last().unwrap().key.clone()
        }
        fn posted_types(&self) -> Vec<String> {
            self.posted.lock().iter().map(|(_, m)| m.message_type.clone()).collect()
        }
    }

    impl Sandbox for RecordingSandbox {
        fn materialize(&self, document: SandboxDocument) -> Result<(), ResourceError> {
            if let Some(reason) = self.fail.lock().clone() {
                return Err(ResourceError::new(reason));
            }
            self.documents.lock().push(document);
            Ok(())
        }
        fn post(&self, key: &SandboxKey, message: WireMessage) {
            self.posted.lock().push((key.clone(), message));
        }
        fn detach(&self) {
            *self.detached.lock() += 1;
        }
    }

    /// Serves from a map; URLs listed in `gate` wait until the gate opens.
    #[derive(Default)]
    struct MapLoader {
        files: HashMap<String, String>,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    #[async_trait]
    impl ResourceLoader for MapLoader {
        async fn load(&self, url: &str) -> Result<String, ResourceError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.files
                .get(url)
                .cloned()
                .ok_or_else(|| ResourceError::new("404"))
        }
    }

    fn wire(message_type: &str, event: Value) -> WireMessage {
        WireMessage {
            message_type: message_type.into(),
            event,
        }
    }

    fn setup(loader: MapLoader) -> (RealityView, Arc<RecordingSandbox>, RealityRegistry) {
        let sandbox = Arc::new(RecordingSandbox::default());
        let view = RealityView::new(sandbox.clone(), Arc::new(loader), periscope_shared::DEFAULT_FOV);
        (view, sandbox, RealityRegistry::new(EntityCollection::new()))
    }

    /// Polls `commit` in the background and plays the sandbox handshake.
    async fn handshake(view: &RealityView, sandbox: &RecordingSandbox, commit: Commit) -> CommitResult<CommitOutcome> {
        let before = sandbox.documents.lock().len();
        let task = tokio::spawn(commit);
        while sandbox.documents.lock().len() == before {
            tokio::task::yield_now().await;
        }
        let key = sandbox.last_key();
        view.receive(&key, wire(messages::CONNECT, Value::Null));
        view.receive(&key, wire(messages::READY, Value::Null));
        task.await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_handshake_then_options() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let reality = registry.color("red");

        let outcome = handshake(&view, &sandbox, view.set_reality(Some(reality.clone()))).await;
        assert_eq!(outcome, Ok(CommitOutcome::Ready));
        assert!(view.is_ready());
        assert!(reality.is_enabled());
        assert_eq!(sandbox.posted_types(), vec!["startRenderScript", "options"]);
        let (_, options) = sandbox.posted.lock().last().cloned().unwrap();
        assert_eq!(options.event["color"], json!("red"));
    }

    #[tokio::test]
    async fn test_ticks_post_updates_once_ready() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let reality = registry.create(RealityKind::Generic);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let u = Arc::clone(&updates);
        view.events().update.on(move |state| u.lock().push(state.frame_number));

        let commit = view.set_reality(Some(reality.clone()));
        reality.tick(Timestamp::from_seconds(1.0));
        assert!(!sandbox.posted_types().contains(&"update".to_string()));

        handshake(&view, &sandbox, commit).await.unwrap();
        reality.tick(Timestamp::from_seconds(2.0));
        assert_eq!(sandbox.posted_types().last().map(String::as_str), Some("update"));
        assert_eq!(*updates.lock(), vec![1, 2]);

        let (_, update) = sandbox.posted.lock().last().cloned().unwrap();
        assert_eq!(update.event["reality"]["id"], json!(reality.id().as_str()));
        assert_eq!(update.event["referenceFrame"]["entity"]["id"], json!("DEVICE"));
    }

    #[tokio::test]
    async fn test_cancelled_commit_delivers_nothing() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut files = HashMap::new();
        files.insert("https://r.example/a.js".to_string(), "a()".to_string());
        let (view, sandbox, registry) = setup(MapLoader {
            files,
            gate: Some(gate.clone()),
        });
        let first = registry.from_configuration(&periscope_shared::RealityConfiguration {
            id: RealityId::new("slow"),
            js_deps: vec!["https://r.example/a.js".into()],
            ..Default::default()
        });

        let commit = view.set_reality(Some(first.clone()));
        let token = commit.token().clone();
        let task = tokio::spawn(commit);
        tokio::task::yield_now().await;

        view.disable();
        assert!(token.is_cancelled());
        gate.notify_waiters();
        assert_eq!(task.await.unwrap(), Ok(CommitOutcome::Cancelled));

        first.tick(Timestamp::EPOCH);
        first.options().set("anything", json!(1));
        assert!(sandbox.documents.lock().is_empty());
        assert!(sandbox.posted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_newer_reality_supersedes_commit() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let a = registry.create(RealityKind::Color);
        let b = registry.create(RealityKind::Color);

        let first = tokio::spawn(view.set_reality(Some(a.clone())));
        while sandbox.documents.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let stale = sandbox.last_key();

        let second = view.set_reality(Some(b.clone()));
        assert!(!a.is_enabled());
        assert_eq!(first.await.unwrap(), Ok(CommitOutcome::Cancelled));

        // The old document's acknowledgement is ignored.
        view.receive(&stale, wire(messages::READY, Value::Null));
        assert!(!view.is_ready());

        assert_eq!(handshake(&view, &sandbox, second).await, Ok(CommitOutcome::Ready));
        assert_eq!(view.reality().unwrap().id(), b.id());
    }

    #[tokio::test]
    async fn test_resource_failure_rejects() {
        let (view, _sandbox, registry) = setup(MapLoader::default());
        let reality = registry.create(RealityKind::Panorama);
        let result = view.set_reality(Some(reality)).await;
        assert!(matches!(result, Err(CommitError::ResourceLoadFailure { url, .. }) if url.contains("three")));
    }

    #[tokio::test]
    async fn test_render_error_rejects() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let reality = registry.create(RealityKind::Color);
        let task = tokio::spawn(view.set_reality(Some(reality)));
        while sandbox.documents.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let key = sandbox.last_key();
        view.receive(&key, wire(messages::ERROR, json!({"message": "boom"})));
        assert_eq!(
            task.await.unwrap(),
            Err(CommitError::SandboxFailure("boom".into()))
        );
        assert!(!view.is_ready());
    }

    #[tokio::test]
    async fn test_materialize_failure_rejects() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        *sandbox.fail.lock() = Some("no document".into());
        let reality = registry.create(RealityKind::Generic);
        assert_eq!(
            view.set_reality(Some(reality)).await,
            Err(CommitError::SandboxFailure("no document".into()))
        );
    }

    #[tokio::test]
    async fn test_disabled_view_defers_then_commits_on_enable() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        view.disable();
        let reality = registry.create(RealityKind::Generic);
        assert_eq!(view.set_reality(Some(reality)).await, Ok(CommitOutcome::Deferred));

        let commit = view.enable().expect("enabling starts the commit");
        assert_eq!(handshake(&view, &sandbox, commit).await, Ok(CommitOutcome::Ready));
        assert!(view.enable().is_none());
    }

    #[tokio::test]
    async fn test_detach_and_teardown() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let reality = registry.create(RealityKind::Generic);
        handshake(&view, &sandbox, view.set_reality(Some(reality.clone())))
            .await
            .unwrap();

        registry.destroy(reality.id());
        assert!(view.reality().is_none());
        assert_eq!(*sandbox.detached.lock(), 1);
        assert_eq!(view.set_reality(None).await, Ok(CommitOutcome::Detached));
    }

    #[tokio::test]
    async fn test_sandbox_messages_surface() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let reality = registry.create(RealityKind::Generic);
        handshake(&view, &sandbox, view.set_reality(Some(reality)))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        view.events().message.on(move |m| s.lock().push(m.message_type.clone()));
        view.receive(&sandbox.last_key(), wire("pick", json!({"x": 1})));
        view.receive(&SandboxKey::generate(), wire("pick", Value::Null));
        assert_eq!(*seen.lock(), vec!["pick".to_string()]);
    }

    #[tokio::test]
    async fn test_untrusted_sandbox_messages_are_validated() {
        let (view, sandbox, registry) = setup(MapLoader::default());
        let reality = registry.from_configuration(&periscope_shared::RealityConfiguration {
            id: RealityId::new("remote"),
            kind: Some("Hologram".into()),
            ..Default::default()
        });
        assert!(!reality.is_trusted());
        handshake(&view, &sandbox, view.set_reality(Some(reality)))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        view.events().message.on(move |m| s.lock().push(m.message_type.clone()));
        let key = sandbox.last_key();
        view.receive(&key, wire("pick", json!({"x": 1})));
        view.receive(&key, wire("pick", json!(3)));
        view.receive(&key, wire("requiredCapabilities", json!({"capabilities": 5})));
        view.receive(&key, wire("requiredCapabilities", json!({"capabilities": ["vr"]})));
        assert_eq!(*seen.lock(), vec!["pick".to_string(), "requiredCapabilities".to_string()]);
    }

    #[test]
    fn test_fixed_frame_state_has_relative_orientation() {
        let position = Ellipsoid::WGS84.cartographic_to_cartesian(Cartographic::from_degrees(10.0, 45.0, 100.0));
        let enu = Ellipsoid::WGS84.east_north_up_quaternion(position).unwrap();
        let eye = Entity::named("eye")
            .with_position(position, Some(ReferenceFrame::Fixed))
            .with_orientation(enu)
            .into_shared();

        let state = frame_state_for(&eye, Timestamp::EPOCH, Frustum::default(), &RealityId::new("r"))
            .unwrap()
            .unwrap();
        assert_eq!(state.reference_frame, FrameRef::Fixed);
        let degrees = state.position.cartographic_degrees.unwrap();
        assert!((degrees[0] - 10.0).abs() < 1e-6 && (degrees[1] - 45.0).abs() < 1e-6);
        assert!(state
            .orientation
            .unit_quaternion_relative
            .equals_epsilon(Quaternion::IDENTITY, 1e-9));
    }

    #[test]
    fn test_zero_fixed_position_is_degenerate() {
        let eye = Entity::named("eye")
            .with_position(Cartesian3::ZERO, Some(ReferenceFrame::Fixed))
            .with_orientation(Quaternion::IDENTITY)
            .into_shared();
        let result = frame_state_for(&eye, Timestamp::EPOCH, Frustum::default(), &RealityId::new("r"));
        assert!(matches!(
            result,
            Err(RealityError::Frame(FrameError::DegeneratePosition(_)))
        ));
    }

    #[test]
    fn test_resize_sets_default_aspect() {
        let (view, _sandbox, _registry) = setup(MapLoader::default());
        view.resize(200.0, 100.0);
        assert!((view.default_frustum().aspect_ratio - 2.0).abs() < f64::EPSILON);
        view.resize(0.0, 100.0);
        assert!((view.default_frustum().aspect_ratio - 2.0).abs() < f64::EPSILON);
    }
}
