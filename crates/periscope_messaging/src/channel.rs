//! # Channels
//!
//! Manager-side handles to untrusted content contexts.
//!
//! ```text
//!                       set_url            on_load          announcement
//!   Created ──────> AwaitingNavigation ─────────> (load) ─────────────> Connected
//!                          ^                                              │
//!                          └──────────── on_load / set_url ── Unloaded <──┘
//!                                                                  │ destroy
//!                                                                  v
//!                                                              Destroyed
//! ```
//!
//! ## Focus
//!
//! The manager owns the single focus slot. [`ChannelManager::focus`] is
//! synchronous: the slot changes, every other channel receives `blur`, the
//! focused one receives `focus`, all before it returns.
//!
//! ## Delivery
//!
//! Each connected channel owns one end of a [`MessagePort`] pair. Incoming
//! messages are processed only by [`Channel::pump`] / [`ChannelManager::pump`],
//! in arrival order.

use crate::alert::{AlertSink, TracingAlert};
use crate::capability::CapabilityRegistry;
use crate::error::{MessagingError, MessagingResult};
use crate::port::MessagePort;
use crate::request::{HandlerRegistry, PendingResponse, RequestTable};
use crate::version::VersionTransformer;
use parking_lot::{Mutex, RwLock};
use periscope_core::EventHandler;
use periscope_shared::{
    ChannelAnnouncement, ConnectPayload, Message, ProtocolVersion, VersionCompatibility, UNKNOWN_URL,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Unique channel identifier within a manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// The host-side surface a channel drives, e.g. an embedded web view.
pub trait ContentFrame: Send + Sync {
    /// Navigates to `url`; `None` blanks the frame.
    fn load_url(&self, url: Option<&str>);

    /// Loads an inline document.
    fn load_document(&self, document: &str);

    /// Hands the content its end of the dedicated port together with the
    /// connect payload.
    fn connect(&self, payload: ConnectPayload, port: MessagePort);

    /// Shows or hides the frame.
    fn set_visible(&self, _visible: bool) {}
}

/// Lifecycle state of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Never navigated.
    Created,
    /// Loaded (or loading), waiting for the content's announcement.
    AwaitingNavigation,
    /// Handshake accepted, port open.
    Connected,
    /// Port closed.
    Unloaded,
    /// Removed from its manager.
    Destroyed,
}

/// Events of a single channel.
#[derive(Debug, Default)]
pub struct ChannelEvents {
    /// Handshake accepted.
    pub connect: EventHandler<()>,
    /// The frame finished loading.
    pub load: EventHandler<()>,
    /// The connection was torn down.
    pub unload: EventHandler<()>,
    /// Focus gained.
    pub focus: EventHandler<()>,
    /// Focus lost.
    pub blur: EventHandler<()>,
    /// URL changed; `None` is blank.
    pub navigation: EventHandler<Option<String>>,
    /// Every message from the content that is not protocol plumbing.
    pub message: EventHandler<Message>,
}

#[derive(Debug)]
struct ChannelState {
    url: Option<String>,
    requested_url: Option<String>,
    history: Vec<String>,
    port: Option<MessagePort>,
    version: Option<ProtocolVersion>,
    waiting_for_load: bool,
    status: ChannelStatus,
}

/// Manager-side handle to one content context.
pub struct Channel {
    id: ChannelId,
    manager_version: ProtocolVersion,
    transformer: VersionTransformer,
    manager: Weak<ManagerShared>,
    frame: Arc<dyn ContentFrame>,
    state: Mutex<ChannelState>,
    requests: RequestTable,
    events: ChannelEvents,
}

impl Channel {
    /// Channel id.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Channel events.
    #[must_use]
    pub fn events(&self) -> &ChannelEvents {
        &self.events
    }

    /// Current URL. [`UNKNOWN_URL`] after a navigation the manager did not start.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.state.lock().url.clone()
    }

    /// URLs this channel was navigated to, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    /// Protocol version negotiated with the connected content.
    #[must_use]
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.state.lock().version
    }

    /// Lifecycle state.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.state.lock().status
    }

    /// True while the handshake is accepted and the port open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    /// True if this channel holds the manager's focus.
    #[must_use]
    pub fn has_focus(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|shared| *shared.focused.borrow() == Some(self.id))
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Navigates the frame. `None` blanks it.
    pub fn set_url(&self, url: Option<&str>) {
        let url = url.map(str::to_string);
        {
            let mut state = self.state.lock();
            if let Some(u) = url.as_deref().filter(|u| *u != UNKNOWN_URL) {
                state.history.push(u.to_string());
            }
            state.requested_url.clone_from(&url);
            state.waiting_for_load = true;
            if state.status == ChannelStatus::Created {
                state.status = ChannelStatus::AwaitingNavigation;
            }
        }
        tracing::debug!(channel = %self.id, url = url.as_deref().unwrap_or("<blank>"), "navigating");
        self.events.navigation.emit(&url);
        self.frame.load_url(url.as_deref());
    }

    /// Loads an inline document into the frame.
    pub fn set_src_doc(&self, document: &str) {
        {
            let mut state = self.state.lock();
            state.requested_url = None;
            state.waiting_for_load = true;
            if state.status == ChannelStatus::Created {
                state.status = ChannelStatus::AwaitingNavigation;
            }
        }
        self.frame.load_document(document);
    }

    /// Called by the host when the frame finished a load.
    ///
    /// A load the manager did not ask for records [`UNKNOWN_URL`].
    pub fn on_load(&self) {
        self.unload();
        let (url, expected) = {
            let mut state = self.state.lock();
            let expected = state.waiting_for_load;
            let url = if expected {
                state.requested_url.clone()
            } else {
                Some(UNKNOWN_URL.to_string())
            };
            state.url.clone_from(&url);
            state.waiting_for_load = false;
            if state.status != ChannelStatus::Destroyed {
                state.status = ChannelStatus::AwaitingNavigation;
            }
            (url, expected)
        };
        if !expected {
            tracing::debug!(channel = %self.id, "content navigated on its own");
            self.events.navigation.emit(&url);
        }
        self.events.load.emit(&());
        if let Some(shared) = self.manager.upgrade() {
            shared.events.load.emit(&self.id);
        }
    }

    /// Validates the content's announcement and, if accepted, opens the
    /// dedicated port and sends the connect payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ProtocolVersionMismatch`] when the content
    /// is newer than the manager. The content is alerted about, unloaded
    /// and blanked. Older content connects after an alert.
    pub fn handle_announcement(&self, announcement: ChannelAnnouncement) -> MessagingResult<()> {
        let content = announcement.version;
        let manager = self.manager_version;
        match manager.compatibility_of(&content) {
            VersionCompatibility::Newer => {
                tracing::warn!(channel = %self.id, %content, %manager, "refusing content with a newer protocol");
                if let Some(shared) = self.manager.upgrade() {
                    shared.alert.alert(&format!(
                        "This content needs protocol {content}, but this host only speaks {manager}. \
                         Please upgrade the host."
                    ));
                }
                self.unload();
                self.set_url(None);
                return Err(MessagingError::ProtocolVersionMismatch { content, manager });
            }
            VersionCompatibility::Older => {
                tracing::warn!(channel = %self.id, %content, %manager, "content speaks an older protocol, translating");
                if let Some(shared) = self.manager.upgrade() {
                    shared.alert.alert(&format!(
                        "This content was built for protocol {content}; this host speaks {manager}. \
                         It will run in compatibility mode. Please update the content."
                    ));
                }
            }
            VersionCompatibility::Same => {}
        }

        let shared = self.manager.upgrade().ok_or(MessagingError::Disconnected)?;
        if self.is_connected() {
            self.unload();
        }

        let (local, remote) = MessagePort::pair();
        let payload = ConnectPayload {
            capabilities: shared.capabilities.ready_capabilities(),
            focus: *shared.focused.borrow() == Some(self.id),
            version: manager,
        };
        {
            let mut state = self.state.lock();
            state.url = Some(announcement.url);
            state.port = Some(local);
            state.version = Some(content);
            state.status = ChannelStatus::Connected;
        }
        self.frame.connect(payload, remote);

        tracing::info!(channel = %self.id, %content, "channel connected");
        self.events.connect.emit(&());
        shared.events.connection.emit(&self.id);
        Ok(())
    }

    /// Sends a message to the connected content.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::PortClosed`] when not connected.
    pub fn send(&self, message: &Message) -> MessagingResult<()> {
        let state = self.state.lock();
        let (Some(port), Some(version)) = (state.port.as_ref(), state.version) else {
            return Err(MessagingError::PortClosed);
        };
        port.post(self.transformer.to_channel(version, message.to_wire()))
    }

    fn send_quiet(&self, message: &Message) {
        if let Err(error) = self.send(message) {
            tracing::trace!(channel = %self.id, kind = message.message_type(), %error, "message not delivered");
        }
    }

    /// Sends a request to the content.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::PortClosed`] when not connected.
    pub fn request(&self, request_type: &str, payload: Value) -> MessagingResult<PendingResponse> {
        let (request, pending) = self.requests.open(request_type, payload);
        let id = request.id.clone();
        if let Err(error) = self.send(&Message::Request(request)) {
            self.requests.settle_with(&id, Err(error.clone()));
            return Err(error);
        }
        Ok(pending)
    }

    /// Processes every message waiting on the port. Returns how many were handled.
    pub fn pump(&self) -> usize {
        let (incoming, version) = {
            let state = self.state.lock();
            match (&state.port, state.version) {
                (Some(port), Some(version)) => (port.drain(), version),
                _ => return 0,
            }
        };

        let mut handled = 0;
        for wire in incoming {
            let wire = self.transformer.from_channel(version, wire);
            let message = match Message::from_wire(wire) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(channel = %self.id, %error, "dropping malformed message");
                    continue;
                }
            };
            let batch = message.unpack(&mut |error| {
                tracing::warn!(channel = %self.id, %error, "dropping malformed queued message");
            });
            for message in batch {
                handled += 1;
                if !self.handle(message) {
                    return handled;
                }
            }
        }
        handled
    }

    // Returns false once the channel unloaded.
    fn handle(&self, message: Message) -> bool {
        match message {
            Message::Request(request) => {
                let Some(shared) = self.manager.upgrade() else {
                    return true;
                };
                let response = shared.handlers.dispatch(&self.id, request);
                self.send_quiet(&Message::Response(response));
            }
            Message::Response(response) => {
                self.requests.settle(response);
            }
            Message::Unload => {
                self.unload();
                return false;
            }
            other => {
                self.events.message.emit(&other);
                if let Some(shared) = self.manager.upgrade() {
                    shared.events.message.emit(&ChannelMessage {
                        channel: self.id,
                        message: other,
                    });
                }
            }
        }
        true
    }

    /// Tears down the connection: closes the port, rejects in-flight
    /// requests and resets URL and version.
    pub fn unload(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            if let Some(port) = state.port.take() {
                port.close();
            }
            state.version = None;
            state.url = None;
            let was_connected = state.status == ChannelStatus::Connected;
            if was_connected {
                state.status = ChannelStatus::Unloaded;
            }
            was_connected
        };
        let rejected = self.requests.reject_all(&MessagingError::ChannelUnloaded);
        if !was_connected {
            return;
        }
        tracing::info!(channel = %self.id, rejected, "channel unloaded");
        self.events.unload.emit(&());
        if let Some(shared) = self.manager.upgrade() {
            shared.events.unload.emit(&self.id);
        }
    }

    /// Gives this channel the manager's focus.
    pub fn focus(&self) {
        if let Some(shared) = self.manager.upgrade() {
            shared.focus(self.id);
        }
    }

    /// Resolves once this channel has focus.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Disconnected`] if the manager is dropped first.
    pub async fn when_focused(&self) -> MessagingResult<()> {
        let mut rx = self
            .manager
            .upgrade()
            .ok_or(MessagingError::Disconnected)?
            .focused
            .subscribe();
        let id = self.id;
        rx.wait_for(|focused| *focused == Some(id))
            .await
            .map(|_| ())
            .map_err(|_| MessagingError::Disconnected)
    }

    /// Unloads the channel and removes it from its manager.
    pub fn destroy(&self) {
        self.unload();
        self.state.lock().status = ChannelStatus::Destroyed;
        if let Some(shared) = self.manager.upgrade() {
            shared.remove(self.id);
        }
        self.frame.load_url(None);
        tracing::debug!(channel = %self.id, "channel destroyed");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("url", &state.url)
            .field("status", &state.status)
            .field("version", &state.version)
            .finish_non_exhaustive()
    }
}

/// A message received on a channel, tagged with its source.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMessage {
    /// Source channel.
    pub channel: ChannelId,
    /// The message.
    pub message: Message,
}

/// Manager-wide events, keyed by channel.
#[derive(Debug, Default)]
pub struct ManagerEvents {
    /// A channel completed its handshake.
    pub connection: EventHandler<ChannelId>,
    /// A channel's frame finished loading.
    pub load: EventHandler<ChannelId>,
    /// A channel gained focus.
    pub focus: EventHandler<ChannelId>,
    /// A channel unloaded.
    pub unload: EventHandler<ChannelId>,
    /// Any non-plumbing message from any channel.
    pub message: EventHandler<ChannelMessage>,
}

struct ManagerShared {
    version: ProtocolVersion,
    transformer: VersionTransformer,
    channels: RwLock<BTreeMap<ChannelId, Arc<Channel>>>,
    focused: watch::Sender<Option<ChannelId>>,
    handlers: HandlerRegistry<ChannelId>,
    capabilities: Arc<CapabilityRegistry>,
    alert: Arc<dyn AlertSink>,
    events: ManagerEvents,
    next_id: AtomicU64,
}

impl ManagerShared {
    fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    fn focus(&self, id: ChannelId) -> bool {
        let Some(target) = self.channels.read().get(&id).cloned() else {
            tracing::warn!(channel = %id, "focus requested for unknown channel");
            return false;
        };
        let previous = self.focused.send_replace(Some(id));
        if previous == Some(id) {
            return true;
        }
        for channel in self.snapshot() {
            if channel.id == id {
                continue;
            }
            channel.send_quiet(&Message::Blur);
            if previous == Some(channel.id) {
                channel.events.blur.emit(&());
            }
        }
        target.send_quiet(&Message::Focus);
        tracing::debug!(channel = %id, "focus changed");
        target.events.focus.emit(&());
        self.events.focus.emit(&id);
        true
    }

    fn remove(&self, id: ChannelId) {
        self.channels.write().remove(&id);
        self.focused.send_if_modified(|focused| {
            if *focused == Some(id) {
                *focused = None;
                true
            } else {
                false
            }
        });
    }
}

/// Registry of channels plus the state they share: focus, request
/// handlers, capabilities.
#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<ManagerShared>,
}

impl ChannelManager {
    /// Creates a manager speaking `version`, alerting through `tracing`.
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        Self::with_hooks(version, Arc::new(TracingAlert), Arc::new(CapabilityRegistry::new()))
    }

    /// Creates a manager with explicit alert and capability hooks.
    #[must_use]
    pub fn with_hooks(
        version: ProtocolVersion,
        alert: Arc<dyn AlertSink>,
        capabilities: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                version,
                transformer: VersionTransformer::new(),
                channels: RwLock::new(BTreeMap::new()),
                focused: watch::channel(None).0,
                handlers: HandlerRegistry::new(),
                capabilities,
                alert,
                events: ManagerEvents::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Protocol version of this manager.
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.shared.version
    }

    /// Creates a channel driving `frame`.
    pub fn create_channel(&self, frame: Arc<dyn ContentFrame>) -> Arc<Channel> {
        let id = ChannelId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let channel = Arc::new(Channel {
            id,
            manager_version: self.shared.version,
            transformer: self.shared.transformer,
            manager: Arc::downgrade(&self.shared),
            frame,
            state: Mutex::new(ChannelState {
                url: None,
                requested_url: None,
                history: Vec::new(),
                port: None,
                version: None,
                waiting_for_load: false,
                status: ChannelStatus::Created,
            }),
            requests: RequestTable::new(),
            events: ChannelEvents::default(),
        });
        self.shared.channels.write().insert(id, Arc::clone(&channel));
        tracing::debug!(channel = %id, "channel created");
        channel
    }

    /// Looks up a channel.
    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.shared.channels.read().get(&id).cloned()
    }

    /// Every channel, in creation order.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.shared.snapshot()
    }

    /// The focused channel's id.
    #[must_use]
    pub fn focused(&self) -> Option<ChannelId> {
        *self.shared.focused.borrow()
    }

    /// The focused channel.
    #[must_use]
    pub fn focused_channel(&self) -> Option<Arc<Channel>> {
        self.focused().and_then(|id| self.channel(id))
    }

    /// Moves focus to `id`. Returns false for unknown channels.
    pub fn focus(&self, id: ChannelId) -> bool {
        self.shared.focus(id)
    }

    /// Request handlers shared by every channel.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry<ChannelId> {
        &self.shared.handlers
    }

    /// Capabilities advertised in connect payloads.
    #[must_use]
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.shared.capabilities
    }

    /// Manager-wide events.
    #[must_use]
    pub fn events(&self) -> &ManagerEvents {
        &self.shared.events
    }

    /// Sends `message` to every connected channel.
    pub fn broadcast(&self, message: &Message) {
        for channel in self.shared.snapshot() {
            channel.send_quiet(message);
        }
    }

    /// Pumps every channel. Returns the total number of messages handled.
    pub fn pump(&self) -> usize {
        self.shared.snapshot().iter().map(|channel| channel.pump()).sum()
    }

    /// Shows the focused channel, hides the rest. Returns the hidden ids.
    pub fn hide_blurred(&self) -> Vec<ChannelId> {
        let focused = self.focused();
        let mut hidden = Vec::new();
        for channel in self.shared.snapshot() {
            let visible = focused == Some(channel.id);
            channel.frame.set_visible(visible);
            if !visible {
                hidden.push(channel.id);
            }
        }
        hidden
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("version", &self.shared.version)
            .field("channels", &self.shared.channels.read().len())
            .field("focused", &self.focused())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_shared::WireMessage;
    use serde_json::json;

    #[derive(Default)]
    struct FakeFrame {
        loads: Mutex<Vec<Option<String>>>,
        connected: Mutex<Option<(ConnectPayload, MessagePort)>>,
        visible: Mutex<Option<bool>>,
    }

    impl ContentFrame for FakeFrame {
        fn load_url(&self, url: Option<&str>) {
            self.loads.lock().push(url.map(str::to_string));
        }
        fn load_document(&self, _document: &str) {}
        fn connect(&self, payload: ConnectPayload, port: MessagePort) {
            *self.connected.lock() = Some((payload, port));
        }
        fn set_visible(&self, visible: bool) {
            *self.visible.lock() = Some(visible);
        }
    }

    impl FakeFrame {
        fn content_port(&self) -> MessagePort {
            self.connected.lock().take().unwrap().1
        }
    }

    #[derive(Default)]
    struct RecordingAlert(Mutex<Vec<String>>);

    impl AlertSink for RecordingAlert {
        fn alert(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    fn announce(version: &str) -> ChannelAnnouncement {
        ChannelAnnouncement {
            url: "https://content.example/app".into(),
            version: version.parse().unwrap(),
        }
    }

    fn connected(manager: &ChannelManager) -> (Arc<Channel>, Arc<FakeFrame>, MessagePort) {
        let frame = Arc::new(FakeFrame::default());
        let channel = manager.create_channel(frame.clone());
        channel.set_url(Some("https://content.example/app"));
        channel.on_load();
        channel.handle_announcement(announce("1.2.0")).unwrap();
        let port = frame.content_port();
        (channel, frame, port)
    }

    fn types_of(port: &MessagePort) -> Vec<String> {
        port.drain().into_iter().map(|m| m.message_type).collect()
    }

    #[test]
    fn test_newer_content_is_refused() {
        let alert = Arc::new(RecordingAlert::default());
        let manager = ChannelManager::with_hooks(
            ProtocolVersion::new(1, 2, 0),
            alert.clone(),
            Arc::new(CapabilityRegistry::new()),
        );
        let frame = Arc::new(FakeFrame::default());
        let channel = manager.create_channel(frame.clone());
        channel.set_url(Some("https://content.example/"));
        channel.on_load();

        let result = channel.handle_announcement(announce("1.3.0"));
        assert!(matches!(result, Err(MessagingError::ProtocolVersionMismatch { .. })));
        assert_eq!(alert.0.lock().len(), 1);
        assert!(!channel.is_connected());
        assert_eq!(frame.loads.lock().last(), Some(&None));
    }

    #[test]
    fn test_older_and_same_content_connect() {
        let alert = Arc::new(RecordingAlert::default());
        let manager = ChannelManager::with_hooks(
            ProtocolVersion::new(1, 2, 0),
            alert.clone(),
            Arc::new(CapabilityRegistry::new()),
        );
        for (version, alerts) in [("1.2.0", 0), ("1.1.0", 1)] {
            let frame = Arc::new(FakeFrame::default());
            let channel = manager.create_channel(frame.clone());
            channel.handle_announcement(announce(version)).unwrap();
            assert!(channel.is_connected());
            assert_eq!(channel.version(), Some(version.parse().unwrap()));
            assert_eq!(alert.0.lock().len(), alerts);
        }
        assert!(alert.0.lock()[0].contains("update the content"));
    }

    #[test]
    fn test_connect_payload_carries_capabilities_and_focus() {
        let manager = ChannelManager::new(ProtocolVersion::new(1, 2, 0));
        manager.capabilities().set_ready("geolocation");
        let frame = Arc::new(FakeFrame::default());
        let channel = manager.create_channel(frame.clone());
        channel.focus();
        channel.handle_announcement(announce("1.2.0")).unwrap();

        let (payload, _) = frame.connected.lock().take().unwrap();
        assert_eq!(payload.capabilities, vec!["geolocation".to_string()]);
        assert!(payload.focus);
    }

    #[test]
    fn test_focus_is_exclusive_and_idempotent() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        let (a, _fa, port_a) = connected(&manager);
        let (b, _fb, port_b) = connected(&manager);

        a.focus();
        assert_eq!(types_of(&port_a), vec!["focus"]);
        assert_eq!(types_of(&port_b), vec!["blur"]);

        a.focus();
        assert!(port_a.drain().is_empty());

        b.focus();
        assert!(b.has_focus() && !a.has_focus());
        assert_eq!(types_of(&port_a), vec!["blur"]);
        assert_eq!(types_of(&port_b), vec!["focus"]);
        assert_eq!(manager.focused(), Some(b.id()));
    }

    #[test]
    fn test_unexpected_load_records_unknown_url() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        let (channel, _frame, _port) = connected(&manager);

        let unloads = Arc::new(Mutex::new(0));
        let u = Arc::clone(&unloads);
        channel.events().unload.on(move |()| *u.lock() += 1);

        channel.on_load();
        assert_eq!(channel.url().as_deref(), Some(UNKNOWN_URL));
        assert_eq!(*unloads.lock(), 1);
        assert_eq!(channel.history(), vec!["https://content.example/app".to_string()]);
    }

    #[tokio::test]
    async fn test_request_round_trip_and_unload_rejects() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        let (channel, _frame, port) = connected(&manager);

        let pending = channel.request("ping", json!({"n": 1})).unwrap();
        let sent = port.drain().pop().unwrap();
        let request: periscope_shared::Request = serde_json::from_value(sent.event).unwrap();
        port.post(
            Message::Response(periscope_shared::Response::resolve(request.id, json!("pong"))).to_wire(),
        )
        .unwrap();
        channel.pump();
        assert_eq!(pending.await, Ok(json!("pong")));

        let hanging = channel.request("slow", Value::Null).unwrap();
        port.post(Message::Unload.to_wire()).unwrap();
        channel.pump();
        assert_eq!(hanging.await, Err(MessagingError::ChannelUnloaded));
        assert_eq!(channel.status(), ChannelStatus::Unloaded);
    }

    #[test]
    fn test_incoming_request_dispatches_to_handler() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        manager.handlers().register("echo", |_, payload| Ok(payload));
        let (channel, _frame, port) = connected(&manager);

        let request = periscope_shared::Request {
            id: periscope_shared::RequestId::new("r1"),
            request_type: "echo".into(),
            payload: json!({"x": 1}),
        };
        port.post(Message::Request(request).to_wire()).unwrap();
        assert_eq!(channel.pump(), 1);

        let reply = port.drain().pop().unwrap();
        assert_eq!(reply.message_type, "RESPONSE");
        assert_eq!(reply.event, json!({"id": "r1", "resolve": {"x": 1}}));
    }

    #[test]
    fn test_legacy_messages_are_translated_both_ways() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        let frame = Arc::new(FakeFrame::default());
        let channel = manager.create_channel(frame.clone());
        channel.handle_announcement(announce("1.0.0")).unwrap();
        let port = frame.content_port();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        manager.events().message.on(move |m| s.lock().push(m.message.message_type().to_string()));

        port.post(WireMessage::new("immersiveContext.requiredCapabilities", json!({"capabilities": []})))
            .unwrap();
        manager.pump();
        assert_eq!(*seen.lock(), vec!["requiredCapabilities".to_string()]);

        channel.send(&Message::Options(serde_json::Map::new())).unwrap();
        assert_eq!(types_of(&port), vec!["immersiveContext.options"]);
    }

    #[test]
    fn test_destroy_clears_focus_and_hide_blurred() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        let (a, fa, _pa) = connected(&manager);
        let (b, fb, _pb) = connected(&manager);
        b.focus();

        assert_eq!(manager.hide_blurred(), vec![a.id()]);
        assert_eq!(*fa.visible.lock(), Some(false));
        assert_eq!(*fb.visible.lock(), Some(true));

        b.destroy();
        assert_eq!(manager.focused(), None);
        assert_eq!(manager.channels().len(), 1);
        assert_eq!(b.status(), ChannelStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_when_focused() {
        let manager = ChannelManager::new(ProtocolVersion::default());
        let (a, _f, _p) = connected(&manager);
        a.focus();
        assert_eq!(a.when_focused().await, Ok(()));
    }
}
