//! # Manager Port
//!
//! The content side of a channel.
//!
//! ```text
//!   send(msg) ──> EventPort.input ──> connected? ── yes ──> MessagePort
//!                                          └─ no ──> queue (flushed on connect)
//!
//!   MessagePort ──pump──> RESPONSE ──> RequestTable
//!                         REQUEST  ──> HandlerRegistry ──> reply
//!                         other    ──> EventPort.output / messages
//! ```
//!
//! Content that is never connected runs standalone: [`ManagerPort::when_connected`]
//! gives up after a bounded wait and reports [`Connection::Standalone`].

use crate::capability::CapabilityRegistry;
use crate::error::MessagingError;
use crate::event_port::EventPort;
use crate::port::MessagePort;
use crate::request::{HandlerRegistry, PendingResponse, RequestTable};
use parking_lot::Mutex;
use periscope_core::{EventHandler, ListenerId};
use periscope_shared::{ChannelAnnouncement, ConnectPayload, Message, ProtocolVersion, WireMessage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of waiting for the manager.
#[derive(Clone, Debug, PartialEq)]
pub enum Connection {
    /// A manager accepted this content.
    Managed(ConnectPayload),
    /// No manager answered in time.
    Standalone,
}

struct Inner {
    version: ProtocolVersion,
    port: Mutex<Option<MessagePort>>,
    queue: Mutex<Vec<WireMessage>>,
    connection: watch::Sender<Option<ConnectPayload>>,
    requests: RequestTable,
    handlers: HandlerRegistry<()>,
    capabilities: CapabilityRegistry,
    events: EventPort,
    messages: EventHandler<Message>,
}

impl Inner {
    fn transmit(&self, message: WireMessage) {
        let port = self.port.lock();
        match port.as_ref() {
            Some(port) => {
                if let Err(error) = port.post(message) {
                    tracing::debug!(%error, "message to manager dropped");
                }
            }
            None => self.queue.lock().push(message),
        }
    }
}

/// Content-side endpoint of the manager protocol.
#[derive(Clone)]
pub struct ManagerPort {
    inner: Arc<Inner>,
}

impl ManagerPort {
    /// Creates an unconnected port speaking `version`.
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        let inner = Arc::new(Inner {
            version,
            port: Mutex::new(None),
            queue: Mutex::new(Vec::new()),
            connection: watch::channel(None).0,
            requests: RequestTable::new(),
            handlers: HandlerRegistry::new(),
            capabilities: CapabilityRegistry::new(),
            events: EventPort::new(),
            messages: EventHandler::new(),
        });
        let weak = Arc::downgrade(&inner);
        inner.events.pipe_input(move |wire| {
            if let Some(inner) = weak.upgrade() {
                inner.transmit(wire.clone());
            }
        });
        Self { inner }
    }

    /// The announcement this content makes after each load.
    #[must_use]
    pub fn announcement(&self, url: &str) -> ChannelAnnouncement {
        ChannelAnnouncement {
            url: url.to_string(),
            version: self.inner.version,
        }
    }

    /// Accepts the manager's connect message and flushes queued messages.
    pub fn connect(&self, payload: ConnectPayload, port: MessagePort) {
        for capability in &payload.capabilities {
            self.inner.capabilities.set_ready(capability);
        }
        {
            let mut slot = self.inner.port.lock();
            let queued = std::mem::take(&mut *self.inner.queue.lock());
            let flushed = queued.len();
            for message in queued {
                if let Err(error) = port.post(message) {
                    tracing::warn!(%error, "queued message lost while connecting");
                }
            }
            *slot = Some(port);
            tracing::info!(manager = %payload.version, flushed, "connected to manager");
        }
        self.inner.connection.send_replace(Some(payload));
    }

    /// True once connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.borrow().is_some()
    }

    /// The manager's connect payload, if connected.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectPayload> {
        self.inner.connection.borrow().clone()
    }

    /// Waits for the manager at most `limit`.
    pub async fn when_connected(&self, limit: Duration) -> Connection {
        let mut rx = self.inner.connection.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(payload)) => payload.clone().map_or(Connection::Standalone, Connection::Managed),
            Ok(Err(_)) | Err(_) => {
                tracing::info!(waited = ?limit, "no manager, running standalone");
                Connection::Standalone
            }
        }
    }

    /// Sends a message; queued until connected.
    pub fn send(&self, message: &Message) {
        self.inner.events.trigger(message);
    }

    /// Sends a request to the manager.
    pub fn request(&self, request_type: &str, payload: Value) -> PendingResponse {
        let (request, pending) = self.inner.requests.open(request_type, payload);
        self.send(&Message::Request(request));
        pending
    }

    /// Handlers for requests the manager sends to this content.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry<()> {
        &self.inner.handlers
    }

    /// Capabilities the manager advertised.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.inner.capabilities
    }

    /// Listens for incoming messages of one wire type.
    pub fn on(&self, message_type: &str, listener: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on(message_type, listener)
    }

    /// Every incoming non-plumbing message, typed.
    #[must_use]
    pub fn messages(&self) -> &EventHandler<Message> {
        &self.inner.messages
    }

    /// Processes every message from the manager. Returns how many were handled.
    pub fn pump(&self) -> usize {
        let incoming = match self.inner.port.lock().as_ref() {
            Some(port) => port.drain(),
            None => return 0,
        };
        let mut handled = 0;
        for wire in incoming {
            let message = match Message::from_wire(wire) {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(%error, "dropping malformed message from manager");
                    continue;
                }
            };
            for message in message.unpack(&mut |error| tracing::warn!(%error, "dropping malformed queued message")) {
                handled += 1;
                self.handle(message);
            }
        }
        handled
    }

    fn handle(&self, message: Message) {
        match message {
            Message::Response(response) => {
                self.inner.requests.settle(response);
            }
            Message::Request(request) => {
                let response = self.inner.handlers.dispatch(&(), request);
                self.send(&Message::Response(response));
            }
            other => {
                self.inner.events.deliver(&other.to_wire());
                self.inner.messages.emit(&other);
            }
        }
    }

    /// Tells the manager this content is going away, then drops the port.
    pub fn unload(&self) {
        self.send(&Message::Unload);
        self.release(false);
    }

    /// Closes the connection without notifying the manager.
    pub fn disconnect(&self) {
        self.release(true);
    }

    fn release(&self, close: bool) {
        if let Some(port) = self.inner.port.lock().take() {
            if close {
                port.close();
            }
        }
        self.inner.connection.send_replace(None);
        let rejected = self.inner.requests.reject_all(&MessagingError::Disconnected);
        tracing::debug!(rejected, "manager port released");
    }
}

impl std::fmt::Debug for ManagerPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerPort")
            .field("version", &self.inner.version)
            .field("connected", &self.is_connected())
            .field("queued", &self.inner.queue.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_shared::{Response, ResponseOutcome};
    use serde_json::json;

    fn payload() -> ConnectPayload {
        ConnectPayload {
            capabilities: vec!["geolocation".into()],
            focus: false,
            version: ProtocolVersion::default(),
        }
    }

    #[test]
    fn test_queued_messages_flush_in_order() {
        let content = ManagerPort::new(ProtocolVersion::default());
        content.send(&Message::RequiredCapabilities {
            capabilities: vec!["a".into()],
        });
        content.send(&Message::RequiredReferenceFrames { frames: vec![] });

        let (manager_end, content_end) = MessagePort::pair();
        content.connect(payload(), content_end);
        content.send(&Message::Blur);

        let types: Vec<_> = manager_end.drain().into_iter().map(|m| m.message_type).collect();
        assert_eq!(types, vec!["requiredCapabilities", "requiredReferenceFrames", "blur"]);
        assert_eq!(content.capabilities().ready_capabilities(), vec!["geolocation".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_after_timeout() {
        let content = ManagerPort::new(ProtocolVersion::default());
        assert_eq!(content.when_connected(Duration::from_millis(500)).await, Connection::Standalone);
    }

    #[tokio::test]
    async fn test_managed_when_connected() {
        let content = ManagerPort::new(ProtocolVersion::default());
        let (_manager_end, content_end) = MessagePort::pair();
        content.connect(payload(), content_end);
        assert_eq!(
            content.when_connected(Duration::from_millis(10)).await,
            Connection::Managed(payload())
        );
    }

    #[tokio::test]
    async fn test_request_settles_on_pump() {
        let content = ManagerPort::new(ProtocolVersion::default());
        let (manager_end, content_end) = MessagePort::pair();
        content.connect(payload(), content_end);

        let pending = content.request("vuforia.init", json!({}));
        let wire = manager_end.drain().pop().unwrap();
        let request: periscope_shared::Request = serde_json::from_value(wire.event).unwrap();
        manager_end
            .post(Message::Response(Response::resolve(request.id, json!(true))).to_wire())
            .unwrap();

        assert_eq!(content.pump(), 1);
        assert_eq!(pending.await, Ok(json!(true)));
    }

    #[test]
    fn test_incoming_messages_route_by_type() {
        let content = ManagerPort::new(ProtocolVersion::default());
        let (manager_end, content_end) = MessagePort::pair();
        content.connect(payload(), content_end);

        let focused = Arc::new(Mutex::new(0));
        let f = Arc::clone(&focused);
        content.on("focus", move |_| *f.lock() += 1);

        manager_end
            .post(Message::Queue(vec![Message::Focus.to_wire(), Message::Blur.to_wire()]).to_wire())
            .unwrap();
        assert_eq!(content.pump(), 2);
        assert_eq!(*focused.lock(), 1);
    }

    #[test]
    fn test_incoming_request_gets_reply() {
        let content = ManagerPort::new(ProtocolVersion::default());
        content.handlers().register("ping", |(), _| Ok(json!("pong")));
        let (manager_end, content_end) = MessagePort::pair();
        content.connect(payload(), content_end);

        let request = periscope_shared::Request {
            id: periscope_shared::RequestId::new("m1"),
            request_type: "ping".into(),
            payload: Value::Null,
        };
        manager_end.post(Message::Request(request).to_wire()).unwrap();
        content.pump();

        let reply: Response = serde_json::from_value(manager_end.drain().pop().unwrap().event).unwrap();
        assert_eq!(reply.outcome, ResponseOutcome::Resolve(json!("pong")));
    }

    #[tokio::test]
    async fn test_unload_notifies_and_rejects() {
        let content = ManagerPort::new(ProtocolVersion::default());
        let (manager_end, content_end) = MessagePort::pair();
        content.connect(payload(), content_end);

        let pending = content.request("slow", Value::Null);
        content.unload();

        let types: Vec<_> = manager_end.drain().into_iter().map(|m| m.message_type).collect();
        assert_eq!(types, vec!["REQUEST", "unload"]);
        assert_eq!(pending.await, Err(MessagingError::Disconnected));
        assert!(!content.is_connected());
    }
}
