//! # Event Port
//!
//! A pipeable input/output pair of wire-message emitters.
//!
//! ```text
//!   trigger(msg) ──> input ──pipe──> transport (send)
//!   transport (recv) ──deliver──> output ──> on(type, listener)
//! ```
//!
//! Every cross-boundary object is wired from event ports: the input side is
//! piped into whatever actually transmits, received messages are delivered
//! to the output side and fanned out to per-type listeners.

use periscope_core::{EventHandler, ListenerId};
use periscope_shared::{Message, WireMessage};
use serde_json::Value;

/// Typed in/out message channel.
#[derive(Clone, Debug, Default)]
pub struct EventPort {
    input: EventHandler<WireMessage>,
    output: EventHandler<WireMessage>,
}

impl EventPort {
    /// Creates an unwired port.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound side. Pipe it into a transport.
    #[must_use]
    pub fn input(&self) -> &EventHandler<WireMessage> {
        &self.input
    }

    /// Inbound side.
    #[must_use]
    pub fn output(&self) -> &EventHandler<WireMessage> {
        &self.output
    }

    /// Sends a typed message outbound.
    pub fn trigger(&self, message: &Message) {
        self.input.emit(&message.to_wire());
    }

    /// Sends a raw message outbound.
    pub fn trigger_wire(&self, message: &WireMessage) {
        self.input.emit(message);
    }

    /// Hands a received message to inbound listeners.
    pub fn deliver(&self, message: &WireMessage) {
        self.output.emit(message);
    }

    /// Listens for inbound messages of one type.
    pub fn on(&self, message_type: &str, listener: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        let message_type = message_type.to_string();
        self.output.on(move |message| {
            if message.message_type == message_type {
                listener(&message.event);
            }
        })
    }

    /// Removes a listener registered with [`EventPort::on`].
    pub fn remove(&self, id: ListenerId) -> bool {
        self.output.remove(id)
    }

    /// Routes everything this port sends into `transport`.
    pub fn pipe_input(&self, transport: impl Fn(&WireMessage) + Send + Sync + 'static) -> ListenerId {
        self.input.on(transport)
    }
}
