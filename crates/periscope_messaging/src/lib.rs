//! # Periscope Messaging
//!
//! Request/response plumbing between a privileged manager, the untrusted
//! content contexts it hosts, and the native bridge beneath it.
//!
//! ```text
//!   native bridge <──NativePort──> ChannelManager ──Channel──┐
//!                                                            │ MessagePort pair
//!                                       content <──ManagerPort┘
//! ```
//!
//! ## Architecture
//!
//! - **Dedicated ports**: one crossbeam pair per connected channel; only
//!   serialized messages cross it.
//! - **Pump-driven delivery**: each side drains its port in its own task,
//!   so messages are handled in send order.
//! - **Handshake**: content announces its protocol version on every load;
//!   newer content is refused, older content gets translated messages.
//! - **Focus**: at most one channel is focused, changed synchronously.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod alert;
pub mod capability;
pub mod channel;
pub mod error;
pub mod event_port;
pub mod manager_port;
pub mod native_port;
pub mod port;
pub mod request;
pub mod version;

pub use alert::{AlertSink, TracingAlert};
pub use capability::{CapabilityRegistry, CapabilityState};
pub use channel::{
    Channel, ChannelEvents, ChannelId, ChannelManager, ChannelMessage, ChannelStatus, ContentFrame, ManagerEvents,
};
pub use error::{HandlerError, MessagingError, MessagingResult};
pub use event_port::EventPort;
pub use manager_port::{Connection, ManagerPort};
pub use native_port::{NativeCommand, NativeEvent, NativePort};
pub use port::MessagePort;
pub use request::{Handler, HandlerRegistry, PendingResponse, RequestTable};
pub use version::VersionTransformer;
