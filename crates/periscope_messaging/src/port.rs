//! # Message Ports
//!
//! A dedicated, ordered, bidirectional channel between two contexts.
//!
//! ```text
//!   MessagePort A ── tx ──────────> rx ── MessagePort B
//!                 <────────── tx ──
//! ```
//!
//! Only serialized [`WireMessage`]s cross a port. Delivery is pull-based:
//! the owner drains its end inside its own task, so messages are always
//! observed in send order.

use crate::error::{MessagingError, MessagingResult};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use periscope_shared::WireMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One end of a dedicated message channel.
#[derive(Debug)]
pub struct MessagePort {
    tx: Sender<WireMessage>,
    rx: Receiver<WireMessage>,
    closed: Arc<AtomicBool>,
}

impl MessagePort {
    /// Creates a connected pair of ports.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                closed: Arc::clone(&closed),
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                closed,
            },
        )
    }

    /// Sends a message to the other end.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::PortClosed`] once either end closed the
    /// pair or the other end was dropped.
    pub fn post(&self, message: WireMessage) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(MessagingError::PortClosed);
        }
        self.tx.send(message).map_err(|_| MessagingError::PortClosed)
    }

    /// Takes the next pending message, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<WireMessage> {
        if self.is_closed() {
            return None;
        }
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Takes every pending message, in send order.
    #[must_use]
    pub fn drain(&self) -> Vec<WireMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Closes both ends. Pending messages are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True once either end has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
