//! # Event Emitter
//!
//! A typed, multi-listener event source shared by every stateful object.
//!
//! ```text
//!   emit(&event) ──> snapshot listeners ──> call each (no lock held)
//! ```
//!
//! Listeners run synchronously, in registration order, on the emitting
//! thread. The listener list is copied before dispatch, so a listener may
//! register or remove listeners, or emit again, without deadlocking.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`EventHandler::on`], used to remove the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E> {
    id: ListenerId,
    once: bool,
    callback: Callback<E>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            callback: Arc::clone(&self.callback),
        }
    }
}

struct Inner<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

/// Typed event source.
///
/// Cloning yields another handle to the same listener list.
pub struct EventHandler<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventHandler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for EventHandler<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<E> EventHandler<E> {
    /// Creates an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, once: bool, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push(Listener { id, once, callback });
        id
    }

    /// Adds a listener called on every emission.
    pub fn on(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.register(false, Arc::new(callback))
    }

    /// Adds a listener called on the next emission only.
    pub fn once(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.register(true, Arc::new(callback))
    }

    /// Removes a listener. Returns false if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Calls every listener with `event`.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let mut listeners = self.inner.listeners.lock();
            let snapshot = listeners.clone();
            listeners.retain(|l| !l.once);
            snapshot
        };
        for listener in snapshot {
            (listener.callback)(event);
        }
    }
}

impl<E: Clone + Send + Sync + 'static> EventHandler<E> {
    /// Forwards every event from this emitter into `target`.
    pub fn pipe(&self, target: &Self) -> ListenerId {
        let target = target.clone();
        self.on(move |event| target.emit(event))
    }
}

impl<E> fmt::Debug for EventHandler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
