//! # Capability Readiness
//!
//! Platform capabilities (e.g. `"geolocation"`, `"camera"`) become ready
//! asynchronously. Probes wait a bounded time and then resolve to a
//! defined outcome instead of hanging.
//!
//! ```text
//!   Pending ──set_ready──────> Ready
//!      └────set_unavailable──> Unavailable
//! ```

use crate::error::{MessagingError, MessagingResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Readiness of one capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityState {
    /// Not yet known.
    Pending,
    /// Available.
    Ready,
    /// Known to be unavailable.
    Unavailable,
}

/// Capability readiness keyed by name.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    states: Mutex<HashMap<String, watch::Sender<CapabilityState>>>,
}

impl CapabilityRegistry {
    /// Creates a registry with nothing ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, capability: &str) -> watch::Receiver<CapabilityState> {
        self.states
            .lock()
            .entry(capability.to_string())
            .or_insert_with(|| watch::channel(CapabilityState::Pending).0)
            .subscribe()
    }

    fn set(&self, capability: &str, state: CapabilityState) {
        let mut states = self.states.lock();
        let tx = states
            .entry(capability.to_string())
            .or_insert_with(|| watch::channel(CapabilityState::Pending).0);
        tx.send_replace(state);
    }

    /// Marks `capability` as available.
    pub fn set_ready(&self, capability: &str) {
        tracing::debug!(capability, "capability ready");
        self.set(capability, CapabilityState::Ready);
    }

    /// Marks `capability` as unavailable on this platform.
    pub fn set_unavailable(&self, capability: &str) {
        tracing::debug!(capability, "capability unavailable");
        self.set(capability, CapabilityState::Unavailable);
    }

    /// Current state of `capability`.
    #[must_use]
    pub fn state(&self, capability: &str) -> CapabilityState {
        self.states
            .lock()
            .get(capability)
            .map_or(CapabilityState::Pending, |tx| *tx.borrow())
    }

    /// Names of every ready capability, sorted.
    #[must_use]
    pub fn ready_capabilities(&self) -> Vec<String> {
        let mut ready: Vec<_> = self
            .states
            .lock()
            .iter()
            .filter(|(_, tx)| *tx.borrow() == CapabilityState::Ready)
            .map(|(name, _)| name.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Waits until `capability` settles, at most `limit`.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::CapabilityRequired`] for an empty name
    /// - [`MessagingError::CapabilityUnavailable`] if it is unavailable
    /// - [`MessagingError::Timeout`] if it stays pending past `limit`
    pub async fn when_ready(&self, capability: &str, limit: Duration) -> MessagingResult<()> {
        if capability.is_empty() {
            return Err(MessagingError::CapabilityRequired);
        }
        let mut rx = self.subscribe(capability);
        let settled = tokio::time::timeout(limit, rx.wait_for(|s| *s != CapabilityState::Pending)).await;
        match settled {
            Ok(Ok(state)) if *state == CapabilityState::Ready => Ok(()),
            Ok(_) => Err(MessagingError::CapabilityUnavailable(capability.to_string())),
            Err(_) => Err(MessagingError::Timeout {
                what: format!("{capability} capability"),
                after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}
