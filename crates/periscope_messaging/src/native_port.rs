//! # Native Port
//!
//! The manager's side of the native bridge.
//!
//! ```text
//!   native ──NativeEvent{eventName, eventInfo, userData}──> receive()
//!               systemBootTime ──> boot epoch
//!               pluginsReady   ──> when_ready()
//!               RESPONSE       ──> RequestTable (by userData)
//!               anything else  ──> events
//!   native ──pose bytes──> receive_pose_samples() ──> DEVICE entity (FIXED)
//!   request() ──NativeCommand──> outbound
//! ```

use crate::error::{MessagingError, MessagingResult};
use crate::request::{PendingResponse, RequestTable};
use parking_lot::Mutex;
use periscope_core::{EntityCollection, EntityId, EventHandler, ReferenceFrame, Timestamp};
use periscope_shared::constants::DEVICE_ENTITY_ID;
use periscope_shared::protocol::types;
use periscope_shared::{DevicePoseSample, ErrorPayload, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

/// Boot epoch event name.
pub const SYSTEM_BOOT_TIME: &str = "systemBootTime";
/// One-time readiness event name.
pub const PLUGINS_READY: &str = "pluginsReady";

/// An event from the native bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeEvent {
    /// Event family.
    pub event_name: String,
    /// Event body.
    #[serde(default)]
    pub event_info: Value,
    /// Correlation id chosen by the caller of a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

/// A command sent to the native bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeCommand {
    /// Command name.
    pub command: String,
    /// Command body.
    pub payload: Value,
    /// Correlation id echoed back in the `RESPONSE` event.
    pub user_data: RequestId,
}

/// Manager-side endpoint of the native bridge.
#[derive(Debug)]
pub struct NativePort {
    entities: EntityCollection,
    boot_time: Mutex<Option<Timestamp>>,
    ready: watch::Sender<bool>,
    requests: RequestTable,
    events: EventHandler<NativeEvent>,
    outbound: EventHandler<NativeCommand>,
}

impl NativePort {
    /// Creates a port that writes device poses into `entities`.
    #[must_use]
    pub fn new(entities: EntityCollection) -> Self {
        Self {
            entities,
            boot_time: Mutex::new(None),
            ready: watch::channel(false).0,
            requests: RequestTable::new(),
            events: EventHandler::new(),
            outbound: EventHandler::new(),
        }
    }

    /// Events not consumed by the port itself.
    #[must_use]
    pub fn events(&self) -> &EventHandler<NativeEvent> {
        &self.events
    }

    /// Commands bound for the native side. Pipe into the bridge.
    #[must_use]
    pub fn outbound(&self) -> &EventHandler<NativeCommand> {
        &self.outbound
    }

    /// Wall-clock time of device boot, once reported.
    #[must_use]
    pub fn boot_time(&self) -> Option<Timestamp> {
        *self.boot_time.lock()
    }

    /// True once the native side reported its plugins ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the native side reported its plugins ready.
    pub async fn when_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Handles one event from the bridge.
    ///
    /// # Errors
    ///
    /// Returns a [`MessagingError::Protocol`] error for a malformed boot time
    /// or a response without a correlation id.
    pub fn receive(&self, event: NativeEvent) -> MessagingResult<()> {
        match event.event_name.as_str() {
            SYSTEM_BOOT_TIME => {
                let seconds = event
                    .event_info
                    .as_f64()
                    .or_else(|| event.event_info.get("time").and_then(Value::as_f64))
                    .ok_or_else(|| malformed(SYSTEM_BOOT_TIME, "expected seconds since epoch"))?;
                *self.boot_time.lock() = Some(Timestamp::from_seconds(seconds));
                tracing::debug!(seconds, "native boot time received");
            }
            PLUGINS_READY => {
                if !self.ready.send_replace(true) {
                    tracing::info!("native plugins ready");
                }
            }
            types::RESPONSE => {
                let id = event
                    .user_data
                    .map(RequestId::new)
                    .ok_or_else(|| malformed(types::RESPONSE, "missing userData"))?;
                let outcome = match event.event_info.get("error") {
                    Some(error) => Err(MessagingError::Remote(
                        serde_json::from_value::<ErrorPayload>(error.clone())
                            .unwrap_or_else(|_| ErrorPayload::new(error.to_string())),
                    )),
                    None => Ok(event.event_info),
                };
                if !self.requests.settle_with(&id, outcome) {
                    tracing::warn!(request = %id, "unknown native response received");
                }
            }
            _ => self.events.emit(&event),
        }
        Ok(())
    }

    /// Sends `command` and returns its response future.
    pub fn request(&self, command: &str, payload: Value) -> PendingResponse {
        let id = RequestId::generate();
        let pending = self.requests.register(id.clone());
        self.outbound.emit(&NativeCommand {
            command: command.to_string(),
            payload,
            user_data: id,
        });
        pending
    }

    /// Waits for the response to a command issued elsewhere with `id`.
    pub fn after_response(&self, id: RequestId) -> PendingResponse {
        self.requests.register(id)
    }

    /// Decodes packed pose samples and records them on the device entity.
    /// Returns the number of samples applied.
    ///
    /// Samples arriving before the boot time are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Protocol`] if `bytes` is not a whole
    /// number of samples.
    pub fn receive_pose_samples(&self, bytes: &[u8]) -> MessagingResult<usize> {
        let samples = DevicePoseSample::decode_all(bytes)?;
        let Some(boot) = self.boot_time() else {
            tracing::warn!(dropped = samples.len(), "pose samples before boot time");
            return Ok(0);
        };
        let device = self.entities.get_or_create(&EntityId::new(DEVICE_ENTITY_ID));
        let mut applied = 0;
        for sample in &samples {
            let time = sample.time(boot);
            let mut used = false;
            if let Some(position) = sample.fixed_position() {
                device.add_position_sample(time, position, Some(ReferenceFrame::Fixed));
                used = true;
            }
            if let Some(orientation) = sample.fixed_orientation() {
                device.add_orientation_sample(time, orientation);
                used = true;
            }
            applied += usize::from(used);
        }
        Ok(applied)
    }
}

fn malformed(message_type: &str, reason: &str) -> MessagingError {
    MessagingError::Protocol(periscope_shared::ProtocolError::Malformed {
        message_type: message_type.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::{Cartesian3, Ellipsoid};
    use periscope_shared::protocol::{SAMPLE_HAS_LOCATION, SAMPLE_HAS_ORIENTATION};
    use serde_json::json;
    use std::sync::Arc;

    fn event(name: &str, info: Value, user_data: Option<&str>) -> NativeEvent {
        NativeEvent {
            event_name: name.into(),
            event_info: info,
            user_data: user_data.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_request_correlates_by_user_data() {
        let native = NativePort::new(EntityCollection::new());
        let sent = Arc::new(Mutex::new(None));
        let s = Arc::clone(&sent);
        native.outbound().on(move |cmd| *s.lock() = Some(cmd.user_data.clone()));

        let pending = native.request("startLocation", json!({}));
        let id = sent.lock().clone().unwrap();
        native
            .receive(event("RESPONSE", json!({"accuracy": 5}), Some(id.as_str())))
            .unwrap();
        assert_eq!(pending.await, Ok(json!({"accuracy": 5})));
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let native = NativePort::new(EntityCollection::new());
        let pending = native.after_response(RequestId::new("cmd-7"));
        native
            .receive(event("RESPONSE", json!({"error": {"message": "denied"}}), Some("cmd-7")))
            .unwrap();
        assert_eq!(pending.await, Err(MessagingError::Remote(ErrorPayload::new("denied"))));
    }

    #[tokio::test]
    async fn test_plugins_ready_gates_when_ready() {
        let native = NativePort::new(EntityCollection::new());
        assert!(!native.is_ready());
        native.receive(event("pluginsReady", Value::Null, None)).unwrap();
        native.when_ready().await;
        assert!(native.is_ready());
    }

    #[test]
    fn test_other_events_are_emitted() {
        let native = NativePort::new(EntityCollection::new());
        let names = Arc::new(Mutex::new(Vec::new()));
        let n = Arc::clone(&names);
        native.events().on(move |e| n.lock().push(e.event_name.clone()));
        native.receive(event("headingUpdate", json!(1), None)).unwrap();
        assert_eq!(*names.lock(), vec!["headingUpdate".to_string()]);
    }

    #[test]
    fn test_pose_samples_need_boot_time() {
        let entities = EntityCollection::new();
        let native = NativePort::new(entities.clone());
        let sample = DevicePoseSample {
            timestamp: 2.0,
            longitude: -84.39,
            latitude: 33.77,
            altitude: 300.0,
            orientation: [0.0, 0.0, 0.0, 1.0],
            flags: SAMPLE_HAS_LOCATION | SAMPLE_HAS_ORIENTATION,
            _pad: 0,
        };
        let bytes = DevicePoseSample::encode_all(&[sample]);

        assert_eq!(native.receive_pose_samples(&bytes).unwrap(), 0);

        native.receive(event("systemBootTime", json!(1_000.0), None)).unwrap();
        assert_eq!(native.receive_pose_samples(&bytes).unwrap(), 1);

        let device = entities.get(&EntityId::new(DEVICE_ENTITY_ID)).unwrap();
        let (position, frame) = device.position_value(Timestamp::from_seconds(1_002.0)).unwrap();
        assert!(frame.unwrap().is_fixed());
        let expected: Cartesian3 = Ellipsoid::WGS84.cartographic_to_cartesian(periscope_core::Cartographic::from_degrees(
            -84.39, 33.77, 300.0,
        ));
        assert!(position.equals_epsilon(expected, 1e-6));
    }

    #[test]
    fn test_truncated_pose_payload_is_an_error() {
        let native = NativePort::new(EntityCollection::new());
        assert!(matches!(
            native.receive_pose_samples(&[0_u8; 7]),
            Err(MessagingError::Protocol(_))
        ));
    }
}
