//! # Wire Protocol
//!
//! Every message crossing a dedicated channel is a [`WireMessage`]:
//! a string `type` and a JSON `event` body. [`Message`] is the typed view
//! of the same vocabulary.
//!
//! ```text
//!   Message ──to_wire──> WireMessage {type, event} ──> port ──> from_wire ──> Message
//! ```
//!
//! Types nobody in this crate knows about survive as [`Message::Custom`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_state::FrameState;
use crate::reality_config::RealityConfiguration;
use crate::version::ProtocolVersion;
use bytemuck::{Pod, Zeroable};
use periscope_core::{Cartesian3, Cartographic, Ellipsoid, Quaternion, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wire type strings.
pub mod types {
    /// Request envelope.
    pub const REQUEST: &str = "REQUEST";
    /// Response envelope.
    pub const RESPONSE: &str = "RESPONSE";
    /// Several messages batched in one envelope.
    pub const MESSAGE_QUEUE: &str = "MESSAGE_QUEUE";
    /// The channel gained focus.
    pub const FOCUS: &str = "focus";
    /// The channel lost focus.
    pub const BLUR: &str = "blur";
    /// The content is going away.
    pub const UNLOAD: &str = "unload";
    /// The content navigated.
    pub const NAVIGATION: &str = "navigation";
    /// A frame state snapshot.
    pub const UPDATE: &str = "update";
    /// Content asks for a reality.
    pub const REQUIRED_REALITY: &str = "requiredReality";
    /// An option of the required reality changed.
    pub const REQUIRED_REALITY_OPTIONS_CHANGE: &str = "requiredRealityOptionsChange";
    /// Content asks for capabilities.
    pub const REQUIRED_CAPABILITIES: &str = "requiredCapabilities";
    /// Content asks for reference frames.
    pub const REQUIRED_REFERENCE_FRAMES: &str = "requiredReferenceFrames";
    /// Context options.
    pub const OPTIONS: &str = "options";
    /// Immersive or page presentation.
    pub const PRESENTATION_MODE: &str = "presentationMode";
}

/// A serialized message, exactly as it crosses a port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Message body.
    #[serde(default)]
    pub event: Value,
}

impl WireMessage {
    /// Creates a wire message.
    #[must_use]
    pub fn new(message_type: impl Into<String>, event: Value) -> Self {
        Self {
            message_type: message_type.into(),
            event,
        }
    }

    fn decode<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        serde_json::from_value(self.event.clone()).map_err(|e| ProtocolError::malformed(&self.message_type, &e))
    }
}

/// Process-unique request identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an existing id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Handler key.
    #[serde(rename = "type")]
    pub request_type: String,
    /// Request body.
    #[serde(default)]
    pub payload: Value,
}

/// A serialized error, as carried in a `reject` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    /// Human-readable message.
    pub message: String,
    /// Remote stack or source chain, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    /// An error with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

// Peers may reject with `{message}`, `{description}` or a bare string.
impl<'de> Deserialize<'de> for ErrorPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Structured {
                message: Option<String>,
                description: Option<String>,
                stack: Option<String>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(message) => Self::new(message),
            Raw::Structured {
                message,
                description,
                stack,
            } => Self {
                message: message.or(description).unwrap_or_else(|| "unknown error".to_string()),
                stack,
            },
        })
    }
}

/// How a request settled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseOutcome {
    /// Success value.
    #[serde(rename = "resolve")]
    Resolve(Value),
    /// Failure.
    #[serde(rename = "reject")]
    Reject(ErrorPayload),
}

/// A response envelope: `{id, resolve}` or `{id, reject}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: RequestId,
    /// The settlement.
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl Response {
    /// A successful reply.
    #[must_use]
    pub fn resolve(id: RequestId, value: Value) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Resolve(value),
        }
    }

    /// A failed reply.
    #[must_use]
    pub fn reject(id: RequestId, error: ErrorPayload) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Reject(error),
        }
    }
}

/// Presentation of the focused content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationMode {
    /// Full-screen AR view.
    Immersive,
    /// Ordinary page view.
    Page,
}

/// Announcement a content context makes when it loads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelAnnouncement {
    /// The URL the content believes it is at.
    pub url: String,
    /// Protocol version the content speaks.
    pub version: ProtocolVersion,
}

/// Sent by the manager when it accepts a content context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    /// Capabilities ready on this platform.
    pub capabilities: Vec<String>,
    /// Whether the channel currently has focus.
    pub focus: bool,
    /// Protocol version of the manager.
    pub version: ProtocolVersion,
}

/// Typed protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
    /// Focus gained.
    Focus,
    /// Focus lost.
    Blur,
    /// Content unloading.
    Unload,
    /// Navigation happened; `None` means blank.
    Navigation {
        /// New URL.
        url: Option<String>,
    },
    /// Frame state relay.
    Update(Box<FrameState>),
    /// Content requires a reality, or none.
    RequiredReality {
        /// Descriptor of the required reality.
        configuration: Option<RealityConfiguration>,
    },
    /// An option of the required reality changed.
    RequiredRealityOptionsChange {
        /// Option key.
        id: String,
        /// New value.
        value: Value,
    },
    /// Content requires capabilities.
    RequiredCapabilities {
        /// Capability names.
        capabilities: Vec<String>,
    },
    /// Content requires reference frames.
    RequiredReferenceFrames {
        /// Frame ids.
        frames: Vec<String>,
    },
    /// Context options.
    Options(Map<String, Value>),
    /// Presentation mode change.
    PresentationMode {
        /// The new mode.
        mode: PresentationMode,
    },
    /// A batch of messages to unpack in order.
    Queue(Vec<WireMessage>),
    /// Anything else, passed through untouched.
    Custom(WireMessage),
}

#[derive(Serialize, Deserialize)]
struct NavigationBody {
    url: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RequiredRealityBody {
    configuration: Option<RealityConfiguration>,
}

#[derive(Serialize, Deserialize)]
struct OptionChangeBody {
    id: String,
    #[serde(default)]
    value: Value,
}

#[derive(Serialize, Deserialize)]
struct CapabilitiesBody {
    capabilities: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct FramesBody {
    frames: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PresentationBody {
    mode: PresentationMode,
}

fn encode<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Message {
    /// The wire type string.
    #[must_use]
    pub fn message_type(&self) -> &str {
        match self {
            Self::Request(_) => types::REQUEST,
            Self::Response(_) => types::RESPONSE,
            Self::Focus => types::FOCUS,
            Self::Blur => types::BLUR,
            Self::Unload => types::UNLOAD,
            Self::Navigation { .. } => types::NAVIGATION,
            Self::Update(_) => types::UPDATE,
            Self::RequiredReality { .. } => types::REQUIRED_REALITY,
            Self::RequiredRealityOptionsChange { .. } => types::REQUIRED_REALITY_OPTIONS_CHANGE,
            Self::RequiredCapabilities { .. } => types::REQUIRED_CAPABILITIES,
            Self::RequiredReferenceFrames { .. } => types::REQUIRED_REFERENCE_FRAMES,
            Self::Options(_) => types::OPTIONS,
            Self::PresentationMode { .. } => types::PRESENTATION_MODE,
            Self::Queue(_) => types::MESSAGE_QUEUE,
            Self::Custom(wire) => &wire.message_type,
        }
    }

    /// Serializes into the wire shape.
    #[must_use]
    pub fn to_wire(&self) -> WireMessage {
        let event = match self {
            Self::Request(request) => encode(request),
            Self::Response(response) => encode(response),
            Self::Focus | Self::Blur | Self::Unload => Value::Object(Map::new()),
            Self::Navigation { url } => encode(&NavigationBody { url: url.clone() }),
            Self::Update(state) => encode(state),
            Self::RequiredReality { configuration } => encode(&RequiredRealityBody {
                configuration: configuration.clone(),
            }),
            Self::RequiredRealityOptionsChange { id, value } => encode(&OptionChangeBody {
                id: id.clone(),
                value: value.clone(),
            }),
            Self::RequiredCapabilities { capabilities } => encode(&CapabilitiesBody {
                capabilities: capabilities.clone(),
            }),
            Self::RequiredReferenceFrames { frames } => encode(&FramesBody { frames: frames.clone() }),
            Self::Options(options) => Value::Object(options.clone()),
            Self::PresentationMode { mode } => encode(&PresentationBody { mode: *mode }),
            Self::Queue(queue) => encode(queue),
            Self::Custom(wire) => return wire.clone(),
        };
        WireMessage::new(self.message_type(), event)
    }

    /// Parses a wire message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when a known type carries a body
    /// of the wrong shape.
    pub fn from_wire(wire: WireMessage) -> ProtocolResult<Self> {
        Ok(match wire.message_type.as_str() {
            types::REQUEST => Self::Request(wire.decode()?),
            types::RESPONSE => Self::Response(wire.decode()?),
            types::FOCUS => Self::Focus,
            types::BLUR => Self::Blur,
            types::UNLOAD => Self::Unload,
            types::NAVIGATION => Self::Navigation {
                url: wire.decode::<NavigationBody>()?.url,
            },
            types::UPDATE => Self::Update(Box::new(wire.decode()?)),
            types::REQUIRED_REALITY => Self::RequiredReality {
                configuration: wire.decode::<RequiredRealityBody>()?.configuration,
            },
            types::REQUIRED_REALITY_OPTIONS_CHANGE => {
                let body: OptionChangeBody = wire.decode()?;
                Self::RequiredRealityOptionsChange {
                    id: body.id,
                    value: body.value,
                }
            }
            types::REQUIRED_CAPABILITIES => Self::RequiredCapabilities {
                capabilities: wire.decode::<CapabilitiesBody>()?.capabilities,
            },
            types::REQUIRED_REFERENCE_FRAMES => Self::RequiredReferenceFrames {
                frames: wire.decode::<FramesBody>()?.frames,
            },
            types::OPTIONS => Self::Options(wire.decode()?),
            types::PRESENTATION_MODE => Self::PresentationMode {
                mode: wire.decode::<PresentationBody>()?.mode,
            },
            types::MESSAGE_QUEUE => Self::Queue(wire.decode()?),
            _ => Self::Custom(wire),
        })
    }

    /// Flattens batches into their messages, preserving order.
    ///
    /// Entries that fail to parse are skipped and reported through `on_error`.
    pub fn unpack(self, on_error: &mut impl FnMut(ProtocolError)) -> Vec<Self> {
        let Self::Queue(queue) = self else {
            return vec![self];
        };
        let mut flat = Vec::with_capacity(queue.len());
        for wire in queue {
            match Self::from_wire(wire) {
                Ok(message) => flat.extend(message.unpack(on_error)),
                Err(error) => on_error(error),
            }
        }
        flat
    }
}

/// Location flag in [`DevicePoseSample::flags`].
pub const SAMPLE_HAS_LOCATION: u32 = 1;
/// Orientation flag in [`DevicePoseSample::flags`].
pub const SAMPLE_HAS_ORIENTATION: u32 = 1 << 1;

/// Binary device pose sample from the native bridge.
///
/// Timestamps are seconds since device boot; orientation is relative to
/// the local East-North-Up frame at the sampled location.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DevicePoseSample {
    /// Seconds since device boot.
    pub timestamp: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Height above the ellipsoid in meters.
    pub altitude: f64,
    /// Orientation `[x, y, z, w]`, relative to local ENU.
    pub orientation: [f64; 4],
    /// `SAMPLE_HAS_*` bits.
    pub flags: u32,
    /// Padding
    pub _pad: u32,
}

impl DevicePoseSample {
    /// Size of one encoded sample.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Decodes a packed run of samples.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadPayloadLength`] when `bytes` is not a
    /// whole number of samples.
    pub fn decode_all(bytes: &[u8]) -> ProtocolResult<Vec<Self>> {
        if bytes.len() % Self::SIZE != 0 {
            return Err(ProtocolError::BadPayloadLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes
            .chunks_exact(Self::SIZE)
            .map(bytemuck::pod_read_unaligned::<Self>)
            .collect())
    }

    /// Encodes a run of samples.
    #[must_use]
    pub fn encode_all(samples: &[Self]) -> Vec<u8> {
        bytemuck::cast_slice(samples).to_vec()
    }

    /// True if the location fields are valid.
    #[must_use]
    pub const fn has_location(&self) -> bool {
        self.flags & SAMPLE_HAS_LOCATION != 0
    }

    /// True if the orientation field is valid.
    #[must_use]
    pub const fn has_orientation(&self) -> bool {
        self.flags & SAMPLE_HAS_ORIENTATION != 0
    }

    /// Sample time, given the wall-clock time of device boot.
    #[must_use]
    pub fn time(&self, boot_time: Timestamp) -> Timestamp {
        boot_time.add_seconds(self.timestamp)
    }

    /// Earth-fixed position of the sample.
    #[must_use]
    pub fn fixed_position(&self) -> Option<Cartesian3> {
        self.has_location().then(|| {
            Ellipsoid::WGS84.cartographic_to_cartesian(Cartographic::from_degrees(
                self.longitude,
                self.latitude,
                self.altitude,
            ))
        })
    }

    /// Earth-fixed orientation of the sample.
    #[must_use]
    pub fn fixed_orientation(&self) -> Option<Quaternion> {
        if !self.has_orientation() {
            return None;
        }
        let position = self.fixed_position()?;
        let enu = Ellipsoid::WGS84.east_north_up_quaternion(position)?;
        let [x, y, z, w] = self.orientation;
        Some((enu * Quaternion::new(x, y, z, w)).normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shapes() {
        let ok = Response::resolve(RequestId::new("a"), json!({"x": 1}));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"id": "a", "resolve": {"x": 1}}));

        let err = Response::reject(RequestId::new("b"), ErrorPayload::new("unhandled request"));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"id": "b", "reject": {"message": "unhandled request"}})
        );

        let back: Response = serde_json::from_value(json!({"id": "b", "reject": "boom"})).unwrap();
        assert_eq!(back.outcome, ResponseOutcome::Reject(ErrorPayload::new("boom")));
    }

    #[test]
    fn test_error_payload_accepts_description() {
        let payload: ErrorPayload = serde_json::from_value(json!({"description": "nope"})).unwrap();
        assert_eq!(payload.message, "nope");
    }

    #[test]
    fn test_known_type_with_bad_body_is_malformed() {
        let wire = WireMessage::new(types::REQUIRED_CAPABILITIES, json!({"capabilities": 3}));
        assert!(matches!(Message::from_wire(wire), Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_type_is_custom() {
        let wire = WireMessage::new("dataSource.packet", json!({"packet": []}));
        assert_eq!(Message::from_wire(wire.clone()).unwrap(), Message::Custom(wire.clone()));
        assert_eq!(Message::Custom(wire.clone()).to_wire(), wire);
    }

    #[test]
    fn test_queue_unpacks_in_order() {
        let queue = Message::Queue(vec![
            Message::Focus.to_wire(),
            WireMessage::new(types::NAVIGATION, json!({"bad": true, "url": 5})),
            Message::Queue(vec![Message::Blur.to_wire()]).to_wire(),
            Message::Unload.to_wire(),
        ]);
        let mut errors = 0;
        let flat = queue.unpack(&mut |_| errors += 1);
        assert_eq!(flat, vec![Message::Focus, Message::Blur, Message::Unload]);
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_pose_samples_decode_unaligned() {
        let sample = DevicePoseSample {
            timestamp: 12.5,
            longitude: -84.39,
            latitude: 33.77,
            altitude: 300.0,
            orientation: [0.0, 0.0, 0.0, 1.0],
            flags: SAMPLE_HAS_LOCATION | SAMPLE_HAS_ORIENTATION,
            _pad: 0,
        };
        let mut bytes = vec![0_u8];
        bytes.extend(DevicePoseSample::encode_all(&[sample, sample]));

        let decoded = DevicePoseSample::decode_all(&bytes[1..]).unwrap();
        assert_eq!(decoded, vec![sample, sample]);
        assert!(DevicePoseSample::decode_all(&bytes[..10]).is_err());
    }

    #[test]
    fn test_identity_sample_orientation_is_local_enu() {
        let sample = DevicePoseSample {
            longitude: 10.0,
            latitude: 45.0,
            orientation: [0.0, 0.0, 0.0, 1.0],
            flags: SAMPLE_HAS_LOCATION | SAMPLE_HAS_ORIENTATION,
            ..DevicePoseSample::default()
        };
        let position = sample.fixed_position().unwrap();
        let expected = Ellipsoid::WGS84.east_north_up_quaternion(position).unwrap();
        assert!(sample.fixed_orientation().unwrap().equals_epsilon(expected, 1e-12));
    }
}
