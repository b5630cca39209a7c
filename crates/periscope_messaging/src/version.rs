//! Per-version message translation for content speaking an older protocol.
//!
//! Contents older than [`UNPREFIXED_SINCE`] expect the manager-scoped types
//! under an `immersiveContext.` namespace, and send them that way too.

use periscope_shared::protocol::types;
use periscope_shared::{ProtocolVersion, WireMessage, UNPREFIXED_SINCE};

const LEGACY_PREFIX: &str = "immersiveContext.";

const NAMESPACED: [&str; 7] = [
    types::UPDATE,
    types::REQUIRED_REALITY,
    types::REQUIRED_REALITY_OPTIONS_CHANGE,
    types::REQUIRED_CAPABILITIES,
    types::REQUIRED_REFERENCE_FRAMES,
    types::OPTIONS,
    types::PRESENTATION_MODE,
];

/// Rewrites messages between the current and a connected content's dialect.
#[derive(Clone, Copy, Debug)]
pub struct VersionTransformer {
    legacy_before: ProtocolVersion,
}

impl Default for VersionTransformer {
    fn default() -> Self {
        Self {
            legacy_before: ProtocolVersion::parse(UNPREFIXED_SINCE).unwrap_or(ProtocolVersion::new(1, 1, 0)),
        }
    }
}

impl VersionTransformer {
    /// Creates the transformer for the current protocol.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_legacy(&self, version: ProtocolVersion) -> bool {
        version < self.legacy_before
    }

    /// Shapes an outgoing message for a content speaking `version`.
    #[must_use]
    pub fn to_channel(&self, version: ProtocolVersion, mut message: WireMessage) -> WireMessage {
        if self.is_legacy(version) && NAMESPACED.contains(&message.message_type.as_str()) {
            message.message_type = format!("{LEGACY_PREFIX}{}", message.message_type);
        }
        message
    }

    /// Normalizes an incoming message from a content speaking `version`.
    #[must_use]
    pub fn from_channel(&self, version: ProtocolVersion, mut message: WireMessage) -> WireMessage {
        if !self.is_legacy(version) {
            return message;
        }
        if let Some(stripped) = message.message_type.strip_prefix(LEGACY_PREFIX) {
            if NAMESPACED.contains(&stripped) {
                message.message_type = stripped.to_string();
            }
        }
        message
    }
}
