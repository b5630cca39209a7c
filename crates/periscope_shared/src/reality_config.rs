//! Serializable reality descriptor, used to rebuild a reality across a boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Stable reality identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RealityId(String);

impl RealityId {
    /// Creates an id from a string.
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

impl fmt::Display for RealityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RealityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Everything needed to reconstruct an equivalent reality elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityConfiguration {
    /// Reality id.
    pub id: RealityId,
    /// Kind tag, e.g. `"Color"`. Absent for generic realities.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Stylesheet URLs loaded into the sandbox.
    #[serde(default)]
    pub css_deps: Vec<String>,
    /// Script URLs loaded into the sandbox.
    #[serde(default)]
    pub js_deps: Vec<String>,
    /// Source text of the render routine.
    #[serde(default)]
    pub render_script: String,
    /// Current options.
    #[serde(default)]
    pub options: Map<String, Value>,
}
