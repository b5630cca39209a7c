//! # Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! [protocol]
//! version = "1.2.0"
//! connect_timeout_ms = 500
//!
//! [reality]
//! default_color = "white"
//! target_frame_rate = 30.0
//! ```

use crate::error::{ConfigError, ConfigResult};
use periscope_shared::constants::{CAPABILITY_TIMEOUT_MS, CONNECT_TIMEOUT_MS};
use periscope_shared::{ProtocolVersion, DEFAULT_FOV, RECENTER_THRESHOLD_SQUARED};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete runtime configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeriscopeConfig {
    /// Messaging settings.
    pub protocol: ProtocolConfig,
    /// Reality defaults.
    pub reality: RealityDefaults,
    /// Reality view defaults.
    pub view: ViewConfig,
    /// Context tuning.
    pub context: ContextConfig,
}

/// Messaging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Protocol version the manager speaks.
    pub version: ProtocolVersion,
    /// How long content waits for a manager before running standalone.
    pub connect_timeout_ms: u64,
    /// How long a capability probe waits.
    pub capability_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            capability_timeout_ms: CAPABILITY_TIMEOUT_MS,
        }
    }
}

/// Reality defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealityDefaults {
    /// Background of the manager's fallback Color reality.
    pub default_color: String,
    /// Tick-rate cap for auto-ticking realities. `None` ticks every display frame.
    pub target_frame_rate: Option<f64>,
}

impl Default for RealityDefaults {
    fn default() -> Self {
        Self {
            default_color: "white".to_string(),
            target_frame_rate: None,
        }
    }
}

/// Reality view defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewConfig {
    /// Field of view used when a reality supplies no frustum, in radians.
    pub default_fov: f64,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self { default_fov: DEFAULT_FOV }
    }
}

/// Context tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Squared eye-to-origin distance that triggers a recenter, in m².
    pub recenter_threshold_squared: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recenter_threshold_squared: RECENTER_THRESHOLD_SQUARED,
        }
    }
}

impl PeriscopeConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML, unknown keys or a
    /// bad version string, and [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`PeriscopeConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!(path = %path.display(), version = %config.protocol.version, "configuration loaded");
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(rate) = self.reality.target_frame_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(invalid("reality.target_frame_rate", format!("must be positive, got {rate}")));
            }
        }
        if self.reality.default_color.trim().is_empty() {
            return Err(invalid("reality.default_color", "must not be empty".to_string()));
        }
        let fov = self.view.default_fov;
        if !(fov.is_finite() && fov > 0.0 && fov < std::f64::consts::PI) {
            return Err(invalid("view.default_fov", format!("must be in (0, π), got {fov}")));
        }
        let threshold = self.context.recenter_threshold_squared;
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(invalid(
                "context.recenter_threshold_squared",
                format!("must be positive, got {threshold}"),
            ));
        }
        Ok(())
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.connect_timeout_ms)
    }

    /// Capability probe timeout as a duration.
    #[must_use]
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol.capability_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}
