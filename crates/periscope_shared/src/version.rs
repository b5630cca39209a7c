//! Semantic protocol versions and the handshake compatibility check.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

/// How a connecting content's version relates to the manager's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionCompatibility {
    /// Identical versions.
    Same,
    /// Content is older; messages are translated for it.
    Older,
    /// Content is newer than the manager; the connection is refused.
    Newer,
}

impl ProtocolVersion {
    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parses `major.minor.patch`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidVersion`] unless the input is exactly
    /// three dot-separated unsigned integers.
    pub fn parse(input: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidVersion(input.to_string());
        let mut parts = input.trim().split('.');
        let mut next = || -> ProtocolResult<u32> {
            parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }

    /// Classifies a content version against this (manager) version.
    #[must_use]
    pub fn compatibility_of(&self, content: &Self) -> VersionCompatibility {
        match content.cmp(self) {
            Ordering::Equal => VersionCompatibility::Same,
            Ordering::Less => VersionCompatibility::Older,
            Ordering::Greater => VersionCompatibility::Newer,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::new(1, 2, 0)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: ProtocolVersion = "1.12.3".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 12, 3));
        assert_eq!(v.to_string(), "1.12.3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ProtocolVersion::parse("1.2").is_err());
        assert!(ProtocolVersion::parse("1.2.3.4").is_err());
        assert!(ProtocolVersion::parse("one.two.three").is_err());
        assert!(ProtocolVersion::parse("").is_err());
    }

    #[test]
    fn test_compatibility_against_manager() {
        let manager = ProtocolVersion::new(1, 2, 0);
        assert_eq!(manager.compatibility_of(&ProtocolVersion::new(1, 3, 0)), VersionCompatibility::Newer);
        assert_eq!(manager.compatibility_of(&ProtocolVersion::new(2, 0, 0)), VersionCompatibility::Newer);
        assert_eq!(manager.compatibility_of(&ProtocolVersion::new(1, 1, 0)), VersionCompatibility::Older);
        assert_eq!(manager.compatibility_of(&ProtocolVersion::new(1, 2, 0)), VersionCompatibility::Same);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&ProtocolVersion::new(0, 9, 1)).unwrap();
        assert_eq!(json, "\"0.9.1\"");
        let back: ProtocolVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProtocolVersion::new(0, 9, 1));
    }
}
