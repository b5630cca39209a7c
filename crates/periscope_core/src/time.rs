//! Simulation timestamps.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time, in seconds since the Unix epoch.
///
/// Sub-microsecond precision is kept for a few centuries, which is plenty
/// for pose sampling.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0.0);

    /// Creates a timestamp from seconds since the epoch.
    #[must_use]
    pub const fn from_seconds(seconds: f64) -> Self {
        Self(seconds)
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        Self(seconds)
    }

    /// Seconds since the epoch.
    #[must_use]
    pub const fn seconds(self) -> f64 {
        self.0
    }

    /// Returns this timestamp shifted by `seconds`.
    #[must_use]
    pub fn add_seconds(self, seconds: f64) -> Self {
        Self(self.0 + seconds)
    }

    /// Seconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    #[must_use]
    pub fn seconds_since(self, earlier: Self) -> f64 {
        self.0 - earlier.0
    }
}
