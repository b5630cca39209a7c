//! # Frame Pacer
//!
//! Decides which display-refresh callbacks become reality ticks.
//!
//! ## Design
//!
//! The display drives the loop; the pacer only filters. With no target
//! rate every frame ticks. With a target rate a frame ticks once more than
//! one interval has elapsed since the last tick, and the remainder is
//! carried forward instead of dropped, so a 24 Hz target on a 60 Hz
//! display averages 24 Hz over time rather than drifting down to 20.

use std::time::Duration;

/// Accumulator-style tick filter for display-refresh timestamps.
#[derive(Clone, Debug)]
pub struct FramePacer {
    /// Minimum time between ticks; `None` ticks every frame.
    interval: Option<Duration>,
    /// Frame time the next interval is measured from.
    baseline: Duration,
    /// Frame time of the last tick.
    last_tick: Option<Duration>,
    /// Total ticks let through.
    tick_count: u64,
    /// Tick spacing statistics.
    stats: TickStats,
}

/// Tick spacing statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Shortest gap between two ticks.
    pub min_gap_us: u64,
    /// Longest gap between two ticks.
    pub max_gap_us: u64,
    /// Rolling average gap.
    pub avg_gap_us: u64,
    /// Ticks that came more than two intervals after the previous one.
    pub late_ticks: u64,
    /// Frames the pacer swallowed.
    pub skipped_frames: u64,
}

impl FramePacer {
    /// A pacer that lets every frame through.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            interval: None,
            baseline: Duration::ZERO,
            last_tick: None,
            tick_count: 0,
            stats: TickStats {
                min_gap_us: u64::MAX,
                ..TickStats::default()
            },
        }
    }

    /// A pacer capped at `rate` ticks per second. Non-positive or
    /// non-finite rates are treated as unlimited.
    #[must_use]
    pub fn with_rate(rate: Option<f64>) -> Self {
        let mut pacer = Self::unlimited();
        pacer.set_rate(rate);
        pacer
    }

    /// Changes the target rate. Takes effect on the next frame.
    pub fn set_rate(&mut self, rate: Option<f64>) {
        self.interval = rate
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .map(|rate| Duration::from_secs_f64(1.0 / rate));
    }

    /// The minimum spacing between ticks, if capped.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Feeds one display-refresh timestamp. Returns true if this frame ticks.
    ///
    /// `frame_time` is monotonic time since an arbitrary epoch, as handed to
    /// display-refresh callbacks.
    pub fn should_tick(&mut self, frame_time: Duration) -> bool {
        let Some(interval) = self.interval else {
            self.record(frame_time, None);
            self.baseline = frame_time;
            return true;
        };

        let delta = frame_time.saturating_sub(self.baseline);
        if delta <= interval {
            self.stats.skipped_frames += 1;
            return false;
        }

        self.record(frame_time, Some(interval));
        self.baseline = frame_time.saturating_sub(remainder(delta, interval));
        true
    }

    fn record(&mut self, frame_time: Duration, interval: Option<Duration>) {
        self.tick_count += 1;
        let Some(previous) = self.last_tick.replace(frame_time) else {
            return;
        };
        let gap = frame_time.saturating_sub(previous);
        let gap_us = u64::try_from(gap.as_micros()).unwrap_or(u64::MAX);

        self.stats.min_gap_us = self.stats.min_gap_us.min(gap_us);
        self.stats.max_gap_us = self.stats.max_gap_us.max(gap_us);
        self.stats.avg_gap_us = if self.tick_count == 2 {
            gap_us
        } else {
            (self.stats.avg_gap_us.saturating_mul(15).saturating_add(gap_us)) / 16
        };
        if interval.is_some_and(|interval| gap > interval * 2) {
            self.stats.late_ticks += 1;
        }
    }

    /// Total ticks let through.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Tick statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::unlimited()
    }
}

fn remainder(delta: Duration, interval: Duration) -> Duration {
    let interval_ns = interval.as_nanos();
    if interval_ns == 0 {
        return Duration::ZERO;
    }
    let rest = delta.as_nanos() % interval_ns;
    Duration::from_nanos(u64::try_from(rest).unwrap_or(0))
}
