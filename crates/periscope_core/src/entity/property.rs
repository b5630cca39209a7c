//! Time-varying pose properties.

use super::ReferenceFrame;
use crate::math::{Cartesian3, Quaternion};
use crate::time::Timestamp;

/// Values that can be interpolated between two samples.
pub trait Interpolate: Copy {
    /// Value at fraction `t` in `[0, 1]` between `a` and `b`.
    fn interpolate(a: Self, b: Self, t: f64) -> Self;
}

impl Interpolate for Cartesian3 {
    fn interpolate(a: Self, b: Self, t: f64) -> Self {
        a.lerp(b, t)
    }
}

impl Interpolate for Quaternion {
    fn interpolate(a: Self, b: Self, t: f64) -> Self {
        a.slerp(b, t)
    }
}

/// Behavior past the last sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Extrapolation {
    /// No value after the last sample.
    #[default]
    None,
    /// Hold the last sample forever.
    Hold,
}

/// A time-ordered list of samples.
#[derive(Clone, Debug)]
pub struct SampledSeries<T> {
    samples: Vec<(Timestamp, T)>,
    forward: Extrapolation,
}

impl<T: Interpolate> SampledSeries<T> {
    /// Creates an empty series.
    #[must_use]
    pub const fn new(forward: Extrapolation) -> Self {
        Self {
            samples: Vec::new(),
            forward,
        }
    }

    /// Inserts a sample, keeping time order. A sample at an existing time replaces it.
    pub fn add_sample(&mut self, time: Timestamp, value: T) {
        let index = self.samples.partition_point(|(t, _)| *t < time);
        match self.samples.get_mut(index) {
            Some(slot) if slot.0 == time => slot.1 = value,
            _ => self.samples.insert(index, (time, value)),
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Value at `time`; `None` before the first sample.
    #[must_use]
    pub fn value(&self, time: Timestamp) -> Option<T> {
        let (first_time, first) = *self.samples.first()?;
        if time < first_time {
            return None;
        }
        let index = self.samples.partition_point(|(t, _)| *t <= time);
        if index == self.samples.len() {
            let (last_time, last) = self.samples[index - 1];
            return if last_time == time || self.forward == Extrapolation::Hold {
                Some(last)
            } else {
                None
            };
        }
        if index == 0 {
            return Some(first);
        }
        let (t0, v0) = self.samples[index - 1];
        let (t1, v1) = self.samples[index];
        let span = t1.seconds_since(t0);
        let fraction = if span > 0.0 { time.seconds_since(t0) / span } else { 0.0 };
        Some(T::interpolate(v0, v1, fraction))
    }
}

/// Position of an entity relative to its reference frame.
///
/// A `None` frame marks a root entity: it defines its own frame and its
/// value is ignored when resolving chains.
#[derive(Clone, Debug)]
pub enum PositionProperty {
    /// A position that never changes.
    Constant {
        /// The position.
        value: Cartesian3,
        /// The frame it is expressed in.
        frame: Option<ReferenceFrame>,
    },
    /// A position interpolated from samples.
    Sampled {
        /// The samples.
        samples: SampledSeries<Cartesian3>,
        /// The frame they are expressed in.
        frame: Option<ReferenceFrame>,
    },
}

impl PositionProperty {
    /// A constant position.
    #[must_use]
    pub const fn constant(value: Cartesian3, frame: Option<ReferenceFrame>) -> Self {
        Self::Constant { value, frame }
    }

    /// The frame this property is expressed in.
    #[must_use]
    pub fn reference_frame(&self) -> Option<&ReferenceFrame> {
        match self {
            Self::Constant { frame, .. } | Self::Sampled { frame, .. } => frame.as_ref(),
        }
    }

    /// Value at `time` in the property's own frame.
    #[must_use]
    pub fn value(&self, time: Timestamp) -> Option<Cartesian3> {
        match self {
            Self::Constant { value, .. } => Some(*value),
            Self::Sampled { samples, .. } => samples.value(time),
        }
    }
}

/// Orientation of an entity, relative to the frame its position is expressed in.
#[derive(Clone, Debug)]
pub enum OrientationProperty {
    /// An orientation that never changes.
    Constant(Quaternion),
    /// An orientation interpolated from samples.
    Sampled(SampledSeries<Quaternion>),
}

impl OrientationProperty {
    /// Value at `time`.
    #[must_use]
    pub fn value(&self, time: Timestamp) -> Option<Quaternion> {
        match self {
            Self::Constant(value) => Some(*value),
            Self::Sampled(samples) => samples.value(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(seconds: f64) -> Timestamp {
        Timestamp::from_seconds(seconds)
    }

    #[test]
    fn test_series_bounds() {
        let mut series = SampledSeries::new(Extrapolation::None);
        series.add_sample(t(10.0), Cartesian3::ZERO);
        series.add_sample(t(20.0), Cartesian3::new(10.0, 0.0, 0.0));

        assert!(series.value(t(5.0)).is_none());
        assert_eq!(series.value(t(10.0)), Some(Cartesian3::ZERO));
        assert_eq!(series.value(t(15.0)), Some(Cartesian3::new(5.0, 0.0, 0.0)));
        assert_eq!(series.value(t(20.0)), Some(Cartesian3::new(10.0, 0.0, 0.0)));
        assert!(series.value(t(25.0)).is_none());
    }

    #[test]
    fn test_series_hold() {
        let mut series = SampledSeries::new(Extrapolation::Hold);
        series.add_sample(t(1.0), Cartesian3::UNIT_Z);
        assert_eq!(series.value(t(100.0)), Some(Cartesian3::UNIT_Z));
    }

    #[test]
    fn test_series_out_of_order_insert() {
        let mut series = SampledSeries::new(Extrapolation::None);
        series.add_sample(t(3.0), Cartesian3::new(3.0, 0.0, 0.0));
        series.add_sample(t(1.0), Cartesian3::new(1.0, 0.0, 0.0));
        series.add_sample(t(1.0), Cartesian3::new(1.5, 0.0, 0.0));

        assert_eq!(series.len(), 2);
        assert_eq!(series.value(t(1.0)), Some(Cartesian3::new(1.5, 0.0, 0.0)));
    }
}
