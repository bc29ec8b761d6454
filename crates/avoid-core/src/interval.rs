//! Closed time ranges used for conflict windows.

use crate::models::Millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed time range `[start, end]` in engine milliseconds.
///
/// Two intervals that only share an endpoint intersect with length zero;
/// timelines treat that as touching, not overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: Millis,
    pub end: Millis,
}

impl Interval {
    /// Create an interval, or `None` if `start > end`.
    pub fn new(start: Millis, end: Millis) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn length(&self) -> Millis {
        self.end - self.start
    }

    /// Overlapping sub-range of two intervals, `None` if disjoint.
    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        if self.end < other.start || self.start > other.end {
            return None;
        }
        Some(Interval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// Length of the common sub-range, zero when disjoint or touching.
    pub fn overlap_length(&self, other: &Interval) -> Millis {
        self.intersect(other).map_or(0, |i| i.length())
    }

    pub fn contains(&self, t: Millis) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn contains_interval(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Clip this interval to `window`.
    pub fn clamp_to(&self, window: &Interval) -> Option<Interval> {
        self.intersect(window)
    }

    /// Parts of this interval not covered by `other`, in order.
    ///
    /// Touching intervals leave `self` whole.
    pub fn difference(&self, other: &Interval) -> Vec<Interval> {
        if self.overlap_length(other) == 0 {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if self.start < other.start {
            rest.push(Interval { start: self.start, end: other.start });
        }
        if other.end < self.end {
            rest.push(Interval { start: other.end, end: self.end });
        }
        rest
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
