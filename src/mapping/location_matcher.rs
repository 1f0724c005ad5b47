//! Pairs GPS fixes with VIO positions recorded on a separate clock.
//!
//! Positions arrive at frame rate, fixes about once per second. A fix is
//! paired with the VIO position linearly interpolated at the fix timestamp as
//! soon as a position newer than the fix has been seen.

use std::collections::VecDeque;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::GeoCoordinate;

/// Positions kept before the backlog is trimmed (about ten minutes at 60 Hz).
pub const MAX_POSITIONS: usize = 36_000;
/// Positions dropped from the front when the backlog overflows.
pub const TRIM_POSITIONS: usize = 18_000;

/// Unpaired fixes kept while no newer position arrives (an hour at 1 Hz).
/// The oldest fix is dropped beyond this.
pub const MAX_PENDING_FIXES: usize = 3_600;

/// A geodetic fix from the platform location service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub coordinate: GeoCoordinate,
    /// Horizontal accuracy (metres, 1σ).
    pub accuracy: f64,
    pub timestamp_ns: u64,
}

impl GpsFix {
    pub fn new(coordinate: GeoCoordinate, accuracy: f64, timestamp_ns: u64) -> Self {
        Self {
            coordinate,
            accuracy,
            timestamp_ns,
        }
    }
}

/// A VIO camera position at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub position: Vector3<f64>,
    pub timestamp_ns: u64,
}

impl PositionSample {
    /// Linear interpolation towards `next` at `timestamp_ns`.
    fn interpolate(&self, next: &PositionSample, timestamp_ns: u64) -> Vector3<f64> {
        let span = next.timestamp_ns.saturating_sub(self.timestamp_ns);
        if span == 0 {
            return self.position;
        }
        let alpha = (timestamp_ns.saturating_sub(self.timestamp_ns)) as f64 / span as f64;
        self.position + (next.position - self.position) * alpha
    }
}

#[derive(Debug, Default)]
pub struct LocationMatcher {
    positions: VecDeque<PositionSample>,
    fixes: VecDeque<GpsFix>,
}

impl LocationMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_position(&mut self, position: Vector3<f64>, timestamp_ns: u64) {
        self.positions.push_back(PositionSample {
            position,
            timestamp_ns,
        });
        if self.positions.len() > MAX_POSITIONS {
            self.positions.drain(..TRIM_POSITIONS);
        }
    }

    /// Queue a fix. Fixes seen before any position are ignored.
    pub fn observe_fix(&mut self, fix: GpsFix) {
        if self.positions.is_empty() {
            debug!("[LocationMatcher] fix at {} ns before any position", fix.timestamp_ns);
            return;
        }
        self.fixes.push_back(fix);
        if self.fixes.len() > MAX_PENDING_FIXES {
            self.fixes.pop_front();
        }
    }

    pub fn num_positions(&self) -> usize {
        self.positions.len()
    }

    pub fn num_pending_fixes(&self) -> usize {
        self.fixes.len()
    }

    /// Pair every queued fix that can be interpolated, in arrival order.
    ///
    /// Fixes older than the oldest retained position can never be paired and
    /// are discarded. Processing stops at the first fix that is newer than
    /// every position seen so far.
    pub fn matches(&mut self) -> Vec<(GpsFix, Vector3<f64>)> {
        let mut matches = Vec::new();
        while let Some(fix) = self.fixes.front().copied() {
            match self.bracket(fix.timestamp_ns) {
                Bracket::Before => {
                    debug!("[LocationMatcher] dropping fix at {} ns", fix.timestamp_ns);
                    self.fixes.pop_front();
                }
                Bracket::After => break,
                Bracket::Between(i) => {
                    let position =
                        self.positions[i].interpolate(&self.positions[i + 1], fix.timestamp_ns);
                    // Fixes are time ordered, older positions are no longer needed.
                    self.positions.drain(..i);
                    self.fixes.pop_front();
                    matches.push((fix, position));
                }
            }
        }
        matches
    }

    fn bracket(&self, timestamp_ns: u64) -> Bracket {
        // Index of the last position strictly before the fix.
        let after = self
            .positions
            .partition_point(|p| p.timestamp_ns < timestamp_ns);
        if after == 0 {
            return match self.positions.front() {
                Some(first) if first.timestamp_ns == timestamp_ns && self.positions.len() > 1 => {
                    Bracket::Between(0)
                }
                _ => Bracket::Before,
            };
        }
        if after >= self.positions.len() {
            return Bracket::After;
        }
        Bracket::Between(after - 1)
    }
}

enum Bracket {
    Before,
    Between(usize),
    After,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fix(timestamp_ns: u64) -> GpsFix {
        GpsFix::new(GeoCoordinate::new(48.0, 11.0, 500.0), 5.0, timestamp_ns)
    }

    #[test]
    fn test_interpolates_between_positions() {
        let mut matcher = LocationMatcher::new();
        matcher.observe_position(Vector3::new(0.0, 0.0, 0.0), 1_000);
        matcher.observe_fix(fix(1_250));
        assert!(matcher.matches().is_empty());

        matcher.observe_position(Vector3::new(4.0, 0.0, -2.0), 2_000);
        let matches = matcher.matches();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0.timestamp_ns, 1_250);
        assert_relative_eq!(matches[0].1, Vector3::new(1.0, 0.0, -0.5), epsilon = 1e-12);
        assert_eq!(matcher.num_pending_fixes(), 0);
    }

    #[test]
    fn test_fix_before_positions_ignored() {
        let mut matcher = LocationMatcher::new();
        matcher.observe_fix(fix(10));
        assert_eq!(matcher.num_pending_fixes(), 0);

        matcher.observe_position(Vector3::zeros(), 100);
        matcher.observe_position(Vector3::x(), 200);
        matcher.observe_fix(fix(50));
        assert!(matcher.matches().is_empty());
        assert_eq!(matcher.num_pending_fixes(), 0);
    }

    #[test]
    fn test_fix_on_exact_sample() {
        let mut matcher = LocationMatcher::new();
        matcher.observe_position(Vector3::new(2.0, 0.0, 0.0), 100);
        matcher.observe_position(Vector3::new(4.0, 0.0, 0.0), 200);
        matcher.observe_fix(fix(100));

        let matches = matcher.matches();

        assert_eq!(matches.len(), 1);
        assert_relative_eq!(matches[0].1.x, 2.0);
    }

    #[test]
    fn test_multiple_fixes_in_order() {
        let mut matcher = LocationMatcher::new();
        for i in 0..=10u64 {
            matcher.observe_position(Vector3::new(i as f64, 0.0, 0.0), i * 100);
        }
        matcher.observe_fix(fix(150));
        matcher.observe_fix(fix(720));
        matcher.observe_fix(fix(5_000));

        let matches = matcher.matches();

        assert_eq!(matches.len(), 2);
        assert_relative_eq!(matches[0].1.x, 1.5, epsilon = 1e-12);
        assert_relative_eq!(matches[1].1.x, 7.2, epsilon = 1e-12);
        assert_eq!(matcher.num_pending_fixes(), 1);
    }

    #[test]
    fn test_pending_fixes_bounded() {
        let mut matcher = LocationMatcher::new();
        matcher.observe_position(Vector3::zeros(), 0);
        for i in 1..=(MAX_PENDING_FIXES as u64 + 10) {
            matcher.observe_fix(fix(i));
        }
        assert_eq!(matcher.num_pending_fixes(), MAX_PENDING_FIXES);

        matcher.observe_position(Vector3::x() * 100.0, 100_000);
        let matches = matcher.matches();
        assert_eq!(matches.len(), MAX_PENDING_FIXES);
        assert_eq!(matches[0].0.timestamp_ns, 11);
    }

    #[test]
    fn test_backlog_trimmed() {
        let mut matcher = LocationMatcher::new();
        for i in 0..=MAX_POSITIONS as u64 {
            matcher.observe_position(Vector3::zeros(), i);
        }
        assert_eq!(matcher.num_positions(), MAX_POSITIONS + 1 - TRIM_POSITIONS);
    }
}
