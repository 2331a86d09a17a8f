use crate::geodesy::{distance_meters, initial_bearing_degrees};
use crate::types::{Fix, Position};

/// Minimum displacement before the heading is allowed to change (meters)
pub const DEFAULT_MIN_DISPLACEMENT_M: f64 = 2.0;

/// Stable heading from a noisy fix stream.
///
/// Raw device course is unreliable at low speed and standstill, so the heading
/// only moves once the device has travelled `min_displacement_m` from the last
/// accepted position. When it does move, a sensor heading wins over the
/// bearing computed from the displacement.
#[derive(Debug, Clone)]
pub struct HeadingEstimator {
    previous: Option<Position>,
    heading: f64,
    min_displacement_m: f64,
}

impl HeadingEstimator {
    pub fn new(min_displacement_m: f64) -> Self {
        Self {
            previous: None,
            heading: 0.0,
            min_displacement_m,
        }
    }

    /// Fold a fix into the estimator, returning the effective heading
    pub fn update(&mut self, fix: &Fix) -> f64 {
        let current = fix.position();

        let Some(previous) = self.previous else {
            if let Some(hint) = fix.valid_heading_hint() {
                self.heading = hint;
            }
            self.previous = Some(current);
            return self.heading;
        };

        // Jitter gate: previous is kept so small steps accumulate
        if distance_meters(previous, current) < self.min_displacement_m {
            return self.heading;
        }

        self.heading = match fix.valid_heading_hint() {
            Some(hint) => hint,
            None => initial_bearing_degrees(previous, current),
        };
        self.previous = Some(current);
        self.heading
    }

    pub fn heading(&self) -> f64 {
        self.heading
    }

    pub fn previous(&self) -> Option<Position> {
        self.previous
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.heading = 0.0;
    }
}

impl Default for HeadingEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DISPLACEMENT_M)
    }
}
