//! Pairwise trajectory prediction.
//!
//! The engine only needs the [`TrajectoryPredictor`] seam; the linear
//! predictor here extrapolates both vehicles at constant velocity, the same
//! way the ground-side conflict detector does.

use crate::error::{DeconflictError, Result};
use crate::interval::Interval;
use crate::models::{Location, Millis, VehicleReport};
use crate::rules::AvoidanceRules;
use crate::spatial::{haversine_distance, offset_position};

/// Predicts the windows in which two vehicles lose separation.
pub trait TrajectoryPredictor {
    /// Breach windows between `a` and `b` inside `window`, with both states
    /// taken as current at `now`.
    fn predict(
        &self,
        a: &VehicleReport,
        b: &VehicleReport,
        now: Millis,
        window: Interval,
    ) -> Result<Vec<Interval>>;
}

/// Constant-velocity extrapolation sampled at a fixed step.
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    pub separation_horizontal_m: f64,
    pub separation_vertical_m: f64,
    pub sample_step_ms: Millis,
}

impl Default for LinearPredictor {
    fn default() -> Self {
        Self::from_rules(&AvoidanceRules::default())
    }
}

impl LinearPredictor {
    pub fn from_rules(rules: &AvoidanceRules) -> Self {
        Self {
            separation_horizontal_m: rules.separation_horizontal_m,
            separation_vertical_m: rules.separation_vertical_m,
            sample_step_ms: rules.sample_step_ms.max(1),
        }
    }

    /// Position of a vehicle `offset_s` seconds after its report.
    fn predict_position(vehicle: &VehicleReport, offset_s: f64) -> Location {
        let v = vehicle.velocity;
        let (lat, lon) = offset_position(
            vehicle.location.lat,
            vehicle.location.lon,
            v.y * offset_s,
            v.x * offset_s,
        );
        Location {
            lat,
            lon,
            altitude_m: vehicle.location.altitude_m + v.z * offset_s,
        }
    }

    fn breaches(&self, p1: &Location, p2: &Location) -> bool {
        let horizontal = haversine_distance(p1.lat, p1.lon, p2.lat, p2.lon);
        let vertical = (p1.altitude_m - p2.altitude_m).abs();
        horizontal < self.separation_horizontal_m && vertical < self.separation_vertical_m
    }
}

impl TrajectoryPredictor for LinearPredictor {
    fn predict(
        &self,
        a: &VehicleReport,
        b: &VehicleReport,
        now: Millis,
        window: Interval,
    ) -> Result<Vec<Interval>> {
        for vehicle in [a, b] {
            if !vehicle.is_finite() {
                return Err(DeconflictError::Prediction {
                    a: a.id,
                    b: b.id,
                    reason: format!("vehicle {} has non-finite state", vehicle.id),
                });
            }
        }

        let mut windows = Vec::new();
        let mut run: Option<Interval> = None;
        let mut t = window.start;

        loop {
            let offset_s = (t as f64 - now as f64) / 1000.0;
            let p1 = Self::predict_position(a, offset_s);
            let p2 = Self::predict_position(b, offset_s);

            if self.breaches(&p1, &p2) {
                match run.as_mut() {
                    Some(current) => current.end = t,
                    None => run = Some(Interval { start: t, end: t }),
                }
            } else if let Some(done) = run.take() {
                windows.push(done);
            }

            if t >= window.end {
                break;
            }
            t = (t + self.sample_step_ms).min(window.end);
        }

        windows.extend(run);
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vector3;
    use crate::spatial::offset_by_bearing;

    fn report(id: u32, lat: f64, lon: f64, alt: f64, velocity: Vector3) -> VehicleReport {
        VehicleReport::new(id, 0, Location::new(lat, lon, alt), velocity)
    }

    #[test]
    fn test_head_on_conflict_window() {
        let predictor = LinearPredictor::default();
        // 1000 m apart on an east-west line, closing at 20 m/s.
        let (lat2, lon2) = offset_by_bearing(33.0, -117.0, 1000.0, std::f64::consts::FRAC_PI_2);
        let a = report(1, 33.0, -117.0, 50.0, Vector3::new(10.0, 0.0, 0.0));
        let b = report(2, lat2, lon2, 50.0, Vector3::new(-10.0, 0.0, 0.0));

        let windows = predictor
            .predict(&a, &b, 0, Interval::new(0, 100_000).unwrap())
            .unwrap();
        assert_eq!(windows.len(), 1);
        // Separation drops below 50 m between t=47.5 s and t=52.5 s.
        let w = windows[0];
        assert!((47_400..=47_700).contains(&w.start), "start {}", w.start);
        assert!((52_300..=52_600).contains(&w.end), "end {}", w.end);
    }

    #[test]
    fn test_vertical_separation_prevents_conflict() {
        let predictor = LinearPredictor::default();
        let a = report(1, 33.0, -117.0, 50.0, Vector3::default());
        let b = report(2, 33.0, -117.0, 100.0, Vector3::default());

        let windows = predictor
            .predict(&a, &b, 0, Interval::new(0, 10_000).unwrap())
            .unwrap();
        assert!(windows.is_empty());
    }

    #[test]
    fn test_window_restricts_result() {
        let predictor = LinearPredictor::default();
        let a = report(1, 33.0, -117.0, 50.0, Vector3::default());
        let b = report(2, 33.0, -117.0, 55.0, Vector3::default());

        let windows = predictor
            .predict(&a, &b, 0, Interval::new(2_000, 3_050).unwrap())
            .unwrap();
        assert_eq!(windows, vec![Interval::new(2_000, 3_050).unwrap()]);
    }

    #[test]
    fn test_non_finite_state_is_error() {
        let predictor = LinearPredictor::default();
        let a = report(1, f64::NAN, -117.0, 50.0, Vector3::default());
        let b = report(2, 33.0, -117.0, 50.0, Vector3::default());
        let err = predictor
            .predict(&a, &b, 0, Interval::new(0, 1_000).unwrap())
            .unwrap_err();
        assert!(matches!(err, DeconflictError::Prediction { a: 1, b: 2, .. }));
    }
}
