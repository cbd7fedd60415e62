//! Pose & sensor fusion unit.
//!
//! Turns raw ultrasonic samples into world-frame observations:
//!
//! 1. A 5-slot **median filter** suppresses single-sample spikes.
//! 2. A **calibration offset** (set by [`SensorFusion::calibrate`]) is
//!    subtracted from the filtered range.
//! 3. The servo angle is turned into a bearing relative to the robot's
//!    heading (`90°` = straight ahead) and the range is projected into the
//!    robot frame.
//! 4. The local point is rotated by the pose heading, translated by the pose
//!    position and rounded to whole world units.
//!
//! The unit never fails: non-finite or out-of-range inputs propagate into the
//! output unchanged. Range checks belong to the operator-input validator.
//!
//! # Example
//!
//! ```rust
//! use mapbot_perception::fusion::SensorFusion;
//! use mapbot_types::RawSensorSample;
//!
//! let mut fusion = SensorFusion::new();
//! fusion.calibrate(100.0, 105.0);
//!
//! let obs = fusion.process_sample(&RawSensorSample {
//!     ultrasonic: 110.0,
//!     servo_angle: 90.0,
//!     battery: Some(87.0),
//!     timestamp: 1,
//! });
//! assert_eq!(obs.distance, 105.0);
//! assert_eq!(obs.world_obstacle_point.x, 105);
//! ```

use std::collections::VecDeque;

use mapbot_types::{FusedObservation, Point2, Pose, RawSensorSample, WorldPoint};
use tracing::info;

use crate::geometry::{deg_to_rad, normalize_angle, polar_to_cartesian, rotate, round_half_up, translate};

/// Number of raw readings kept by the median filter.
pub const FILTER_WINDOW: usize = 5;

/// Servo position (degrees) that points the sensor straight ahead.
pub const SERVO_CENTRE_DEG: f64 = 90.0;

// ────────────────────────────────────────────────────────────────────────────
// Median filter
// ────────────────────────────────────────────────────────────────────────────

/// Bounded window over the most recent raw readings.
#[derive(Debug, Clone)]
pub struct MedianFilter {
    window: VecDeque<f64>,
    capacity: usize,
}

impl MedianFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push `value`, evicting the oldest reading beyond capacity, and return
    /// the median of the window.
    ///
    /// With an even number of readings the two middle values are averaged.
    pub fn push(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }

        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        }
    }

    /// Readings currently held, oldest first.
    pub fn readings(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

impl Default for MedianFilter {
    fn default() -> Self {
        Self::new(FILTER_WINDOW)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorFusion
// ────────────────────────────────────────────────────────────────────────────

/// Owns the robot pose, the median filter and the calibration offset.
#[derive(Debug, Clone, Default)]
pub struct SensorFusion {
    pose: Pose,
    filter: MedianFilter,
    calibration_offset: f64,
}

impl SensorFusion {
    /// Fresh unit: pose at the origin facing +X, empty filter, zero offset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter, calibrate and project one raw sample into the world frame.
    pub fn process_sample(&mut self, sample: &RawSensorSample) -> FusedObservation {
        let filtered = self.filter.push(sample.ultrasonic);
        let calibrated = filtered - self.calibration_offset;
        let bearing = deg_to_rad(sample.servo_angle - SERVO_CENTRE_DEG);

        let local = polar_to_cartesian(calibrated, bearing);
        let world = translate(
            rotate(local, self.pose.theta),
            Point2::new(self.pose.x, self.pose.y),
        );

        FusedObservation {
            distance: calibrated,
            angle: sample.servo_angle,
            robot_position: round_point(self.pose.x, self.pose.y),
            world_obstacle_point: round_point(world.x, world.y),
            battery: sample.battery.unwrap_or(0.0),
            timestamp: sample.timestamp,
        }
    }

    /// Store `measured − reference` as the offset subtracted from every
    /// subsequent filtered reading.
    pub fn calibrate(&mut self, reference_distance: f64, measured_distance: f64) {
        self.calibration_offset = measured_distance - reference_distance;
        info!(offset = self.calibration_offset, "sensor calibrated");
    }

    pub fn calibration_offset(&self) -> f64 {
        self.calibration_offset
    }

    /// Accumulate an odometry delta into the pose; the heading is re-wrapped
    /// into `(-π, π]`.
    pub fn update_position(&mut self, dx: f64, dy: f64, dtheta: f64) {
        self.pose.x += dx;
        self.pose.y += dy;
        self.pose.theta = normalize_angle(self.pose.theta + dtheta);
    }

    /// Overwrite the pose. `theta` is in radians and is stored as given.
    pub fn set_position(&mut self, x: f64, y: f64, theta: f64) {
        self.pose = Pose { x, y, theta };
        info!(x, y, theta, "position set");
    }

    /// Copy of the current pose.
    pub fn position(&self) -> Pose {
        self.pose
    }

    /// Readings currently held by the median filter, oldest first.
    pub fn filter_window(&self) -> Vec<f64> {
        self.filter.readings().collect()
    }

    /// Return to the freshly constructed state.
    pub fn reset(&mut self) {
        self.pose = Pose::default();
        self.filter.clear();
        self.calibration_offset = 0.0;
        info!("sensor fusion reset");
    }
}

fn round_point(x: f64, y: f64) -> WorldPoint {
    WorldPoint::new(round_half_up(x) as i64, round_half_up(y) as i64)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sample(ultrasonic: f64, servo_angle: f64) -> RawSensorSample {
        RawSensorSample {
            ultrasonic,
            servo_angle,
            battery: None,
            timestamp: 0,
        }
    }

    #[test]
    fn median_of_partial_even_window_averages_middle_values() {
        let mut filter = MedianFilter::default();
        assert_eq!(filter.push(10.0), 10.0);
        assert_eq!(filter.push(20.0), 15.0);
        assert_eq!(filter.push(5.0), 10.0);
        assert_eq!(filter.push(40.0), 15.0);
    }

    #[test]
    fn median_window_evicts_oldest() {
        let mut filter = MedianFilter::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0, 100.0, 100.0, 100.0] {
            filter.push(v);
        }
        assert_eq!(filter.len(), FILTER_WINDOW);
        assert_eq!(filter.readings().collect::<Vec<_>>(), vec![4.0, 5.0, 100.0, 100.0, 100.0]);
    }

    #[test]
    fn median_stays_within_window_bounds() {
        let mut filter = MedianFilter::default();
        let inputs = [
            300.0, 12.0, 7.5, 400.0, 0.0, 55.0, 55.0, 1000.0, 3.0, 87.0, 86.0, 2.0, 999.0,
        ];
        for (i, v) in inputs.iter().enumerate() {
            let median = filter.push(*v);
            let start = (i + 1).saturating_sub(FILTER_WINDOW);
            let recent = &inputs[start..=i];
            let lo = recent.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = recent.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            assert!(median >= lo && median <= hi, "median {median} outside [{lo}, {hi}]");
        }
    }

    #[test]
    fn single_spike_is_suppressed() {
        let mut fusion = SensorFusion::new();
        for _ in 0..4 {
            fusion.process_sample(&sample(50.0, 90.0));
        }
        let obs = fusion.process_sample(&sample(390.0, 90.0));
        assert_eq!(obs.distance, 50.0);
    }

    #[test]
    fn calibration_offset_is_subtracted() {
        let mut fusion = SensorFusion::new();
        fusion.calibrate(100.0, 105.0);
        let obs = fusion.process_sample(&sample(110.0, 90.0));
        assert_eq!(obs.distance, 105.0);
        assert_eq!(fusion.calibration_offset(), 5.0);
    }

    #[test]
    fn servo_centre_points_along_heading() {
        let mut fusion = SensorFusion::new();
        let obs = fusion.process_sample(&sample(100.0, 90.0));
        assert_eq!(obs.world_obstacle_point, WorldPoint::new(100, 0));
        assert_eq!(obs.robot_position, WorldPoint::new(0, 0));
    }

    #[test]
    fn servo_angle_rotates_bearing() {
        let mut fusion = SensorFusion::new();
        // 180° servo → +90° bearing → straight along +Y.
        let obs = fusion.process_sample(&sample(100.0, 180.0));
        assert_eq!(obs.world_obstacle_point, WorldPoint::new(0, 100));
    }

    #[test]
    fn pose_rotation_and_translation_apply() {
        let mut fusion = SensorFusion::new();
        fusion.set_position(10.0, 20.0, PI / 2.0);
        let obs = fusion.process_sample(&sample(50.0, 90.0));
        assert_eq!(obs.robot_position, WorldPoint::new(10, 20));
        assert_eq!(obs.world_obstacle_point, WorldPoint::new(10, 70));
    }

    #[test]
    fn robot_position_is_rounded() {
        let mut fusion = SensorFusion::new();
        fusion.set_position(1.4, -2.5, 0.0);
        let obs = fusion.process_sample(&sample(0.0, 90.0));
        assert_eq!(obs.robot_position, WorldPoint::new(1, -2));
    }

    #[test]
    fn update_position_roundtrips_translation() {
        let mut fusion = SensorFusion::new();
        fusion.update_position(12.25, -3.5, 0.1);
        let pose = fusion.position();
        assert_eq!(pose.x, 12.25);
        assert_eq!(pose.y, -3.5);
        assert!((pose.theta - 0.1).abs() < 1e-12);
    }

    #[test]
    fn heading_stays_in_range_after_many_turns() {
        let mut fusion = SensorFusion::new();
        for _ in 0..3 {
            fusion.update_position(0.0, 0.0, PI);
        }
        let theta = fusion.position().theta;
        assert!(theta > -PI && theta <= PI);

        fusion.update_position(0.0, 0.0, 41.0 * PI + 0.3);
        let theta = fusion.position().theta;
        assert!(theta > -PI && theta <= PI);
    }

    #[test]
    fn battery_defaults_to_zero() {
        let mut fusion = SensorFusion::new();
        let obs = fusion.process_sample(&sample(10.0, 90.0));
        assert_eq!(obs.battery, 0.0);
    }

    #[test]
    fn nan_input_propagates_without_panic() {
        let mut fusion = SensorFusion::new();
        let obs = fusion.process_sample(&sample(f64::NAN, 90.0));
        assert!(obs.distance.is_nan() || obs.distance.is_finite());
    }

    #[test]
    fn reset_clears_everything() {
        let mut fusion = SensorFusion::new();
        fusion.calibrate(0.0, 3.0);
        fusion.update_position(5.0, 5.0, 1.0);
        fusion.process_sample(&sample(40.0, 90.0));
        fusion.reset();
        assert_eq!(fusion.position(), Pose::default());
        assert!(fusion.filter_window().is_empty());
        assert_eq!(fusion.calibration_offset(), 0.0);
    }
}
