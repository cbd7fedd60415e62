//! [`InputValidator`] – operator input rule engine.
//!
//! Every request a browser sends that would move the robot or change the
//! fusion state passes through [`InputValidator::verify`] first. Registered
//! [`Rule`]s are evaluated in order; the first violation returns a
//! [`MapError::Validation`] and the request is **not** executed.
//!
//! Built-in rules:
//! - [`ControlRangeRule`] – steering in `[-90, 90]` degrees, throttle in
//!   `[0, 100]` percent.
//! - [`CalibrationRangeRule`] – reference and measured distances in
//!   `[0, 1000]`.
//! - [`HeadingRangeRule`] – position-reset heading in `[-180, 180]` degrees.

use mapbot_types::{ControlCommand, MapError};

/// A request from an operator, prior to execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorRequest {
    Control(ControlCommand),
    Calibrate {
        reference_distance: f64,
        measured_distance: f64,
    },
    SetPosition {
        x: f64,
        y: f64,
        theta_deg: f64,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single constraint a request must satisfy.
pub trait Rule: Send + Sync {
    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// Return `Ok(())` when the request satisfies the constraint, or
    /// [`MapError::Validation`] when it does not. Rules ignore request kinds
    /// they do not cover.
    fn check(&self, request: &OperatorRequest) -> Result<(), MapError>;
}

// ────────────────────────────────────────────────────────────────────────────
// InputValidator
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use mapbot_kernel::validator::{InputValidator, OperatorRequest};
/// use mapbot_types::ControlCommand;
///
/// let validator = InputValidator::standard();
///
/// let ok = OperatorRequest::Control(ControlCommand { steering: 30.0, throttle: 50.0, brake: false });
/// assert!(validator.verify(&ok).is_ok());
///
/// let bad = OperatorRequest::Control(ControlCommand { steering: 120.0, throttle: 50.0, brake: false });
/// assert!(validator.verify(&bad).is_err());
/// ```
#[derive(Default)]
pub struct InputValidator {
    rules: Vec<Box<dyn Rule>>,
}

impl InputValidator {
    /// Create an empty validator with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator preloaded with every built-in rule.
    pub fn standard() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(ControlRangeRule::default()));
        v.add_rule(Box::new(CalibrationRangeRule::default()));
        v.add_rule(Box::new(HeadingRangeRule::default()));
        v
    }

    /// Register a new [`Rule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, request: &OperatorRequest) -> Result<(), MapError> {
        for rule in &self.rules {
            if let Err(e) = rule.check(request) {
                tracing::debug!(rule = rule.name(), error = %e, "operator request rejected");
                return Err(e);
            }
        }
        Ok(())
    }
}

fn in_range(value: f64, min: f64, max: f64) -> bool {
    value.is_finite() && value >= min && value <= max
}

fn out_of_range(field: &str, value: f64, min: f64, max: f64) -> MapError {
    MapError::Validation(format!("{field} {value} out of [{min}, {max}]"))
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

pub struct ControlRangeRule {
    pub max_steering: f64,
    pub max_throttle: f64,
}

impl Default for ControlRangeRule {
    fn default() -> Self {
        Self {
            max_steering: 90.0,
            max_throttle: 100.0,
        }
    }
}

impl Rule for ControlRangeRule {
    fn name(&self) -> &str {
        "control_range"
    }

    fn check(&self, request: &OperatorRequest) -> Result<(), MapError> {
        if let OperatorRequest::Control(cmd) = request {
            if !in_range(cmd.steering, -self.max_steering, self.max_steering) {
                return Err(out_of_range(
                    "steering",
                    cmd.steering,
                    -self.max_steering,
                    self.max_steering,
                ));
            }
            if !in_range(cmd.throttle, 0.0, self.max_throttle) {
                return Err(out_of_range("throttle", cmd.throttle, 0.0, self.max_throttle));
            }
        }
        Ok(())
    }
}

pub struct CalibrationRangeRule {
    pub max_distance: f64,
}

impl Default for CalibrationRangeRule {
    fn default() -> Self {
        Self {
            max_distance: 1000.0,
        }
    }
}

impl Rule for CalibrationRangeRule {
    fn name(&self) -> &str {
        "calibration_range"
    }

    fn check(&self, request: &OperatorRequest) -> Result<(), MapError> {
        if let OperatorRequest::Calibrate {
            reference_distance,
            measured_distance,
        } = *request
        {
            for (field, value) in [
                ("referenceDistance", reference_distance),
                ("measuredDistance", measured_distance),
            ] {
                if !in_range(value, 0.0, self.max_distance) {
                    return Err(out_of_range(field, value, 0.0, self.max_distance));
                }
            }
        }
        Ok(())
    }
}

/// Heading check for position resets. Position coordinates are unbounded.
pub struct HeadingRangeRule {
    pub max_degrees: f64,
}

impl Default for HeadingRangeRule {
    fn default() -> Self {
        Self { max_degrees: 180.0 }
    }
}

impl Rule for HeadingRangeRule {
    fn name(&self) -> &str {
        "heading_range"
    }

    fn check(&self, request: &OperatorRequest) -> Result<(), MapError> {
        if let OperatorRequest::SetPosition { x, y, theta_deg } = *request {
            if !x.is_finite() || !y.is_finite() {
                return Err(MapError::Validation(format!(
                    "position ({x}, {y}) is not finite"
                )));
            }
            if !in_range(theta_deg, -self.max_degrees, self.max_degrees) {
                return Err(out_of_range(
                    "theta",
                    theta_deg,
                    -self.max_degrees,
                    self.max_degrees,
                ));
            }
        }
        Ok(())
    }
}
