//! `mapbot-kernel` – Safety
//!
//! The bridge's brainstem. It does not think; it enforces rules on what
//! operators may ask of the robot.
//!
//! # Modules
//!
//! - [`validator`] – [`InputValidator`][validator::InputValidator]:
//!   a rule engine that checks every [`OperatorRequest`][validator::OperatorRequest]
//!   (steering, calibration, position reset) against registered range rules
//!   and returns [`MapError::Validation`][mapbot_types::MapError::Validation]
//!   if any rule is violated.

pub mod validator;

pub use validator::{
    CalibrationRangeRule, ControlRangeRule, HeadingRangeRule, InputValidator, OperatorRequest,
    Rule,
};
