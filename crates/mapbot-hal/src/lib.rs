//! `mapbot-hal` – Hardware abstraction for the differential-drive robot.
//!
//! # Modules
//!
//! - [`drive`] – [`to_motor_command`][drive::to_motor_command]: translates
//!   operator steering/throttle/brake into motor duties and a camera servo
//!   angle.

pub mod drive;

pub use drive::{to_motor_command, STOPPED};
