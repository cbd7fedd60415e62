//! Differential-drive control translator.
//!
//! Maps operator steering input onto the three bytes the robot firmware
//! understands: left and right motor PWM duty in `[0, 255]` and the camera
//! servo angle in `[0, 180]`.
//!
//! Steering right slows the right track; steering left slows the left track.
//! At full lock the inner track runs at half speed. The camera servo follows
//! the steering at half amplitude so the operator looks into the turn.
//!
//! # Example
//!
//! ```rust
//! use mapbot_hal::drive::to_motor_command;
//! use mapbot_types::{ControlCommand, MotorCommand};
//!
//! let cmd = ControlCommand { steering: 90.0, throttle: 100.0, brake: false };
//! assert_eq!(
//!     to_motor_command(&cmd),
//!     MotorCommand { motor_left: 255, motor_right: 128, servo_angle: 135 },
//! );
//! ```

use mapbot_types::{ControlCommand, MotorCommand};

/// Full-scale motor duty.
pub const MAX_DUTY: f64 = 255.0;

/// Servo angle looking straight ahead.
pub const SERVO_CENTRE: u8 = 90;

/// Servo deflection at full steering lock, in degrees.
pub const SERVO_SWING: f64 = 45.0;

/// Steering magnitude (degrees) that counts as full lock.
pub const MAX_STEERING: f64 = 90.0;

/// Both motors stopped, camera centred.
pub const STOPPED: MotorCommand = MotorCommand {
    motor_left: 0,
    motor_right: 0,
    servo_angle: SERVO_CENTRE,
};

/// Translate one operator command into a motor command.
///
/// Inputs are expected to be pre-validated; anything out of range is clamped
/// on output rather than rejected.
pub fn to_motor_command(cmd: &ControlCommand) -> MotorCommand {
    if cmd.brake {
        return STOPPED;
    }

    let base_speed = cmd.throttle / 100.0 * MAX_DUTY;
    let steering_factor = cmd.steering / MAX_STEERING;
    let inner_speed = base_speed * (1.0 - steering_factor.abs() * 0.5);

    let (left, right) = if steering_factor > 0.0 {
        (base_speed, inner_speed)
    } else if steering_factor < 0.0 {
        (inner_speed, base_speed)
    } else {
        (base_speed, base_speed)
    };

    let servo = f64::from(SERVO_CENTRE) + steering_factor * SERVO_SWING;

    MotorCommand {
        motor_left: to_byte(left, MAX_DUTY),
        motor_right: to_byte(right, MAX_DUTY),
        servo_angle: to_byte(servo, 180.0),
    }
}

/// Round half-up and clamp into `[0, max]`. NaN collapses to 0.
fn to_byte(value: f64, max: f64) -> u8 {
    let rounded = (value + 0.5).floor();
    if rounded.is_nan() {
        return 0;
    }
    rounded.clamp(0.0, max) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(steering: f64, throttle: f64, brake: bool) -> ControlCommand {
        ControlCommand {
            steering,
            throttle,
            brake,
        }
    }

    #[test]
    fn straight_full_throttle() {
        assert_eq!(
            to_motor_command(&cmd(0.0, 100.0, false)),
            MotorCommand {
                motor_left: 255,
                motor_right: 255,
                servo_angle: 90
            }
        );
    }

    #[test]
    fn full_right_lock_halves_right_track() {
        assert_eq!(
            to_motor_command(&cmd(90.0, 100.0, false)),
            MotorCommand {
                motor_left: 255,
                motor_right: 128,
                servo_angle: 135
            }
        );
    }

    #[test]
    fn full_left_lock_halves_left_track() {
        assert_eq!(
            to_motor_command(&cmd(-90.0, 100.0, false)),
            MotorCommand {
                motor_left: 128,
                motor_right: 255,
                servo_angle: 45
            }
        );
    }

    #[test]
    fn brake_overrides_everything() {
        assert_eq!(to_motor_command(&cmd(60.0, 80.0, true)), STOPPED);
        assert_eq!(
            STOPPED,
            MotorCommand {
                motor_left: 0,
                motor_right: 0,
                servo_angle: 90
            }
        );
    }

    #[test]
    fn partial_left_at_half_throttle() {
        // base 127.5, inner 95.625, servo 67.5
        assert_eq!(
            to_motor_command(&cmd(-45.0, 50.0, false)),
            MotorCommand {
                motor_left: 96,
                motor_right: 128,
                servo_angle: 68
            }
        );
    }

    #[test]
    fn zero_throttle_still_steers_camera() {
        let out = to_motor_command(&cmd(30.0, 0.0, false));
        assert_eq!(out.motor_left, 0);
        assert_eq!(out.motor_right, 0);
        assert_eq!(out.servo_angle, 105);
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        let out = to_motor_command(&cmd(0.0, 250.0, false));
        assert_eq!(out.motor_left, 255);
        let out = to_motor_command(&cmd(f64::NAN, 50.0, false));
        assert_eq!(out.servo_angle, 0);
    }
}
