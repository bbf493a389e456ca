//! Build-time configuration for the control core.
//!
//! These constants describe the hub hardware: how many motor ports it
//! has, the encoder resolution of the stock motors, and the cadence the
//! scheduler is expected to drive the control loop at.

use crate::math::Fix16;
use embedded_time::duration::{Microseconds, Milliseconds};
use fixed_macro::types::I16F16 as fix16;

/// First valid motor port number.
pub const FIRST_MOTOR_PORT: u8 = 0;

/// Last valid motor port number.
pub const LAST_MOTOR_PORT: u8 = 3;

/// Number of motor ports on the hub.
pub const NUM_MOTOR_PORTS: usize = (LAST_MOTOR_PORT - FIRST_MOTOR_PORT + 1) as usize;

/// Hardware encoder counts per degree of shaft rotation, before any
/// gear train is applied.
pub const COUNTS_PER_DEGREE: Fix16 = fix16!(2);

/// Motor drive command limit: ±10000 maps to ±100.00% duty.
pub const MAX_DUTY: i32 = 10_000;

/// Nominal control tick period. The controller tolerates jitter; the
/// PID uses the measured interval, not this constant.
pub const TICK_PERIOD: Microseconds = Microseconds(5_000);

/// Longest accepted timed-run duration. Matches the range of a 32-bit
/// microsecond clock so trajectories stay far away from overflow.
pub const MAX_RUN_TIME: Milliseconds = Milliseconds(2_000_000);

/// Default soft limit on the reference rate, deg/s.
pub const DEFAULT_MAX_RATE: i32 = 800;

/// Default profile acceleration, deg/s².
pub const DEFAULT_ACCELERATION: i32 = 1_600;

/// Default standstill band for completion checks, deg/s.
pub const DEFAULT_RATE_TOLERANCE: i32 = 5;

/// Default position band for completion checks, deg.
pub const DEFAULT_COUNT_TOLERANCE: i32 = 3;

/// Default rate below which a saturated drive counts as stalled, deg/s.
pub const DEFAULT_STALL_RATE_LIMIT: i32 = 2;

/// Default minimum duration of the stall condition before it is
/// reported.
pub const DEFAULT_STALL_TIME: Milliseconds = Milliseconds(200);

/// Default window within which back-to-back run commands are treated as
/// caller-side speed control.
pub const DEFAULT_TIGHT_LOOP_TIME: Milliseconds = Milliseconds(100);

/// Default proportional position gain, duty per count.
pub const DEFAULT_PID_KP: i16 = 400;

/// Default integral position gain, duty per count-second.
pub const DEFAULT_PID_KI: i16 = 600;

/// Default derivative position gain, duty per count/s.
pub const DEFAULT_PID_KD: i16 = 5;
