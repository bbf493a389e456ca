//! Closed-loop motor control state machine.
//!
//! The controller owns one motor port's control state and settings. An
//! external scheduler drives [`Controller::tick`] at a roughly periodic
//! cadence; commands change state immediately and the next tick
//! actuates them. Passive states (coast, brake, user duty, errored)
//! bypass the PID entirely.
//!
//! Angle-bounded runs and position tracking use a position PID with the
//! integral accumulated over measured time. Time-bounded runs use the
//! speed-integrator scheme: the rate error is integrated into a
//! position-like error, `pid_kp` acts as the integrated-speed gain and
//! `pid_kd` as the proportional speed gain.
//!
//! Anti-windup and stall detection share one mechanism. While the duty
//! is saturated in the direction of the error, the reference clock (or
//! the speed integrator) pauses, so neither the reference nor the
//! integral runs away. A pause that lasts `stall_time` with the shaft
//! below `stall_rate_limit` is reported as a stall.

use crate::config;
use crate::devices::{Actuator, Counter};
use crate::error::{Error, Result};
use crate::math::{self, Fix16};
use crate::tacho::Tacho;
use crate::trajectory::{Trajectory, US_PER_SECOND};
use num::{clamp, signum};

/// What the axis does once a run completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopAction {
    /// Let the motor spin freely.
    Coast,
    /// Short the windings.
    Brake,
    /// Keep position control active on the end point.
    Hold,
}

/// Stall condition flags. Empty means not stalled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StallFlags(u8);

impl StallFlags {
    pub const NONE: StallFlags = StallFlags(0);
    /// The proportional term alone saturates the duty and the shaft
    /// still does not move.
    pub const PROPORTIONAL: StallFlags = StallFlags(0x01);
    /// The integral term is pinned at its clamp and the shaft still
    /// does not move.
    pub const INTEGRAL: StallFlags = StallFlags(0x02);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: StallFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for StallFlags {
    type Output = StallFlags;

    fn bitor(self, rhs: StallFlags) -> StallFlags {
        StallFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for StallFlags {
    fn bitor_assign(&mut self, rhs: StallFlags) {
        self.0 |= rhs.0;
    }
}

/// Control state as observed through [`Controller::state`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Coasting,
    Braking,
    UserDuty(i16),
    Errored(Error),
    Tracking,
    RunningTime,
    RunningAngle,
}

/// Control gains and limits. Rates are counts/s, accelerations
/// counts/s², times milliseconds, gains duty units per count quantity.
/// Fixed for the duration of an active maneuver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlSettings {
    /// Below this measured rate a saturated drive counts as stalled.
    pub stall_rate_limit: i32,
    /// Minimum duration of the stall condition before it is reported,
    /// in milliseconds.
    pub stall_time: i32,
    /// Soft limit on the reference rate in all run commands.
    pub max_rate: i32,
    /// Allowed deviation from standstill when checking completion.
    pub rate_tolerance: i32,
    /// Allowed deviation from the target count when checking
    /// completion.
    pub count_tolerance: i32,
    /// Profile acceleration and deceleration, strictly positive.
    pub abs_acceleration: i32,
    /// Run commands arriving within this window of the previous command
    /// skip profile generation, in milliseconds.
    pub tight_loop_time: i32,
    pub pid_kp: i16,
    pub pid_ki: i16,
    pub pid_kd: i16,
}

impl ControlSettings {
    /// Default gains and limits scaled from degree units to the count
    /// space of a motor with the given counts-per-degree ratio.
    pub fn for_counts_per_degree(counts_per_degree: Fix16) -> Self {
        let scale = |deg: i32| math::mul_i32(deg, counts_per_degree).max(1);
        Self {
            stall_rate_limit: scale(config::DEFAULT_STALL_RATE_LIMIT),
            stall_time: config::DEFAULT_STALL_TIME.0 as i32,
            max_rate: scale(config::DEFAULT_MAX_RATE),
            rate_tolerance: scale(config::DEFAULT_RATE_TOLERANCE),
            count_tolerance: scale(config::DEFAULT_COUNT_TOLERANCE),
            abs_acceleration: scale(config::DEFAULT_ACCELERATION),
            tight_loop_time: config::DEFAULT_TIGHT_LOOP_TIME.0 as i32,
            pid_kp: config::DEFAULT_PID_KP,
            pid_ki: config::DEFAULT_PID_KI,
            pid_kd: config::DEFAULT_PID_KD,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::for_counts_per_degree(config::COUNTS_PER_DEGREE)
    }
}

/// PID bookkeeping for position control (tracking and angle runs).
#[derive(Debug, Copy, Clone)]
struct AngularStatus {
    /// Whether the reference clock is progressing or paused by
    /// anti-windup.
    ref_time_running: bool,
    /// Integral of the position error, in count-microseconds.
    err_integral: i64,
    count_err_prev: i64,
    time_prev: i64,
    /// Total time the reference clock has spent paused.
    time_paused: i64,
    /// When the reference clock last paused.
    time_stopped: i64,
}

impl AngularStatus {
    fn new(now: i64) -> Self {
        Self {
            ref_time_running: true,
            err_integral: 0,
            count_err_prev: 0,
            time_prev: now,
            time_paused: 0,
            time_stopped: now,
        }
    }

    /// Effective trajectory time: wall time minus every pause.
    fn ref_time(&self, now: i64) -> i64 {
        if self.ref_time_running {
            now - self.time_paused
        } else {
            self.time_stopped - self.time_paused
        }
    }

    fn pause(&mut self, now: i64) {
        if self.ref_time_running {
            self.ref_time_running = false;
            self.time_stopped = now;
        }
    }

    fn resume(&mut self, now: i64) {
        if !self.ref_time_running {
            self.time_paused += now - self.time_stopped;
            self.ref_time_running = true;
        }
    }
}

/// PID bookkeeping for timed runs.
#[derive(Debug, Copy, Clone)]
struct TimedStatus {
    speed_integrator_running: bool,
    /// Accumulated position-like error, frozen while paused.
    speed_integrator: i64,
    integrator_time_stopped: i64,
    /// Reference count when the integrator last (re)started.
    integrator_ref_start: i64,
    /// Measured count when the integrator last (re)started.
    integrator_start: i64,
}

impl TimedStatus {
    fn new(now: i64, count_ref: i64, count: i32) -> Self {
        Self {
            speed_integrator_running: true,
            speed_integrator: 0,
            integrator_time_stopped: now,
            integrator_ref_start: count_ref,
            integrator_start: count as i64,
        }
    }
}

enum ControlState {
    Coasting,
    Braking,
    UserDuty(i16),
    Errored(Error),
    Tracking {
        target: i32,
        status: AngularStatus,
    },
    RunningTime {
        trajectory: Trajectory,
        status: TimedStatus,
        after: StopAction,
    },
    RunningAngle {
        trajectory: Trajectory,
        target: i32,
        status: AngularStatus,
        after: StopAction,
    },
}

struct PidTerms {
    p: i64,
    total: i64,
}

/// Output of one tick before it is applied to the motor.
enum TickOutput {
    Duty(i64),
    Coast,
    Brake,
}

/// Single-axis closed-loop controller. Works entirely in counts;
/// degree conversion happens one layer up.
pub struct Controller {
    settings: ControlSettings,
    state: ControlState,
    stall: StallFlags,
    last_command_time: Option<i64>,
}

impl Controller {
    pub fn new(settings: ControlSettings) -> Self {
        Self {
            settings,
            state: ControlState::Coasting,
            stall: StallFlags::NONE,
            last_command_time: None,
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Replaces the control settings. Refused while a maneuver is
    /// active, since the active profile was built from the old limits.
    pub fn set_settings(&mut self, settings: ControlSettings) -> Result<()> {
        if settings.abs_acceleration <= 0 || settings.max_rate <= 0 {
            return Err(Error::InvalidArg);
        }
        if self.is_active() {
            return Err(Error::Busy);
        }
        self.settings = settings;
        Ok(())
    }

    pub fn state(&self) -> State {
        match &self.state {
            ControlState::Coasting => State::Coasting,
            ControlState::Braking => State::Braking,
            ControlState::UserDuty(duty) => State::UserDuty(*duty),
            ControlState::Errored(kind) => State::Errored(*kind),
            ControlState::Tracking { .. } => State::Tracking,
            ControlState::RunningTime { .. } => State::RunningTime,
            ControlState::RunningAngle { .. } => State::RunningAngle,
        }
    }

    pub fn is_stalled(&self) -> StallFlags {
        self.stall
    }

    /// True when no run is in flight. Tracking counts as done: the
    /// maneuver that produced it has completed.
    pub fn is_done(&self) -> bool {
        !matches!(
            self.state,
            ControlState::RunningTime { .. } | ControlState::RunningAngle { .. }
        )
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ControlState::Tracking { .. }
                | ControlState::RunningTime { .. }
                | ControlState::RunningAngle { .. }
        )
    }

    /// Current reference `(count, rate)`, for data logging and
    /// diagnostics. `None` in passive states.
    pub fn reference(&self, now: i64) -> Option<(i64, i32)> {
        match &self.state {
            ControlState::Tracking { target, .. } => Some((*target as i64, 0)),
            ControlState::RunningTime { trajectory, .. } => Some(trajectory.reference(now)),
            ControlState::RunningAngle {
                trajectory, status, ..
            } => Some(trajectory.reference(status.ref_time(now))),
            _ => None,
        }
    }

    fn in_tight_loop(&self, now: i64) -> bool {
        match self.last_command_time {
            Some(t) => now - t < self.settings.tight_loop_time as i64 * 1_000,
            None => false,
        }
    }

    fn command_issued(&mut self, now: i64) {
        self.last_command_time = Some(now);
        self.stall = StallFlags::NONE;
    }

    /// Starts a time-bounded run at the given signed speed.
    ///
    /// A run issued within `tight_loop_time` of the previous command
    /// assumes the caller is doing its own speed control: no profile is
    /// generated and the commanded rate becomes the reference
    /// immediately, continuing from the current reference count.
    pub fn run_time(
        &mut self,
        now: i64,
        count: i32,
        rate: i32,
        duration_us: i64,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        if duration_us <= 0 || duration_us > config::MAX_RUN_TIME.0 as i64 * 1_000 {
            return Err(Error::InvalidArg);
        }
        let speed = clamp(speed, -self.settings.max_rate, self.settings.max_rate);
        let trajectory = if self.in_tight_loop(now) {
            let count0 = match &self.state {
                ControlState::RunningTime { trajectory, .. } => trajectory.reference(now).0,
                _ => count as i64,
            };
            Trajectory::constant(now, count0, speed, now + duration_us)
        } else {
            Trajectory::time_based(
                now,
                count,
                rate,
                duration_us,
                speed,
                self.settings.max_rate,
                self.settings.abs_acceleration,
            )?
        };
        let status = TimedStatus::new(now, trajectory.reference(now).0, count);
        self.state = ControlState::RunningTime {
            trajectory,
            status,
            after,
        };
        self.command_issued(now);
        Ok(())
    }

    /// Starts an angle-bounded run `angle` counts away from the current
    /// position.
    pub fn run_angle(
        &mut self,
        now: i64,
        count: i32,
        rate: i32,
        angle: i32,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        self.run_target(now, count, rate, count.saturating_add(angle), speed, after)
    }

    /// Starts an angle-bounded run to an absolute target count. The
    /// speed magnitude bounds the profile; the direction of motion
    /// follows the target.
    pub fn run_target(
        &mut self,
        now: i64,
        count: i32,
        rate: i32,
        target: i32,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        if speed == 0 {
            return Err(Error::InvalidArg);
        }
        let speed = speed.abs().min(self.settings.max_rate);
        let trajectory = Trajectory::angle_based(
            now,
            count,
            rate,
            target,
            speed,
            self.settings.abs_acceleration,
        )?;
        self.state = ControlState::RunningAngle {
            trajectory,
            target,
            status: AngularStatus::new(now),
            after,
        };
        self.command_issued(now);
        Ok(())
    }

    /// Holds position on an absolute target count.
    pub fn track_target(&mut self, now: i64, target: i32) {
        self.state = ControlState::Tracking {
            target,
            status: AngularStatus::new(now),
        };
        self.command_issued(now);
    }

    /// Ends any maneuver. Coast and brake actuate right away; hold
    /// re-targets position control on `count`.
    pub fn stop<M: Actuator>(
        &mut self,
        now: i64,
        count: i32,
        motor: &mut M,
        action: StopAction,
    ) -> Result<()> {
        match action {
            StopAction::Coast => {
                motor.coast()?;
                self.state = ControlState::Coasting;
            }
            StopAction::Brake => {
                motor.brake()?;
                self.state = ControlState::Braking;
            }
            StopAction::Hold => {
                self.state = ControlState::Tracking {
                    target: count,
                    status: AngularStatus::new(now),
                };
            }
        }
        self.command_issued(now);
        Ok(())
    }

    /// Applies a fixed user duty, bypassing closed-loop control.
    pub fn set_duty<M: Actuator>(&mut self, now: i64, motor: &mut M, duty: i16) -> Result<()> {
        let duty = clamp(duty as i32, -config::MAX_DUTY, config::MAX_DUTY) as i16;
        motor.set_duty(duty)?;
        self.state = ControlState::UserDuty(duty);
        self.command_issued(now);
        Ok(())
    }

    /// One control update. Reads the tacho, evaluates the reference,
    /// runs the PID and writes the duty. Hardware failures move the
    /// state to errored and coast the motor; the error is also returned
    /// to the scheduler.
    pub fn tick<C: Counter, M: Actuator>(
        &mut self,
        now: i64,
        tacho: &mut Tacho<C>,
        motor: &mut M,
    ) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        match self.active_tick(now, tacho, motor) {
            Ok(()) => Ok(()),
            Err(kind) => {
                // The motor must not keep its last duty with the loop
                // dead. Coast failures are moot at this point.
                motor.coast().ok();
                self.state = ControlState::Errored(kind);
                self.stall = StallFlags::NONE;
                #[cfg(feature = "defmt")]
                defmt::warn!("control loop errored: {}", kind);
                Err(kind)
            }
        }
    }

    fn active_tick<C: Counter, M: Actuator>(
        &mut self,
        now: i64,
        tacho: &mut Tacho<C>,
        motor: &mut M,
    ) -> Result<()> {
        let count = tacho.count()?;
        let rate = tacho.rate()?;
        let settings = self.settings;

        let mut next: Option<ControlState> = None;
        let output;

        match &mut self.state {
            ControlState::Tracking { target, status } => {
                let terms = angular_pid(&settings, status, now, count, *target as i64);
                self.stall = angular_stall(&settings, status, now, rate, &terms);
                output = TickOutput::Duty(terms.total);
            }
            ControlState::RunningAngle {
                trajectory,
                target,
                status,
                after,
            } => {
                let t_ref = status.ref_time(now);
                let (count_ref, _) = trajectory.reference(t_ref);
                let terms = angular_pid(&settings, status, now, count, count_ref);
                self.stall = angular_stall(&settings, status, now, rate, &terms);

                let count_err = count_ref - count as i64;
                let done = t_ref >= trajectory.end_time()
                    && count_err.abs() <= settings.count_tolerance as i64
                    && rate.abs() <= settings.rate_tolerance;
                if done {
                    let (state, out) = finish(now, *after, *target);
                    next = Some(state);
                    output = out.unwrap_or(TickOutput::Duty(terms.total));
                } else {
                    output = TickOutput::Duty(terms.total);
                }
            }
            ControlState::RunningTime {
                trajectory,
                status,
                after,
            } => {
                let (count_ref, rate_ref) = trajectory.reference(now);
                let terms = timed_pid(&settings, status, now, count, rate, count_ref, rate_ref);
                self.stall = timed_stall(&settings, status, now, rate, &terms);

                if now >= trajectory.end_time() {
                    let hold = clamp(trajectory.end_count(), i32::MIN as i64, i32::MAX as i64);
                    let (state, out) = finish(now, *after, hold as i32);
                    next = Some(state);
                    output = out.unwrap_or(TickOutput::Duty(terms.total));
                } else {
                    output = TickOutput::Duty(terms.total);
                }
            }
            _ => return Ok(()),
        }

        match output {
            TickOutput::Duty(duty) => motor.set_duty(duty as i16)?,
            TickOutput::Coast => motor.coast()?,
            TickOutput::Brake => motor.brake()?,
        }
        if let Some(state) = next {
            #[cfg(feature = "defmt")]
            defmt::debug!("maneuver complete at {=i64}", now);
            self.state = state;
            self.stall = StallFlags::NONE;
        }
        Ok(())
    }
}

/// Maps a finished run onto its end action. Hold keeps this tick's PID
/// duty and hands over to tracking; coast and brake actuate directly.
fn finish(now: i64, after: StopAction, target: i32) -> (ControlState, Option<TickOutput>) {
    match after {
        StopAction::Hold => (
            ControlState::Tracking {
                target,
                status: AngularStatus::new(now),
            },
            None,
        ),
        StopAction::Coast => (ControlState::Coasting, Some(TickOutput::Coast)),
        StopAction::Brake => (ControlState::Braking, Some(TickOutput::Brake)),
    }
}

/// Position PID shared by tracking and angle runs.
///
/// The derivative acts on the error difference, which equals the rate
/// error for an unpaused reference. Anti-windup: while the output is
/// saturated in the direction of the error, the reference clock pauses
/// and the integral freezes; both resume when saturation lifts.
fn angular_pid(
    settings: &ControlSettings,
    status: &mut AngularStatus,
    now: i64,
    count: i32,
    count_ref: i64,
) -> PidTerms {
    let count_err = count_ref - count as i64;
    let dt = (now - status.time_prev).max(1);

    if status.ref_time_running {
        status.err_integral += count_err * dt;
    }
    let ki = settings.pid_ki as i64;
    if ki > 0 {
        // Keep the integral contribution alone inside the duty range.
        let limit = config::MAX_DUTY as i64 * US_PER_SECOND / ki;
        status.err_integral = clamp(status.err_integral, -limit, limit);
    }

    let p = settings.pid_kp as i64 * count_err;
    let i = ki * status.err_integral / US_PER_SECOND;
    let d = settings.pid_kd as i64 * (count_err - status.count_err_prev) * US_PER_SECOND / dt;
    let raw = p + i + d;
    let total = clamp(raw, -(config::MAX_DUTY as i64), config::MAX_DUTY as i64);

    if raw != total && signum(raw) == signum(count_err) {
        status.pause(now);
    } else {
        status.resume(now);
    }
    status.count_err_prev = count_err;
    status.time_prev = now;

    PidTerms { p, total }
}

fn angular_stall(
    settings: &ControlSettings,
    status: &AngularStatus,
    now: i64,
    rate: i32,
    terms: &PidTerms,
) -> StallFlags {
    if status.ref_time_running
        || rate.abs() >= settings.stall_rate_limit
        || now - status.time_stopped < settings.stall_time as i64 * 1_000
    {
        return StallFlags::NONE;
    }
    let mut flags = StallFlags::NONE;
    if terms.p.abs() >= config::MAX_DUTY as i64 {
        flags |= StallFlags::PROPORTIONAL;
    }
    let ki = settings.pid_ki as i64;
    if ki > 0 {
        let limit = config::MAX_DUTY as i64 * US_PER_SECOND / ki;
        if status.err_integral.abs() >= limit {
            flags |= StallFlags::INTEGRAL;
        }
    }
    flags
}

/// Speed-integrating controller for timed runs. The integrated rate
/// error plays the role of the position error; the integrator pauses
/// instead of the reference clock when the output saturates.
fn timed_pid(
    settings: &ControlSettings,
    status: &mut TimedStatus,
    now: i64,
    count: i32,
    rate: i32,
    count_ref: i64,
    rate_ref: i32,
) -> PidTerms {
    let count_err = if status.speed_integrator_running {
        status.speed_integrator + (count_ref - status.integrator_ref_start)
            - (count as i64 - status.integrator_start)
    } else {
        status.speed_integrator
    };

    let p = settings.pid_kp as i64 * count_err;
    let d = settings.pid_kd as i64 * (rate_ref - rate) as i64;
    let raw = p + d;
    let total = clamp(raw, -(config::MAX_DUTY as i64), config::MAX_DUTY as i64);

    let saturated = raw != total && signum(raw) == signum(count_err);
    if saturated && status.speed_integrator_running {
        status.speed_integrator = count_err;
        status.speed_integrator_running = false;
        status.integrator_time_stopped = now;
    } else if !saturated && !status.speed_integrator_running {
        status.speed_integrator_running = true;
        status.integrator_ref_start = count_ref;
        status.integrator_start = count as i64;
    }

    PidTerms { p, total }
}

fn timed_stall(
    settings: &ControlSettings,
    status: &TimedStatus,
    now: i64,
    rate: i32,
    terms: &PidTerms,
) -> StallFlags {
    if status.speed_integrator_running
        || rate.abs() >= settings.stall_rate_limit
        || now - status.integrator_time_stopped < settings.stall_time as i64 * 1_000
    {
        return StallFlags::NONE;
    }
    let mut flags = StallFlags::INTEGRAL;
    if terms.p.abs() >= config::MAX_DUTY as i64 {
        flags |= StallFlags::PROPORTIONAL;
    }
    flags
}
