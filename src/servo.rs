//! One motor port: tacho, controller and drive output glued together.
//!
//! The servo converts the degree-based public surface into the count
//! space the controller works in, using the tacho's counts-per-degree
//! scale. Time comes in from the caller as an explicit microsecond
//! timestamp so the whole stack stays deterministic and host-testable;
//! [`crate::system::MotorSystem`] supplies it from the hub clock.

use crate::control::{ControlSettings, Controller, StallFlags, State, StopAction};
use crate::devices::{Actuator, Counter};
use crate::error::{Error, Result};
use crate::math::{self, Fix16};
use crate::tacho::{Direction, Tacho};
use embedded_time::duration::Milliseconds;

pub struct Servo<C, M> {
    tacho: Tacho<C>,
    motor: M,
    control: Controller,
}

impl<C: Counter, M: Actuator> Servo<C, M> {
    pub fn new(counter: C, motor: M) -> Self {
        Self {
            tacho: Tacho::new(counter),
            motor,
            control: Controller::new(ControlSettings::default()),
        }
    }

    /// Configures direction and gearing, optionally re-basing the angle
    /// on the counter's absolute channel. Refused while control is
    /// active: re-gearing invalidates the running reference, and a held
    /// position would be dropped with drive still applied.
    ///
    /// Control settings are re-derived from the resulting
    /// counts-per-degree scale.
    pub fn setup(
        &mut self,
        direction: Direction,
        gear_ratio: Fix16,
        reset_angle: bool,
    ) -> Result<()> {
        if matches!(
            self.control.state(),
            State::Tracking | State::RunningTime | State::RunningAngle
        ) {
            return Err(Error::Busy);
        }
        self.tacho.setup(direction, gear_ratio, reset_angle)?;
        self.control = Controller::new(ControlSettings::for_counts_per_degree(
            self.tacho.counts_per_degree(),
        ));
        Ok(())
    }

    pub fn settings(&self) -> &ControlSettings {
        self.control.settings()
    }

    pub fn set_settings(&mut self, settings: ControlSettings) -> Result<()> {
        self.control.set_settings(settings)
    }

    pub fn angle(&mut self) -> Result<i32> {
        self.tacho.angle()
    }

    pub fn angular_rate(&mut self) -> Result<i32> {
        self.tacho.angular_rate()
    }

    pub fn count(&mut self) -> Result<i32> {
        self.tacho.count()
    }

    pub fn rate(&mut self) -> Result<i32> {
        self.tacho.rate()
    }

    pub fn reset_angle(&mut self, new_angle: i32, to_abs: bool) -> Result<i32> {
        self.tacho.reset_angle(new_angle, to_abs)
    }

    fn deg_to_counts(&self, degrees: i32) -> i32 {
        math::mul_i32(degrees, self.tacho.counts_per_degree())
    }

    /// Runs at `speed` deg/s for `duration`, then applies `after`.
    pub fn run_time(
        &mut self,
        now: i64,
        duration: Milliseconds,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        let count = self.tacho.count()?;
        let rate = self.tacho.rate()?;
        self.control.run_time(
            now,
            count,
            rate,
            duration.0 as i64 * 1_000,
            self.deg_to_counts(speed),
            after,
        )
    }

    /// Turns by `angle` degrees relative to the current position.
    pub fn run_angle(
        &mut self,
        now: i64,
        angle: i32,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        let count = self.tacho.count()?;
        let rate = self.tacho.rate()?;
        self.control.run_angle(
            now,
            count,
            rate,
            self.deg_to_counts(angle),
            self.deg_to_counts(speed),
            after,
        )
    }

    /// Turns to the absolute `target` angle.
    pub fn run_target(
        &mut self,
        now: i64,
        target: i32,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        let count = self.tacho.count()?;
        let rate = self.tacho.rate()?;
        self.control.run_target(
            now,
            count,
            rate,
            self.deg_to_counts(target),
            self.deg_to_counts(speed),
            after,
        )
    }

    /// Holds position on the absolute `target` angle.
    pub fn track_target(&mut self, now: i64, target: i32) -> Result<()> {
        self.control.track_target(now, self.deg_to_counts(target));
        Ok(())
    }

    /// Ends any maneuver with the given stop action.
    pub fn stop(&mut self, now: i64, action: StopAction) -> Result<()> {
        let count = match action {
            StopAction::Hold => self.tacho.count()?,
            _ => 0,
        };
        self.control.stop(now, count, &mut self.motor, action)
    }

    /// Applies a fixed duty in `[-10000, 10000]`, bypassing the loop.
    pub fn set_duty(&mut self, now: i64, duty: i16) -> Result<()> {
        self.control.set_duty(now, &mut self.motor, duty)
    }

    /// One scheduler-driven control update.
    pub fn tick(&mut self, now: i64) -> Result<()> {
        self.control.tick(now, &mut self.tacho, &mut self.motor)
    }

    pub fn is_stalled(&self) -> StallFlags {
        self.control.is_stalled()
    }

    pub fn is_done(&self) -> bool {
        self.control.is_done()
    }

    pub fn state(&self) -> State {
        self.control.state()
    }

    /// Current reference `(count, rate)`, if a reference is active.
    pub fn reference(&self, now: i64) -> Option<(i64, i32)> {
        self.control.reference(now)
    }
}
