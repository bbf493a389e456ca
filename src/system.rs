//! Per-port servo slots behind one explicitly-owned context.
//!
//! The hub has a fixed range of motor ports. `MotorSystem` owns one
//! lazily-attached [`Servo`] slot per port plus the clock, and exposes
//! the flat command surface the firmware calls into. No global state:
//! callers pass the context everywhere.

use crate::config;
use crate::control::{StallFlags, State, StopAction};
use crate::devices::{Actuator, Clock, Counter};
use crate::error::{Error, Result};
use crate::math::Fix16;
use crate::servo::Servo;
use crate::tacho::Direction;
use embedded_time::duration::Milliseconds;

pub struct MotorSystem<K, C, M> {
    clock: K,
    servos: [Option<Servo<C, M>>; config::NUM_MOTOR_PORTS],
}

impl<K: Clock, C: Counter, M: Actuator> MotorSystem<K, C, M> {
    pub fn new(clock: K) -> Self {
        Self {
            clock,
            servos: core::array::from_fn(|_| None),
        }
    }

    fn index(port: u8) -> Result<usize> {
        if port < config::FIRST_MOTOR_PORT || port > config::LAST_MOTOR_PORT {
            return Err(Error::InvalidPort);
        }
        Ok((port - config::FIRST_MOTOR_PORT) as usize)
    }

    /// Binds a counter and motor output to a port. Each port can be
    /// claimed once; re-attaching requires [`detach`](Self::detach).
    pub fn attach(&mut self, port: u8, counter: C, motor: M) -> Result<()> {
        let slot = &mut self.servos[Self::index(port)?];
        if slot.is_some() {
            return Err(Error::Busy);
        }
        *slot = Some(Servo::new(counter, motor));
        Ok(())
    }

    /// Releases a port's slot, dropping its servo.
    pub fn detach(&mut self, port: u8) -> Result<()> {
        self.servos[Self::index(port)?] = None;
        Ok(())
    }

    pub fn servo(&self, port: u8) -> Result<&Servo<C, M>> {
        self.servos[Self::index(port)?]
            .as_ref()
            .ok_or(Error::InvalidPort)
    }

    pub fn servo_mut(&mut self, port: u8) -> Result<&mut Servo<C, M>> {
        self.servos[Self::index(port)?]
            .as_mut()
            .ok_or(Error::InvalidPort)
    }

    /// Slot access with the current time, for the command wrappers.
    fn stamped(&mut self, port: u8) -> Result<(i64, &mut Servo<C, M>)> {
        let index = Self::index(port)?;
        let now = self.clock.now_us();
        let servo = self.servos[index].as_mut().ok_or(Error::InvalidPort)?;
        Ok((now, servo))
    }

    pub fn setup(
        &mut self,
        port: u8,
        direction: Direction,
        gear_ratio: Fix16,
        reset_angle: bool,
    ) -> Result<()> {
        self.servo_mut(port)?.setup(direction, gear_ratio, reset_angle)
    }

    pub fn count(&mut self, port: u8) -> Result<i32> {
        self.servo_mut(port)?.count()
    }

    pub fn rate(&mut self, port: u8) -> Result<i32> {
        self.servo_mut(port)?.rate()
    }

    pub fn angle(&mut self, port: u8) -> Result<i32> {
        self.servo_mut(port)?.angle()
    }

    pub fn angular_rate(&mut self, port: u8) -> Result<i32> {
        self.servo_mut(port)?.angular_rate()
    }

    pub fn reset_angle(&mut self, port: u8, new_angle: i32, to_abs: bool) -> Result<i32> {
        self.servo_mut(port)?.reset_angle(new_angle, to_abs)
    }

    pub fn run_time(
        &mut self,
        port: u8,
        duration: Milliseconds,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        let (now, servo) = self.stamped(port)?;
        servo.run_time(now, duration, speed, after)
    }

    pub fn run_angle(&mut self, port: u8, angle: i32, speed: i32, after: StopAction) -> Result<()> {
        let (now, servo) = self.stamped(port)?;
        servo.run_angle(now, angle, speed, after)
    }

    pub fn run_target(
        &mut self,
        port: u8,
        target: i32,
        speed: i32,
        after: StopAction,
    ) -> Result<()> {
        let (now, servo) = self.stamped(port)?;
        servo.run_target(now, target, speed, after)
    }

    pub fn track_target(&mut self, port: u8, target: i32) -> Result<()> {
        let (now, servo) = self.stamped(port)?;
        servo.track_target(now, target)
    }

    pub fn stop(&mut self, port: u8, action: StopAction) -> Result<()> {
        let (now, servo) = self.stamped(port)?;
        servo.stop(now, action)
    }

    pub fn set_duty(&mut self, port: u8, duty: i16) -> Result<()> {
        let (now, servo) = self.stamped(port)?;
        servo.set_duty(now, duty)
    }

    pub fn is_stalled(&self, port: u8) -> Result<StallFlags> {
        Ok(self.servo(port)?.is_stalled())
    }

    pub fn is_done(&self, port: u8) -> Result<bool> {
        Ok(self.servo(port)?.is_done())
    }

    pub fn state(&self, port: u8) -> Result<State> {
        Ok(self.servo(port)?.state())
    }

    /// Runs one control update on every attached servo. All servos are
    /// ticked even if one fails; the first failure is reported.
    pub fn tick_all(&mut self) -> Result<()> {
        let mut first = Ok(());
        for slot in self.servos.iter_mut() {
            if let Some(servo) = slot {
                let now = self.clock.now_us();
                let result = servo.tick(now);
                if first.is_ok() {
                    first = result;
                }
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeClock(i64);

    impl Clock for FakeClock {
        fn now_us(&mut self) -> i64 {
            self.0 += 100;
            self.0
        }
    }

    struct FakeCounter;

    impl Counter for FakeCounter {
        fn count(&mut self) -> Result<i32> {
            Ok(0)
        }

        fn rate(&mut self) -> Result<i32> {
            Ok(0)
        }
    }

    struct FakeMotor;

    impl Actuator for FakeMotor {
        fn set_duty(&mut self, _duty: i16) -> Result<()> {
            Ok(())
        }

        fn coast(&mut self) -> Result<()> {
            Ok(())
        }

        fn brake(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn system() -> MotorSystem<FakeClock, FakeCounter, FakeMotor> {
        MotorSystem::new(FakeClock(0))
    }

    #[test]
    fn ports_outside_the_range_are_rejected() {
        let mut sys = system();
        assert_eq!(
            sys.attach(config::LAST_MOTOR_PORT + 1, FakeCounter, FakeMotor),
            Err(Error::InvalidPort)
        );
        assert_eq!(sys.state(config::LAST_MOTOR_PORT + 1), Err(Error::InvalidPort));
    }

    #[test]
    fn unattached_ports_report_invalid_port() {
        let sys = system();
        assert_eq!(sys.state(0), Err(Error::InvalidPort));
    }

    #[test]
    fn double_attach_is_busy() {
        let mut sys = system();
        sys.attach(0, FakeCounter, FakeMotor).unwrap();
        assert_eq!(sys.attach(0, FakeCounter, FakeMotor), Err(Error::Busy));
        sys.detach(0).unwrap();
        sys.attach(0, FakeCounter, FakeMotor).unwrap();
    }

    #[test]
    fn attached_port_answers_queries() {
        let mut sys = system();
        sys.attach(2, FakeCounter, FakeMotor).unwrap();
        assert_eq!(sys.state(2).unwrap(), State::Coasting);
        assert!(sys.is_done(2).unwrap());
        assert!(sys.is_stalled(2).unwrap().is_empty());
        sys.tick_all().unwrap();
    }
}
