//! Reference device adapters for common motor driver hardware.
//!
//! The core only talks to the [`crate::devices`] traits; these adapters
//! bind them to parts a hub is typically built from: a TB6612FNG-style
//! H-bridge behind a PWM channel and two direction pins, and a hardware
//! quadrature decoder behind the `embedded-hal` `Qei` interface.
//!
//! Pin I/O is assumed infallible, as is usual for on-board GPIO.

use crate::config;
use crate::devices::{Actuator, Counter};
use crate::error::{Error, Result};
use crate::trajectory::US_PER_SECOND;
use embedded_hal::{digital::v2::OutputPin, Pwm, Qei};
use num::clamp;
use qei::QeiManager;

/// H-bridge motor output on one PWM channel with two direction
/// inputs.
///
/// The input pair encodes the bridge mode: one pin high selects a
/// drive direction, both high short the windings, both low float
/// them. Duty magnitude is scaled onto the PWM resolution.
pub struct HBridge<T: Pwm, P: OutputPin> {
    pwm: T,
    channel: T::Channel,
    in1: P,
    in2: P,
    max_duty: u32,
}

impl<T, P> HBridge<T, P>
where
    T: Pwm<Duty = u16>,
    T::Channel: Copy,
    P: OutputPin,
{
    /// Creates the driver. `ins` is `[in1, in2]`. The motor is left
    /// braked.
    pub fn new(mut pwm: T, channel: T::Channel, period: T::Time, ins: [P; 2]) -> Self {
        pwm.disable(channel);
        pwm.set_period(period);
        pwm.set_duty(channel, 0);
        pwm.enable(channel);
        let max_duty = pwm.get_max_duty() as u32;

        let [in1, in2] = ins;
        let mut bridge = Self {
            pwm,
            channel,
            in1,
            in2,
            max_duty,
        };
        bridge.latch_inputs(true, true);
        bridge
    }

    fn latch_inputs(&mut self, in1_high: bool, in2_high: bool) {
        if in1_high {
            self.in1.set_high().ok();
        } else {
            self.in1.set_low().ok();
        }
        if in2_high {
            self.in2.set_high().ok();
        } else {
            self.in2.set_low().ok();
        }
    }
}

impl<T, P> Actuator for HBridge<T, P>
where
    T: Pwm<Duty = u16>,
    T::Channel: Copy,
    P: OutputPin,
{
    fn set_duty(&mut self, duty: i16) -> Result<()> {
        let duty = clamp(duty as i32, -config::MAX_DUTY, config::MAX_DUTY);
        // The duty sign picks the driven input; zero asserts both,
        // which shorts the windings rather than floating them.
        self.latch_inputs(duty >= 0, duty <= 0);
        let scaled =
            (duty.unsigned_abs() as u64 * self.max_duty as u64 / config::MAX_DUTY as u64) as u16;
        self.pwm.set_duty(self.channel, scaled);
        Ok(())
    }

    fn coast(&mut self) -> Result<()> {
        self.latch_inputs(false, false);
        self.pwm.set_duty(self.channel, 0);
        Ok(())
    }

    fn brake(&mut self) -> Result<()> {
        self.latch_inputs(true, true);
        self.pwm.set_duty(self.channel, 0);
        Ok(())
    }
}

/// Incremental counter on a hardware quadrature decoder.
///
/// The decoder's 16-bit counter is extended to the full count range by
/// [`QeiManager`]; [`sample`](Self::sample) must run often enough that
/// the hardware counter cannot advance half its range between calls.
/// The rate is the windowed count difference between samples, so the
/// natural place to call `sample` is the control tick. There is no
/// absolute channel: `abs_count` reports [`Error::NotSupported`] and
/// setup falls back to a zero reset.
pub struct QuadratureCounter<Q: Qei<Count = u16>> {
    qei: QeiManager<Q>,
    window: Option<(i64, i64)>,
    rate: i32,
}

impl<Q: Qei<Count = u16>> QuadratureCounter<Q> {
    pub fn new(qei: Q) -> Self {
        Self {
            qei: QeiManager::new(qei),
            window: None,
            rate: 0,
        }
    }

    /// Folds hardware counter motion into the extended count and
    /// refreshes the rate estimate. The first call only establishes
    /// the measurement window.
    pub fn sample(&mut self, now: i64) -> Result<()> {
        self.qei.sample().map_err(|_| Error::Io)?;
        let count = self.qei.count();
        match self.window {
            Some((last_count, last_time)) if now > last_time => {
                self.rate = ((count - last_count) * US_PER_SECOND / (now - last_time)) as i32;
                self.window = Some((count, now));
            }
            Some(_) => {}
            None => self.window = Some((count, now)),
        }
        Ok(())
    }
}

impl<Q: Qei<Count = u16>> Counter for QuadratureCounter<Q> {
    fn count(&mut self) -> Result<i32> {
        self.qei.sample().map_err(|_| Error::Io)?;
        Ok(self.qei.count() as i32)
    }

    fn rate(&mut self) -> Result<i32> {
        Ok(self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PinState {
        Low,
        High,
    }

    struct FakePin(Rc<Cell<PinState>>);

    impl OutputPin for FakePin {
        type Error = core::convert::Infallible;

        fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
            self.0.set(PinState::Low);
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
            self.0.set(PinState::High);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePwmState {
        duty: Cell<u16>,
        enabled: Cell<bool>,
    }

    struct FakePwm(Rc<FakePwmState>);

    impl Pwm for FakePwm {
        type Channel = ();
        type Time = u32;
        type Duty = u16;

        fn disable(&mut self, _channel: ()) {
            self.0.enabled.set(false);
        }

        fn enable(&mut self, _channel: ()) {
            self.0.enabled.set(true);
        }

        fn get_period(&self) -> u32 {
            0
        }

        fn get_duty(&self, _channel: ()) -> u16 {
            self.0.duty.get()
        }

        fn get_max_duty(&self) -> u16 {
            1000
        }

        fn set_duty(&mut self, _channel: (), duty: u16) {
            self.0.duty.set(duty);
        }

        fn set_period<P>(&mut self, _period: P)
        where
            P: Into<u32>,
        {
        }
    }

    fn bridge() -> (
        HBridge<FakePwm, FakePin>,
        Rc<FakePwmState>,
        Rc<Cell<PinState>>,
        Rc<Cell<PinState>>,
    ) {
        let pwm_state = Rc::new(FakePwmState::default());
        let in1 = Rc::new(Cell::new(PinState::Low));
        let in2 = Rc::new(Cell::new(PinState::Low));
        let bridge = HBridge::new(
            FakePwm(pwm_state.clone()),
            (),
            1000u32,
            [FakePin(in1.clone()), FakePin(in2.clone())],
        );
        (bridge, pwm_state, in1, in2)
    }

    #[test]
    fn duty_sign_selects_the_pin_pair() {
        let (mut bridge, pwm, in1, in2) = bridge();
        assert!(pwm.enabled.get());

        bridge.set_duty(5_000).unwrap();
        assert_eq!((in1.get(), in2.get()), (PinState::High, PinState::Low));
        assert_eq!(pwm.duty.get(), 500);

        bridge.set_duty(-10_000).unwrap();
        assert_eq!((in1.get(), in2.get()), (PinState::Low, PinState::High));
        assert_eq!(pwm.duty.get(), 1000);

        bridge.set_duty(0).unwrap();
        assert_eq!((in1.get(), in2.get()), (PinState::High, PinState::High));
        assert_eq!(pwm.duty.get(), 0);
    }

    #[test]
    fn out_of_range_duty_is_clamped() {
        let (mut bridge, pwm, _, _) = bridge();
        bridge.set_duty(i16::MAX).unwrap();
        assert_eq!(pwm.duty.get(), 1000);
    }

    #[test]
    fn coast_floats_both_pins() {
        let (mut bridge, pwm, in1, in2) = bridge();
        bridge.set_duty(5_000).unwrap();
        bridge.coast().unwrap();
        assert_eq!((in1.get(), in2.get()), (PinState::Low, PinState::Low));
        assert_eq!(pwm.duty.get(), 0);
    }

    struct FakeQei(Rc<Cell<u16>>);

    impl Qei for FakeQei {
        type Count = u16;

        fn count(&self) -> u16 {
            self.0.get()
        }

        fn direction(&self) -> embedded_hal::Direction {
            embedded_hal::Direction::Upcounting
        }
    }

    #[test]
    fn quadrature_counter_tracks_motion_and_rate() {
        let hw = Rc::new(Cell::new(0u16));
        let mut counter = QuadratureCounter::new(FakeQei(hw.clone()));
        counter.sample(0).unwrap();

        hw.set(400);
        counter.sample(100_000).unwrap();
        assert_eq!(counter.count().unwrap(), 400);
        // 400 counts in 0.1 s.
        assert_eq!(counter.rate().unwrap(), 4000);

        assert_eq!(counter.abs_count().unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn quadrature_counter_survives_hardware_wraparound() {
        let hw = Rc::new(Cell::new(60_000u16));
        let mut counter = QuadratureCounter::new(FakeQei(hw.clone()));
        counter.sample(0).unwrap();
        let base = counter.count().unwrap();

        // Forward through the 16-bit wrap.
        hw.set(60_000u16.wrapping_add(10_000));
        counter.sample(5_000).unwrap();
        assert_eq!(counter.count().unwrap(), base + 10_000);
    }
}
