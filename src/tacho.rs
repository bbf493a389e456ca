//! Signed, offset-corrected view of a raw encoder counter.
//!
//! One `Tacho` exists per motor port. It fixes the positive rotation
//! direction, folds the gear train into a counts-per-degree scale, and
//! maintains the offset that explicit resets manipulate. Reported
//! values follow `count = raw * sign(direction) - offset`; angles are
//! the fix16 division of counts by counts-per-degree.

use crate::config;
use crate::devices::Counter;
use crate::error::{Error, Result};
use crate::math::{self, Fix16, FIX16_ZERO};

/// Positive rotation direction of a motor shaft, viewed from the shaft
/// end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Clockwise,
    /// Negates raw counts and rates at the tacho boundary.
    Counterclockwise,
}

pub struct Tacho<C> {
    direction: Direction,
    offset: i32,
    counts_per_degree: Fix16,
    counter: C,
}

impl<C: Counter> Tacho<C> {
    /// Wraps a counter with identity direction and gearing. Call
    /// [`setup`](Self::setup) before use.
    pub fn new(counter: C) -> Self {
        Self {
            direction: Direction::Clockwise,
            offset: 0,
            counts_per_degree: config::COUNTS_PER_DEGREE,
            counter,
        }
    }

    /// Configures direction and gearing. Direction and ratio are fixed
    /// until the next setup.
    ///
    /// With `reset_angle`, the count is re-based on the counter's
    /// absolute channel, falling back to a zero reset when the counter
    /// has none. Without it, one test read still runs so a missing
    /// device is caught here rather than mid-maneuver.
    pub fn setup(
        &mut self,
        direction: Direction,
        gear_ratio: Fix16,
        reset_angle: bool,
    ) -> Result<()> {
        if gear_ratio < FIX16_ZERO {
            return Err(Error::InvalidArg);
        }
        self.counts_per_degree = math::mul(config::COUNTS_PER_DEGREE, gear_ratio);
        self.direction = direction;

        if !reset_angle {
            self.count()?;
            return Ok(());
        }
        match self.reset_count_to_abs() {
            Err(Error::NotSupported) => self.reset_count(0),
            other => other.map(|_| ()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn counts_per_degree(&self) -> Fix16 {
        self.counts_per_degree
    }

    /// Direction-corrected count with the reset offset subtracted.
    /// Counter wrap is absorbed by two's-complement arithmetic.
    pub fn count(&mut self) -> Result<i32> {
        let raw = self.counter.count()?;
        let signed = match self.direction {
            Direction::Clockwise => raw,
            Direction::Counterclockwise => raw.wrapping_neg(),
        };
        Ok(signed.wrapping_sub(self.offset))
    }

    /// Direction-corrected rate in counts per second.
    pub fn rate(&mut self) -> Result<i32> {
        let raw = self.counter.rate()?;
        Ok(match self.direction {
            Direction::Clockwise => raw,
            Direction::Counterclockwise => raw.wrapping_neg(),
        })
    }

    /// Shaft angle in degrees.
    pub fn angle(&mut self) -> Result<i32> {
        let count = self.count()?;
        Ok(math::div_i32(count, self.counts_per_degree))
    }

    /// Shaft rate in degrees per second.
    pub fn angular_rate(&mut self) -> Result<i32> {
        let rate = self.rate()?;
        Ok(math::div_i32(rate, self.counts_per_degree))
    }

    /// Rebases the offset so the next [`count`](Self::count) reads
    /// `new_count`, give or take encoder motion between the two calls.
    pub fn reset_count(&mut self, new_count: i32) -> Result<()> {
        // new_offset = count + old_offset - new_count, using a fresh
        // read so the rebase applies to the current shaft position.
        let count = self.count()?;
        self.offset = count.wrapping_add(self.offset).wrapping_sub(new_count);
        Ok(())
    }

    fn reset_count_to_abs(&mut self) -> Result<i32> {
        let raw = self.counter.abs_count()?;
        let abs = match self.direction {
            Direction::Clockwise => raw,
            Direction::Counterclockwise => raw.wrapping_neg(),
        };
        self.reset_count(abs)?;
        Ok(abs)
    }

    /// Rebases the angle. With `to_abs`, the counter's absolute channel
    /// supplies the new position and the resulting angle is returned;
    /// otherwise `new_angle` is converted to counts and applied.
    pub fn reset_angle(&mut self, new_angle: i32, to_abs: bool) -> Result<i32> {
        if to_abs {
            let abs = self.reset_count_to_abs()?;
            Ok(math::div_i32(abs, self.counts_per_degree))
        } else {
            self.reset_count(math::mul_i32(new_angle, self.counts_per_degree))?;
            Ok(new_angle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::FIX16_ONE;

    struct FakeCounter {
        count: i32,
        rate: i32,
        abs: Option<i32>,
    }

    impl FakeCounter {
        fn new() -> Self {
            Self {
                count: 0,
                rate: 0,
                abs: None,
            }
        }
    }

    impl Counter for FakeCounter {
        fn count(&mut self) -> Result<i32> {
            Ok(self.count)
        }

        fn rate(&mut self) -> Result<i32> {
            Ok(self.rate)
        }

        fn abs_count(&mut self) -> Result<i32> {
            self.abs.ok_or(Error::NotSupported)
        }
    }

    #[test]
    fn identity_tacho_reports_raw_counts_and_degrees() {
        // Scenario: direction CW, 1:1 gearing, two counts per degree.
        let mut tacho = Tacho::new(FakeCounter::new());
        tacho.setup(Direction::Clockwise, FIX16_ONE, true).unwrap();

        tacho.counter.count = 720;
        tacho.counter.rate = 360;
        assert_eq!(tacho.count().unwrap(), 720);
        assert_eq!(tacho.rate().unwrap(), 360);
        assert_eq!(tacho.angle().unwrap(), 360);
        assert_eq!(tacho.angular_rate().unwrap(), 180);
    }

    #[test]
    fn counterclockwise_negates_counts_and_rates() {
        let mut tacho = Tacho::new(FakeCounter::new());
        tacho
            .setup(Direction::Counterclockwise, FIX16_ONE, true)
            .unwrap();

        tacho.counter.count = 720;
        tacho.counter.rate = 360;
        assert_eq!(tacho.count().unwrap(), -720);
        assert_eq!(tacho.rate().unwrap(), -360);
        assert_eq!(tacho.angle().unwrap(), -360);
    }

    #[test]
    fn negative_gear_ratio_is_rejected() {
        let mut tacho = Tacho::new(FakeCounter::new());
        let err = tacho
            .setup(Direction::Clockwise, Fix16::from_num(-1), false)
            .unwrap_err();
        assert_eq!(err, Error::InvalidArg);
    }

    #[test]
    fn reset_count_round_trips() {
        let mut tacho = Tacho::new(FakeCounter::new());
        tacho.setup(Direction::Clockwise, FIX16_ONE, true).unwrap();

        tacho.counter.count = 1234;
        tacho.reset_count(17).unwrap();
        assert_eq!(tacho.count().unwrap(), 17);

        // Offset survives further motion.
        tacho.counter.count += 100;
        assert_eq!(tacho.count().unwrap(), 117);

        tacho.reset_count(-5).unwrap();
        assert_eq!(tacho.count().unwrap(), -5);
    }

    #[test]
    fn reset_angle_without_abs_channel() {
        let mut tacho = Tacho::new(FakeCounter::new());
        tacho.setup(Direction::Clockwise, FIX16_ONE, true).unwrap();

        tacho.counter.count = 1000;
        assert_eq!(tacho.reset_angle(90, false).unwrap(), 90);
        // 90 deg at 2 counts/deg.
        assert_eq!(tacho.count().unwrap(), 180);
        assert_eq!(tacho.angle().unwrap(), 90);
    }

    #[test]
    fn reset_angle_to_abs_uses_the_absolute_channel() {
        let mut tacho = Tacho::new(FakeCounter::new());
        tacho.counter.abs = Some(240);
        tacho.setup(Direction::Clockwise, FIX16_ONE, false).unwrap();

        tacho.counter.count = 9999;
        // 240 counts = 120 deg at 2 counts/deg.
        assert_eq!(tacho.reset_angle(0, true).unwrap(), 120);
        assert_eq!(tacho.count().unwrap(), 240);
    }

    #[test]
    fn setup_falls_back_to_zero_reset_without_abs_channel() {
        let mut tacho = Tacho::new(FakeCounter::new());
        tacho.counter.count = 555;
        tacho.setup(Direction::Clockwise, FIX16_ONE, true).unwrap();
        assert_eq!(tacho.count().unwrap(), 0);
    }

    #[test]
    fn direction_flip_round_trips_angle() {
        let mut cw = Tacho::new(FakeCounter::new());
        cw.setup(Direction::Clockwise, FIX16_ONE, true).unwrap();
        cw.counter.count = 721;

        let mut ccw = Tacho::new(FakeCounter::new());
        ccw.setup(Direction::Counterclockwise, FIX16_ONE, true)
            .unwrap();
        ccw.counter.count = 721;

        let a = cw.angle().unwrap();
        let b = ccw.angle().unwrap();
        assert!((a + b).abs() <= 1);
    }
}
