//! Capability traits for the hardware the core consumes.
//!
//! The control loop is written against these three small interfaces so
//! it can run unchanged on a hub, on a bench rig, or against host-side
//! mocks. Implementations live outside the core; reference adapters for
//! common parts are in [`crate::drivers`].

use crate::error::{Error, Result};

/// Monotonic microsecond time source.
pub trait Clock {
    /// Time since an arbitrary epoch. Must never decrease.
    fn now_us(&mut self) -> i64;
}

/// Raw incremental encoder counter.
///
/// Readings are signed and uncorrected; the tacho layer applies the
/// direction sign and offset. A driver whose device detaches
/// mid-operation reports [`Error::Canceled`]; transient bus failures
/// report [`Error::Io`]. Either moves the owning controller to the
/// errored state on the next tick.
pub trait Counter {
    /// Accumulated count.
    fn count(&mut self) -> Result<i32>;

    /// Count rate in counts per second.
    fn rate(&mut self) -> Result<i32>;

    /// Absolute count within one revolution, for counters with an
    /// absolute channel.
    fn abs_count(&mut self) -> Result<i32> {
        Err(Error::NotSupported)
    }
}

/// Motor drive output.
pub trait Actuator {
    /// Applies a drive command in `[-10000, 10000]` (0.01% duty
    /// resolution). Values outside the range are clamped.
    fn set_duty(&mut self, duty: i16) -> Result<()>;

    /// Lets the motor spin freely.
    fn coast(&mut self) -> Result<()>;

    /// Shorts the windings to resist motion.
    fn brake(&mut self) -> Result<()>;
}
