use core::fmt;

/// Errors reported by the control core and the device traits it consumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Port number outside the configured motor port range, or no motor
    /// is attached to the port.
    InvalidPort,
    /// A command or setup argument failed validation. Never produced by
    /// a control tick.
    InvalidArg,
    /// The requested capability is absent. Only produced by counters
    /// without an absolute channel; handled internally during setup.
    NotSupported,
    /// Counter or motor hardware failure.
    Io,
    /// The operation conflicts with the current state of the port, such
    /// as attaching to an occupied slot or re-gearing a running axis.
    Busy,
    /// The underlying device went away mid-operation.
    Canceled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidPort => "invalid motor port",
            Error::InvalidArg => "invalid argument",
            Error::NotSupported => "not supported",
            Error::Io => "hardware I/O failure",
            Error::Busy => "port is busy",
            Error::Canceled => "operation canceled",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
