use thiserror::Error;

/// Result alias using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The exhaustive set of failure kinds of the engine.
///
/// Codec errors surface to the immediate caller; bus errors complete the
/// outstanding request with the specific kind and the engine recovers to
/// idle. `Empty` is a non-error sentinel for output consisting of ignored
/// fields only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid value list entry: {0}")]
    InvalidList(String),
    #[error("value out of range")]
    OutOfRange,
    #[error("field position out of range")]
    InvalidPos,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("CRC mismatch")]
    BadCrc,
    #[error("device read timed out")]
    DeviceTimeout,
    #[error("device I/O failed: {0}")]
    DeviceIo(String),
    #[error("bus arbitration lost")]
    BusArbitrationLost,
    #[error("sent byte not echoed")]
    BusTransmit,
    #[error("slave sent NAK")]
    SlaveNakReceived,
    #[error("request canceled")]
    Canceled,
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("empty result")]
    Empty,
}

impl Error {
    pub fn invalid_arg<T: Into<String>>(detail: T) -> Self {
        Error::InvalidArg(detail.into())
    }

    pub fn not_found<T: Into<String>>(detail: T) -> Self {
        Error::NotFound(detail.into())
    }

    /// Stable string code for JSON front-ends.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArg(_) => "invalid-arg",
            Error::NotFound(_) => "not-found",
            Error::InvalidList(_) => "invalid-list",
            Error::OutOfRange => "out-of-range",
            Error::InvalidPos => "invalid-pos",
            Error::InvalidEscape => "invalid-escape",
            Error::BadCrc => "bad-crc",
            Error::DeviceTimeout => "device-timeout",
            Error::DeviceIo(_) => "device-io",
            Error::BusArbitrationLost => "arbitration-lost",
            Error::BusTransmit => "transmit",
            Error::SlaveNakReceived => "nak",
            Error::Canceled => "canceled",
            Error::DuplicateName(_) => "duplicate-name",
            Error::Empty => "empty",
        }
    }

    /// Short kind name as used by the line interface (`ERR: <kind>: <detail>`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::InvalidArg(_) => "InvalidArg",
            Error::NotFound(_) => "NotFound",
            Error::InvalidList(_) => "InvalidList",
            Error::OutOfRange => "OutOfRange",
            Error::InvalidPos => "InvalidPos",
            Error::InvalidEscape => "InvalidEscape",
            Error::BadCrc => "BadCrc",
            Error::DeviceTimeout => "DeviceTimeout",
            Error::DeviceIo(_) => "DeviceIO",
            Error::BusArbitrationLost => "BusArbitrationLost",
            Error::BusTransmit => "BusTransmit",
            Error::SlaveNakReceived => "SlaveNakReceived",
            Error::Canceled => "Canceled",
            Error::DuplicateName(_) => "DuplicateName",
            Error::Empty => "Empty",
        }
    }

    /// True for kinds that complete a bus request rather than a codec call.
    pub fn is_bus_error(&self) -> bool {
        matches!(
            self,
            Error::DeviceTimeout
                | Error::DeviceIo(_)
                | Error::BusArbitrationLost
                | Error::BusTransmit
                | Error::SlaveNakReceived
                | Error::BadCrc
        )
    }
}
