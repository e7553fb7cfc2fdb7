use std::time::Duration;

use crate::error::Result;

/// Byte transport to the bus device, exclusively owned by the bus thread.
///
/// Implementations map an elapsed timeout to [`Error::DeviceTimeout`] and
/// any device failure to [`Error::DeviceIo`]. The engine never blocks
/// anywhere else.
///
/// [`Error::DeviceTimeout`]: crate::error::Error::DeviceTimeout
/// [`Error::DeviceIo`]: crate::error::Error::DeviceIo
pub trait Transport: Send {
    /// Blocks until one symbol arrives or `timeout` elapses.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8>;

    /// Writes one symbol. The bus is a wired-OR half duplex, so every
    /// written symbol is also observed by a subsequent read.
    fn write_byte(&mut self, byte: u8) -> Result<()>;
}
