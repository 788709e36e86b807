//! Byte-level transport adapters for sensor links.
//!
//! A [`PortOpener`] turns a configured port name and baud rate into a [`ByteSource`].
//! The line reader only depends on these two traits, so the same acquisition code runs
//! against real serial ports ([`SerialPortOpener`]) and scripted or simulated devices
//! ([`MockPortOpener`]).

pub mod mock;
pub mod serial_adapter;

pub use mock::{MockPortOpener, ScriptedPort, SimulatedImu};
pub use serial_adapter::SerialPortOpener;

use crate::error::AppResult;
use std::io;

/// An open, readable device link.
///
/// Implementations must not block for longer than a short driver timeout: the caller
/// polls in a loop and handles idling itself.
pub trait ByteSource: Send {
    /// Reads whatever bytes are currently pending into `buf`.
    ///
    /// Returns `Ok(0)` when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drops any bytes buffered by the driver but not read yet.
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Port name used in log messages.
    fn name(&self) -> &str;
}

/// Opens device links by port name.
pub trait PortOpener: Send + Sync {
    /// Opens `port` at `baud_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Connection`](crate::error::DaqError::Connection) when the port
    /// does not exist or cannot be configured.
    fn open(&self, port: &str, baud_rate: u32) -> AppResult<Box<dyn ByteSource>>;
}
