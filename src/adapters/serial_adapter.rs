//! Serial port adapter backed by the `serialport` crate.

use super::{ByteSource, PortOpener};
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::{ClearBuffer, SerialPort};
#[cfg(feature = "instrument_serial")]
use std::io::{self, Read};

/// Driver-level read timeout. Reads are sized to the pending byte count, so this only
/// bounds pathological drivers.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Opens RS-232 / USB-serial links (8N1, no flow control).
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl SerialPortOpener {
    /// Creates the opener.
    pub fn new() -> Self {
        Self
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, baud_rate: u32) -> AppResult<Box<dyn ByteSource>> {
        #[cfg(feature = "instrument_serial")]
        {
            let link = serialport::new(port, baud_rate)
                .timeout(READ_TIMEOUT)
                .open()
                .map_err(|e| DaqError::Connection {
                    port: port.to_string(),
                    message: e.to_string(),
                })?;

            tracing::debug!(port, baud_rate, "Serial port opened");
            Ok(Box::new(SerialSource {
                name: port.to_string(),
                port: link,
            }))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port, baud_rate, READ_TIMEOUT);
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }
}

/// An open serial port.
#[cfg(feature = "instrument_serial")]
struct SerialSource {
    name: String,
    port: Box<dyn SerialPort>,
}

#[cfg(feature = "instrument_serial")]
impl ByteSource for SerialSource {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let len = pending.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
