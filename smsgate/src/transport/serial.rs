use std::io::{self, Read as _, Write as _};
use std::path::Path;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, trace};

use super::{Transport, WIRE};
use crate::error::{ModemError, Result};

/// A modem on a hardware UART.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Opens the specified serial device.
    pub fn open(device: &Path, baud: u32) -> Result<Self> {
        let path = device.to_string_lossy();
        let port = serialport::new(path.as_ref(), baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| {
                ModemError::TransportUnavailable(format!(
                    "failed to open serial port '{path}': {e}"
                ))
            })?;
        debug!(device = %path, baud, "opened serial port");

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        trace!(
            target: WIRE,
            bytes = %smsgate_logging::escape_wire(bytes),
            hex = %hex::encode(bytes),
            "tx"
        );
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let start = buf.len();
        buf.resize(start + pending, 0);
        let n = match self.port.read(&mut buf[start..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
            Err(e) => {
                buf.truncate(start);
                return Err(e);
            }
        };
        buf.truncate(start + n);
        if n > 0 {
            trace!(
                target: WIRE,
                bytes = %smsgate_logging::escape_wire(&buf[start..]),
                hex = %hex::encode(&buf[start..]),
                "rx"
            );
        }
        Ok(n)
    }
}
