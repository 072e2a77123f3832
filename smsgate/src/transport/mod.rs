//! Byte-level access to the modem's serial line.
//!
//! Only the [`Dispatcher`](crate::dispatcher::Dispatcher) talks to a
//! [`Transport`]; everything else goes through it.

use std::io;

use tracing::trace;

use crate::config::TransportConfig;
use crate::error::Result;

pub mod pigpio;
pub mod serial;
pub mod simulated;

pub use pigpio::PigpioTransport;
pub use serial::SerialTransport;
pub use simulated::SimulatedModem;

pub use smsgate_logging::WIRE_TARGET as WIRE;

/// A half-duplex serial line to the modem.
pub trait Transport: Send {
    /// Blocks until every byte was transmitted.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Appends whatever is currently buffered to `buf` without blocking and
    /// returns how many bytes were appended.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    /// Drains and returns everything currently buffered. A following
    /// [`Transport::read_available`] yields nothing until the modem sends
    /// again.
    fn flush(&mut self) -> io::Result<Vec<u8>> {
        let mut discarded = Vec::new();
        while self.read_available(&mut discarded)? > 0 {}
        if !discarded.is_empty() {
            trace!(
                target: WIRE,
                bytes = %smsgate_logging::escape_wire(&discarded),
                hex = %hex::encode(&discarded),
                "flushed"
            );
        }
        Ok(discarded)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn flush(&mut self) -> io::Result<Vec<u8>> {
        (**self).flush()
    }
}

/// Opens the backend described by `config`.
///
/// For [`TransportConfig::Simulated`] a fresh [`SimulatedModem`] with stock
/// answers is returned.
pub fn open(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match config {
        TransportConfig::Pigpio {
            host,
            port,
            rx_pin,
            tx_pin,
            baud,
        } => Box::new(PigpioTransport::open(
            (host.as_str(), *port),
            *rx_pin,
            *tx_pin,
            *baud,
        )?),
        TransportConfig::Serial { device, baud } => {
            Box::new(SerialTransport::open(device, *baud)?)
        }
        TransportConfig::Simulated => Box::new(SimulatedModem::new()),
    };
    Ok(transport)
}
