//! Bit-banged serial through the pigpio daemon's socket interface.
//!
//! Every request is four little-endian `u32`s (`cmd`, `p1`, `p2`, `p3`),
//! followed by `p3` extension bytes for extended commands. Every reply is
//! four `u32`s as well, the last one being the signed result. `SLR` replies
//! carry `result` data bytes after the header.

use std::io::{self, Read as _, Write as _};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{Transport, WIRE};
use crate::error::{ModemError, Result};

const MODES: u32 = 0;
const WVCLR: u32 = 27;
const WVAS: u32 = 29;
const WVBSY: u32 = 32;
const SLRO: u32 = 42;
const SLR: u32 = 43;
const SLRC: u32 = 44;
const WVCRE: u32 = 49;
const WVDEL: u32 = 50;
const WVTX: u32 = 51;

const MODE_INPUT: u32 = 0;
const MODE_OUTPUT: u32 = 1;

const DATA_BITS: u32 = 8;
/// Stop bits are counted in half bits.
const STOP_HALF_BITS: u32 = 2;
/// Bytes per transmitted waveform, keeps each wave well below the daemon's
/// pulse limit.
const WAVE_CHUNK: usize = 256;
const READ_CHUNK: u32 = 8192;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PigpioTransport {
    stream: TcpStream,
    rx_pin: u32,
    tx_pin: u32,
    baud: u32,
}

impl PigpioTransport {
    /// Connects to the daemon, configures both pins and opens the bit-bang
    /// reader on `rx_pin`.
    pub fn open(
        addr: impl ToSocketAddrs,
        rx_pin: u32,
        tx_pin: u32,
        baud: u32,
    ) -> Result<Self> {
        let stream = connect(addr).map_err(|e| {
            ModemError::TransportUnavailable(format!(
                "pigpio daemon not reachable, is pigpiod running? {e}"
            ))
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.set_nodelay(true)?;

        let mut transport = Self {
            stream,
            rx_pin,
            tx_pin,
            baud,
        };
        transport.command(MODES, rx_pin, MODE_INPUT, &[])?;
        transport.command(MODES, tx_pin, MODE_OUTPUT, &[])?;
        // A previous run may have left the reader open.
        if transport.command(SLRC, rx_pin, 0, &[]).is_ok() {
            debug!(rx_pin, "closed stale bit-bang reader");
        }
        transport.command(SLRO, rx_pin, baud, &DATA_BITS.to_le_bytes())?;
        debug!(rx_pin, tx_pin, baud, "opened bit-bang serial");

        Ok(transport)
    }

    fn send_request(&mut self, cmd: u32, p1: u32, p2: u32, ext: &[u8]) -> io::Result<()> {
        let ext_len = u32::try_from(ext.len())
            .map_err(|_| io::Error::other("pigpio extension too long"))?;
        let mut frame = Vec::with_capacity(16 + ext.len());
        for word in [cmd, p1, p2, ext_len] {
            frame.extend_from_slice(&word.to_le_bytes());
        }
        frame.extend_from_slice(ext);
        self.stream.write_all(&frame)
    }

    fn read_result(&mut self, cmd: u32) -> io::Result<i32> {
        let mut reply = [0u8; 16];
        self.stream.read_exact(&mut reply)?;
        let result = i32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]);
        if result < 0 {
            return Err(io::Error::other(format!(
                "pigpio command {cmd} failed with code {result}"
            )));
        }
        Ok(result)
    }

    fn command(&mut self, cmd: u32, p1: u32, p2: u32, ext: &[u8]) -> io::Result<i32> {
        self.send_request(cmd, p1, p2, ext)?;
        self.read_result(cmd)
    }

    fn transmit_wave(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.command(WVCLR, 0, 0, &[])?;

        let mut ext = Vec::with_capacity(12 + chunk.len());
        ext.extend_from_slice(&DATA_BITS.to_le_bytes());
        ext.extend_from_slice(&STOP_HALF_BITS.to_le_bytes());
        ext.extend_from_slice(&0u32.to_le_bytes());
        ext.extend_from_slice(chunk);
        self.command(WVAS, self.tx_pin, self.baud, &ext)?;

        let wave_id = self.command(WVCRE, 0, 0, &[])?;
        let wave_id = wave_id as u32;
        self.command(WVTX, wave_id, 0, &[])?;

        // 10 bits per byte on the wire, plus slack for the daemon.
        let airtime = Duration::from_micros(
            chunk.len() as u64 * 10 * 1_000_000 / u64::from(self.baud.max(1)),
        );
        let deadline = Instant::now() + airtime + IO_TIMEOUT;
        while self.command(WVBSY, 0, 0, &[])? == 1 {
            if Instant::now() >= deadline {
                warn!(wave_id, "wave still busy past its airtime");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.command(WVDEL, wave_id, 0, &[])?;
        Ok(())
    }
}

fn connect(addr: impl ToSocketAddrs) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
    }))
}

impl Transport for PigpioTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        trace!(
            target: WIRE,
            bytes = %smsgate_logging::escape_wire(bytes),
            hex = %hex::encode(bytes),
            "tx"
        );
        for chunk in bytes.chunks(WAVE_CHUNK) {
            self.transmit_wave(chunk)?;
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.send_request(SLR, self.rx_pin, READ_CHUNK, &[])?;
        let count = self.read_result(SLR)? as usize;
        if count == 0 {
            return Ok(0);
        }
        let start = buf.len();
        buf.resize(start + count, 0);
        if let Err(e) = self.stream.read_exact(&mut buf[start..]) {
            buf.truncate(start);
            return Err(e);
        }
        trace!(
            target: WIRE,
            bytes = %smsgate_logging::escape_wire(&buf[start..]),
            hex = %hex::encode(&buf[start..]),
            "rx"
        );
        Ok(count)
    }
}

impl Drop for PigpioTransport {
    fn drop(&mut self) {
        if let Err(e) = self.command(SLRC, self.rx_pin, 0, &[]) {
            warn!("failed to close bit-bang reader on gpio {}: {e}", self.rx_pin);
        }
    }
}
