//! Physical serial line ownership.
//!
//! [`Transport`] owns one open line and a small receive buffer. It is built on
//! the worker thread by the queue's init closure and never leaves it. The line
//! itself sits behind two seams so the engine can run against real ports or
//! the in-memory [`mock`] line:
//!
//! - [`SerialLine`]: an open port (non-blocking byte count, read, write,
//!   parity switch, buffer discard)
//! - [`LineOpener`]: opens lines by port name and lists available ports

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

use crate::error::{LinkError, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Parity of the line, including the sticky modes used for 9-bit addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineParity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always 1 (marks an address byte).
    Mark,
    /// Parity bit always 0 (payload bytes).
    Space,
}

/// Line parameters supplied by the device profile.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSettings {
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: u8,
    /// Stop bits per character.
    pub stop_bits: u8,
    /// Parity used outside of 9-bit address framing.
    pub parity: LineParity,
    /// Read timeout used for line replies.
    pub read_timeout: Duration,
    /// Write timeout.
    pub write_timeout: Duration,
    /// Sleep before discarding buffers in [`Transport::flush`].
    pub settle_time: Duration,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 57600,
            data_bits: 8,
            stop_bits: 1,
            parity: LineParity::None,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(100),
            settle_time: Duration::from_millis(100),
        }
    }
}

impl LineSettings {
    /// Character throughput of the line.
    pub fn bytes_per_second(&self) -> f64 {
        let parity_bits = if self.parity == LineParity::None { 0.0 } else { 1.0 };
        let bits = 1.0 + f64::from(self.data_bits) + f64::from(self.stop_bits) + parity_bits;
        f64::from(self.baud_rate) / bits
    }
}

/// An open serial port.
pub trait SerialLine: Send {
    /// Write every byte or fail.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Bytes waiting in the receive buffer. Never blocks.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` bytes that are already available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard both input and output buffers.
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Switch parity for subsequent writes.
    fn set_parity(&mut self, parity: LineParity) -> io::Result<()>;

    /// Set the driver-level timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Opens serial lines by port name.
pub trait LineOpener: Send + Sync {
    /// Open `port` with `settings`.
    fn open(&self, port: &str, settings: &LineSettings) -> io::Result<Box<dyn SerialLine>>;

    /// Names of ports present on the system.
    fn available_ports(&self) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Opener used when the crate is built without `instrument_serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOpener;

impl LineOpener for UnavailableOpener {
    fn open(&self, _port: &str, _settings: &LineSettings) -> io::Result<Box<dyn SerialLine>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial support not enabled, rebuild with --features instrument_serial",
        ))
    }
}

/// Opener for the ports of this machine.
pub fn system_opener() -> Arc<dyn LineOpener> {
    #[cfg(feature = "instrument_serial")]
    {
        Arc::new(serial::SystemOpener)
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        Arc::new(UnavailableOpener)
    }
}

/// Owner of one physical line. Lives on the worker thread only.
pub struct Transport {
    opener: Arc<dyn LineOpener>,
    settings: LineSettings,
    read_timeout: Duration,
    line: Option<Box<dyn SerialLine>>,
    port: Option<String>,
    rx: Vec<u8>,
}

impl Transport {
    /// Create a closed transport.
    pub fn new(opener: Arc<dyn LineOpener>, settings: LineSettings) -> Self {
        Self {
            opener,
            read_timeout: settings.read_timeout,
            settings,
            line: None,
            port: None,
            rx: Vec::new(),
        }
    }

    /// Line settings this transport opens ports with.
    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }

    /// Check if a port is open.
    pub fn is_open(&self) -> bool {
        self.line.is_some()
    }

    /// Name of the open port.
    pub fn port_name(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Ports the opener can see.
    pub fn available_ports(&self) -> Result<Vec<String>> {
        self.opener
            .available_ports()
            .map_err(|e| LinkError::io("listing serial ports", e))
    }

    /// Open `port`, closing any port open before.
    pub fn connect(&mut self, port: &str) -> Result<()> {
        self.disconnect();
        let line = self
            .opener
            .open(port, &self.settings)
            .map_err(|e| LinkError::PortUnavailable {
                port: port.to_string(),
                message: e.to_string(),
            })?;
        self.line = Some(line);
        self.port = Some(port.to_string());
        self.read_timeout = self.settings.read_timeout;
        info!(port, baud = self.settings.baud_rate, "Serial port opened");
        Ok(())
    }

    /// Close the port. A closed transport stays closed.
    pub fn disconnect(&mut self) {
        if self.line.take().is_some() {
            info!(port = self.port.as_deref().unwrap_or(""), "Serial port closed");
        }
        self.port = None;
        self.rx.clear();
    }

    fn line(&mut self) -> Result<&mut Box<dyn SerialLine>> {
        self.line.as_mut().ok_or(LinkError::NotConnected)
    }

    /// Sleep for the settle time, then discard everything buffered.
    pub fn flush(&mut self) -> Result<()> {
        let settle = self.settings.settle_time;
        self.line()?;
        std::thread::sleep(settle);
        let discarded = self.rx.len();
        self.rx.clear();
        self.line()?
            .clear_buffers()
            .map_err(|e| LinkError::io("discarding serial buffers", e))?;
        debug!(discarded, "Serial buffers flushed");
        Ok(())
    }

    /// Timeout applied to line replies.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Change the timeout applied to line replies.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.read_timeout = timeout;
        if let Some(line) = self.line.as_mut() {
            line.set_timeout(timeout)
                .map_err(|e| LinkError::io("setting read timeout", e))?;
        }
        Ok(())
    }

    /// Switch parity for the following writes.
    pub fn set_parity(&mut self, parity: LineParity) -> Result<()> {
        self.line()?
            .set_parity(parity)
            .map_err(|e| LinkError::io("switching parity", e))
    }

    /// Write raw bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(bytes = %String::from_utf8_lossy(bytes).escape_default(), "Serial write");
        self.line()?
            .write_all(bytes)
            .map_err(|e| LinkError::io("writing to serial port", e))
    }

    /// Bytes available without blocking, including buffered leftovers.
    pub fn bytes_to_read(&mut self) -> Result<usize> {
        let buffered = self.rx.len();
        let waiting = self
            .line()?
            .bytes_to_read()
            .map_err(|e| LinkError::io("polling serial port", e))?;
        Ok(buffered + waiting)
    }

    /// Read available bytes into `buf`, leftovers first.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let from_rx = self.rx.len().min(buf.len());
        buf[..from_rx].copy_from_slice(&self.rx[..from_rx]);
        self.rx.drain(..from_rx);
        if from_rx == buf.len() {
            return Ok(from_rx);
        }
        let read = self
            .line()?
            .read(&mut buf[from_rx..])
            .map_err(|e| LinkError::io("reading from serial port", e))?;
        Ok(from_rx + read)
    }

    /// Pull available bytes and return one complete line if present.
    ///
    /// The terminator is stripped; bytes after it stay buffered.
    pub fn poll_line(&mut self, newline: &[u8]) -> Result<Option<Vec<u8>>> {
        let waiting = self
            .line()?
            .bytes_to_read()
            .map_err(|e| LinkError::io("polling serial port", e))?;
        if waiting > 0 {
            let mut chunk = vec![0u8; waiting];
            let read = self
                .line()?
                .read(&mut chunk)
                .map_err(|e| LinkError::io("reading from serial port", e))?;
            self.rx.extend_from_slice(&chunk[..read]);
        }
        Ok(take_line(&mut self.rx, newline))
    }

    /// Bytes buffered from a partial line.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }
}

fn take_line(rx: &mut Vec<u8>, newline: &[u8]) -> Option<Vec<u8>> {
    if newline.is_empty() {
        return None;
    }
    let end = rx.windows(newline.len()).position(|window| window == newline)?;
    let line = rx[..end].to_vec();
    rx.drain(..end + newline.len());
    Some(line)
}
