//! `serialport`-backed lines.
//!
//! Most USB adapters cannot do sticky parity, so mark and space are emulated
//! byte by byte: each byte goes out with odd or even parity, picked so the
//! parity bit comes out as the wanted constant. Consecutive bytes that need
//! the same setting are written as one run, draining the output between
//! switches.

use crate::transport::{LineOpener, LineParity, LineSettings, SerialLine};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Opens ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl LineOpener for SystemOpener {
    fn open(&self, port: &str, settings: &LineSettings) -> io::Result<Box<dyn SerialLine>> {
        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = if settings.stop_bits >= 2 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let inner = serialport::new(port, settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(native_parity(settings.parity))
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout.max(settings.write_timeout))
            .open()?;
        debug!(port, baud = settings.baud_rate, "Opened system serial port");
        Ok(Box::new(SystemLine {
            inner,
            parity: settings.parity,
        }))
    }

    fn available_ports(&self) -> io::Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|info| info.port_name).collect())
    }
}

struct SystemLine {
    inner: Box<dyn SerialPort>,
    parity: LineParity,
}

fn native_parity(parity: LineParity) -> Parity {
    match parity {
        LineParity::Odd => Parity::Odd,
        LineParity::Even => Parity::Even,
        // Sticky modes are applied per byte at write time.
        LineParity::None | LineParity::Mark | LineParity::Space => Parity::None,
    }
}

/// Odd or even setting that yields the sticky parity bit for `byte`.
fn emulated_parity(byte: u8, mark: bool) -> Parity {
    let odd_ones = byte.count_ones() % 2 == 1;
    match (mark, odd_ones) {
        (true, false) | (false, true) => Parity::Odd,
        (true, true) | (false, false) => Parity::Even,
    }
}

impl SystemLine {
    fn write_sticky(&mut self, bytes: &[u8], mark: bool) -> io::Result<()> {
        let mut start = 0;
        while start < bytes.len() {
            let parity = emulated_parity(bytes[start], mark);
            let run = bytes[start..]
                .iter()
                .take_while(|b| emulated_parity(**b, mark) == parity)
                .count();
            self.inner.set_parity(parity)?;
            self.inner.write_all(&bytes[start..start + run])?;
            self.inner.flush()?;
            start += run;
        }
        Ok(())
    }
}

impl SerialLine for SystemLine {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.parity {
            LineParity::Mark => self.write_sticky(bytes, true),
            LineParity::Space => self.write_sticky(bytes, false),
            _ => {
                self.inner.write_all(bytes)?;
                self.inner.flush()
            }
        }
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.inner.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        Ok(self.inner.clear(ClearBuffer::All)?)
    }

    fn set_parity(&mut self, parity: LineParity) -> io::Result<()> {
        self.parity = parity;
        Ok(self.inner.set_parity(native_parity(parity))?)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        Ok(self.inner.set_timeout(timeout)?)
    }
}
