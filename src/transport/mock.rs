//! In-memory serial device for tests and dry runs.
//!
//! A [`MockDevice`] records every byte written to it and can answer through a
//! responder closure. The responder sees one frame at a time (bytes up to and
//! including the frame terminator, or one whole write when the terminator is
//! empty) and returns the bytes the device sends back.
//!
//! ```
//! use daq_link::transport::mock::MockDevice;
//!
//! let device = MockDevice::new().with_terminator("\n");
//! device.respond_with(|frame| (frame == b"*IDN?\n").then(|| b"MOCK,1\n".to_vec()));
//! assert!(!device.is_open());
//! ```

use crate::transport::{LineOpener, LineParity, LineSettings, SerialLine};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Computes the reply to one received frame. Runs with the device locked, so
/// it must not call back into the same [`MockDevice`].
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    terminator: Vec<u8>,
    responder: Option<Responder>,
    rx: VecDeque<u8>,
    written: Vec<u8>,
    partial: Vec<u8>,
    frames: Vec<Vec<u8>>,
    writes: Vec<(LineParity, Vec<u8>)>,
    parity: LineParity,
    ports: Vec<String>,
    opened: Vec<String>,
    open: bool,
    fail_open: bool,
    fail_io: bool,
    clears: usize,
    last_settings: Option<LineSettings>,
    timeout: Duration,
}

impl MockState {
    fn receive(&mut self, bytes: &[u8]) {
        self.written.extend_from_slice(bytes);
        self.writes.push((self.parity, bytes.to_vec()));

        if self.terminator.is_empty() {
            self.frames.push(bytes.to_vec());
            self.answer(bytes.to_vec());
            return;
        }

        self.partial.extend_from_slice(bytes);
        let terminator = self.terminator.clone();
        while let Some(end) = self
            .partial
            .windows(terminator.len())
            .position(|window| window == terminator.as_slice())
        {
            let frame: Vec<u8> = self.partial.drain(..end + terminator.len()).collect();
            self.frames.push(frame.clone());
            self.answer(frame);
        }
    }

    fn answer(&mut self, frame: Vec<u8>) {
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(&frame) {
                self.rx.extend(reply);
            }
        }
    }

    fn check_io(&self) -> io::Result<()> {
        if self.fail_io {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock line failure"));
        }
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock line closed"));
        }
        Ok(())
    }
}

/// Scriptable fake instrument shared between a test and the lines it opens.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Device answering nothing, framing on `"\r"`.
    pub fn new() -> Self {
        let device = Self::default();
        device.state.lock().terminator = b"\r".to_vec();
        device
    }

    /// Change the frame terminator the responder is driven by.
    pub fn with_terminator(self, terminator: &str) -> Self {
        self.state.lock().terminator = terminator.as_bytes().to_vec();
        self
    }

    /// Install the responder.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Make bytes available to the reader as if the device sent them.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    /// Make the next opens fail.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make every read and write fail.
    pub fn fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    /// Ports reported by the opener.
    pub fn set_ports(&self, ports: &[&str]) {
        self.state.lock().ports = ports.iter().map(|p| p.to_string()).collect();
    }

    /// Every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Written bytes as text.
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().written).into_owned()
    }

    /// Complete frames received so far, as text.
    pub fn frames(&self) -> Vec<String> {
        self.state
            .lock()
            .frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// Each write call with the parity in effect when it was made.
    pub fn writes(&self) -> Vec<(LineParity, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Forget everything recorded so far.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.written.clear();
        state.frames.clear();
        state.writes.clear();
        state.partial.clear();
    }

    /// Check if a line to this device is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Ports opened so far, in order.
    pub fn opened_ports(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    /// Number of buffer discards.
    pub fn clear_count(&self) -> usize {
        self.state.lock().clears
    }

    /// Settings of the most recent open.
    pub fn last_settings(&self) -> Option<LineSettings> {
        self.state.lock().last_settings.clone()
    }

    /// Last driver timeout set on the line.
    pub fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    /// Opener handing out lines to this device.
    pub fn opener(&self) -> Arc<dyn LineOpener> {
        Arc::new(MockOpener {
            device: self.clone(),
        })
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockDevice")
            .field("open", &state.open)
            .field("written", &state.written.len())
            .field("pending_rx", &state.rx.len())
            .finish()
    }
}

/// [`LineOpener`] for a [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockOpener {
    device: MockDevice,
}

impl LineOpener for MockOpener {
    fn open(&self, port: &str, settings: &LineSettings) -> io::Result<Box<dyn SerialLine>> {
        let mut state = self.device.state.lock();
        if state.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock port {port} unavailable"),
            ));
        }
        state.open = true;
        state.opened.push(port.to_string());
        state.parity = settings.parity;
        state.timeout = settings.read_timeout;
        state.last_settings = Some(settings.clone());
        state.rx.clear();
        state.partial.clear();
        Ok(Box::new(MockLine {
            state: self.device.state.clone(),
        }))
    }

    fn available_ports(&self) -> io::Result<Vec<String>> {
        Ok(self.device.state.lock().ports.clone())
    }
}

struct MockLine {
    state: Arc<Mutex<MockState>>,
}

impl SerialLine for MockLine {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_io()?;
        state.receive(bytes);
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let state = self.state.lock();
        state.check_io()?;
        Ok(state.rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.check_io()?;
        let n = state.rx.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_io()?;
        state.rx.clear();
        state.partial.clear();
        state.clears += 1;
        Ok(())
    }

    fn set_parity(&mut self, parity: LineParity) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_io()?;
        state.parity = parity;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.state.lock().timeout = timeout;
        Ok(())
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        self.state.lock().open = false;
    }
}
