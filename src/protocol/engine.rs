//! Command/request engine over one serial line.
//!
//! A [`ProtocolEngine`] is a short-lived view built on the worker thread for
//! one transaction: it borrows the port context, the device profile and the
//! calling owner's shared state. Every public exchange:
//!
//! 1. marks the owner `BUSY` (cleared by a guard on every exit path)
//! 2. flushes the line first if the owner is in `ERROR`
//! 3. writes the frame, with the address byte under mark parity for 9-bit
//!    profiles
//! 4. reads the ACK, the reply line or the binary block
//! 5. records success (clears `ERROR`) or failure (sets `ERROR`, status text,
//!    error counter); aborts are neither
//!
//! Reads poll every [`POLL_INTERVAL`]. When the wait exceeds twice the
//! profile's basic timeout, each poll also watches the abort signal, so long
//! waits stay cancellable while short exchanges just sleep.

use crate::abort::AbortSignal;
use crate::connection::shared::{ConnectionShared, PortContext};
use crate::connection::state::ConnectionState;
use crate::error::{LinkError, Result};
use crate::protocol::command::{BaseCommand, Command};
use crate::protocol::frame::{Args, Frame};
use crate::protocol::profile::{DeviceProfile, TransferMode, FLOW_CONTROL_CHARS};
use crate::transport::LineParity;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Poll slice of blocking reads.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct BusyGuard<'a>(&'a ConnectionShared);

impl<'a> BusyGuard<'a> {
    fn new(shared: &'a ConnectionShared) -> Self {
        shared.insert(ConnectionState::BUSY);
        Self(shared)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.remove(ConnectionState::BUSY);
    }
}

/// Protocol operations of one owner on its port.
pub struct ProtocolEngine<'a, P: DeviceProfile> {
    port: &'a mut PortContext,
    profile: &'a P,
    shared: &'a ConnectionShared,
}

impl<'a, P: DeviceProfile> ProtocolEngine<'a, P> {
    /// Build the engine for one transaction.
    pub fn new(port: &'a mut PortContext, profile: &'a P, shared: &'a ConnectionShared) -> Self {
        Self {
            port,
            profile,
            shared,
        }
    }

    /// Device profile.
    pub fn profile(&self) -> &P {
        self.profile
    }

    /// Calling owner's state.
    pub fn shared(&self) -> &ConnectionShared {
        self.shared
    }

    /// Port context.
    pub fn port(&mut self) -> &mut PortContext {
        &mut *self.port
    }

    fn abort_signal(&self) -> &AbortSignal {
        self.shared.abort_signal()
    }

    /// Check if the port is open.
    pub fn is_connected(&self) -> bool {
        self.port.is_open()
    }

    /// Name of the open port.
    pub fn port_name(&mut self) -> Option<String> {
        self.port.transport().port_name().map(str::to_string)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.port.is_open() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    fn settle<T>(&self, command: &str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.shared.record_success(),
            Err(e) if e.is_abort() => debug!(owner = %self.shared.label(), command, "Exchange aborted"),
            Err(e) => self.shared.record_failure(e),
        }
        result
    }

    // ---- port lifecycle ----

    /// Open `port`.
    ///
    /// A no-op when `port` is already open; another open port is
    /// disconnected first. Success sets every owner of the line to exactly
    /// `CONNECTED`; failure sets them to `DISCONNECTED`. Either way each owner
    /// gets one notification.
    pub fn connect(&mut self, port: &str) -> Result<()> {
        if self.port.transport().port_name() == Some(port) {
            return Ok(());
        }
        if self.port.is_open() {
            self.disconnect();
        }
        match self.port.transport().connect(port) {
            Ok(()) => {
                self.port.notify_connected();
                self.shared.set_status(format!("Connected to {port}"));
                Ok(())
            }
            Err(e) => {
                self.port.notify_disconnected();
                self.shared.set_status(e.to_string());
                Err(e)
            }
        }
    }

    /// Send the pre-disconnect command, ignoring its outcome, then close.
    /// Always ends with every owner `DISCONNECTED`.
    pub fn disconnect(&mut self) {
        if self.port.is_open() {
            if let Some(command) = self.profile.pre_disconnect() {
                if let Err(e) = self.quiet_command(command) {
                    debug!(owner = %self.shared.label(), "Pre-disconnect command failed: {e}");
                }
            }
        }
        self.port.close();
        self.shared.set_status("Disconnected");
    }

    fn quiet_command(&mut self, command: Command<P::Command>) -> Result<()> {
        if command == Command::Base(BaseCommand::Reset) {
            return self.reset_inner();
        }
        self.send(command, None, false)?;
        if self.profile.ack().is_some() {
            self.read_reply(command.name())?;
        }
        Ok(())
    }

    /// Flush, send the identification query and check the reply.
    ///
    /// On success every owner becomes `READY`. Returns the reply.
    pub fn initialize(&mut self) -> Result<String> {
        let _busy = BusyGuard::new(self.shared);
        let result = self.initialize_inner();
        let result = self.settle("Init", result)?;
        self.port.notify_initialized();
        info!(owner = %self.shared.label(), reply = %result, "Device identified");
        Ok(result)
    }

    fn initialize_inner(&mut self) -> Result<String> {
        self.ensure_connected()?;
        let baud_rate = self.profile.baud_rate();
        let reply = self.identify().map_err(|e| match e {
            e @ LinkError::Aborted { .. } => e,
            e => LinkError::InitializationFailed {
                baud_rate,
                source: Box::new(e),
            },
        })?;
        if !reply.contains(self.profile.identification()) {
            return Err(LinkError::Identification {
                expected: self.profile.identification().to_string(),
                reply,
                baud_rate,
            });
        }
        Ok(reply)
    }

    fn identify(&mut self) -> Result<String> {
        self.port.transport().flush()?;
        let init = Command::Base(BaseCommand::Init);
        match self.profile.transfer_mode() {
            TransferMode::Ascii => {
                self.send(init, None, false)?;
                self.read_reply(init.name())
            }
            TransferMode::Binary => {
                let mut byte = [0u8; 1];
                let timeout = self.profile.basic_timeout();
                self.send(init, None, false)?;
                self.read_exact(init.name(), &mut byte, timeout)?;
                Ok(String::from_utf8_lossy(&byte).into_owned())
            }
        }
    }

    /// Send the reset command with the shortened timeout.
    ///
    /// A timeout is taken as "already reset". Sleeps one basic timeout after.
    pub fn reset(&mut self) -> Result<()> {
        let _busy = BusyGuard::new(self.shared);
        let result = self.reset_inner();
        self.settle("Reset", result)
    }

    fn reset_inner(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let reset = Command::Base(BaseCommand::Reset);
        let result = self.with_short_timeout(|engine| {
            engine.send(reset, None, false)?;
            if engine.profile.ack().is_some() {
                let reply = engine.read_reply(reset.name())?;
                trace!(%reply, "Reset reply");
            }
            Ok(())
        });
        match result {
            Err(e) if e.is_timeout() => debug!(owner = %self.shared.label(), "Reset timed out, assuming reset"),
            other => other?,
        }
        std::thread::sleep(self.profile.basic_timeout());
        Ok(())
    }

    /// Send the device's abort command with the shortened timeout, then flush.
    pub fn abort_device(&mut self) -> Result<()> {
        let _busy = BusyGuard::new(self.shared);
        let result = self.abort_inner();
        self.settle("Abort", result)
    }

    fn abort_inner(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let abort = Command::Base(BaseCommand::Abort);
        self.with_short_timeout(|engine| {
            engine.send(abort, None, false)?;
            if engine.profile.ack().is_some() {
                engine.read_reply(abort.name())?;
            }
            engine.port.transport().flush()
        })
    }

    fn with_short_timeout<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let previous = self.port.transport().read_timeout();
        self.port.transport().set_read_timeout(self.profile.basic_timeout())?;
        let result = f(self);
        let restored = self.port.transport().set_read_timeout(previous);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Sleep for the settle time and discard buffered bytes.
    pub fn flush(&mut self) -> Result<()> {
        self.port.transport().flush()
    }

    // ---- exchanges ----

    /// Send a command without arguments.
    pub fn command(&mut self, command: impl Into<Command<P::Command>>) -> Result<()> {
        self.command_with(command, None)
    }

    /// Send a command and check the ACK if the profile expects one.
    pub fn command_with(
        &mut self,
        command: impl Into<Command<P::Command>>,
        args: Option<Args>,
    ) -> Result<()> {
        let command = command.into();
        let _busy = BusyGuard::new(self.shared);
        let result = self.command_inner(command, args.as_ref());
        self.settle(command.name(), result)
    }

    fn command_inner(&mut self, command: Command<P::Command>, args: Option<&Args>) -> Result<()> {
        self.prepare()?;
        self.send(command, args, false)?;
        let Some(ack) = self.profile.ack() else {
            return Ok(());
        };
        let reply = self.read_reply(command.name())?;
        if reply != ack {
            return Err(LinkError::Protocol {
                command: command.name().to_string(),
                args: args.map(Args::to_string),
                reply,
            });
        }
        Ok(())
    }

    /// Send a request without arguments and return the reply line.
    pub fn request(&mut self, command: impl Into<Command<P::Command>>) -> Result<String> {
        self.request_with(command, None)
    }

    /// Send a request in query form and return the reply line.
    pub fn request_with(
        &mut self,
        command: impl Into<Command<P::Command>>,
        args: Option<Args>,
    ) -> Result<String> {
        let timeout = self.port.transport().read_timeout();
        self.request_with_timeout(command, args, timeout)
    }

    /// Like [`request_with`](Self::request_with) but waiting up to `timeout`
    /// for the reply line instead of the line's read timeout.
    pub fn request_with_timeout(
        &mut self,
        command: impl Into<Command<P::Command>>,
        args: Option<Args>,
        timeout: Duration,
    ) -> Result<String> {
        let command = command.into();
        let _busy = BusyGuard::new(self.shared);
        let result = self.request_inner(command, args.as_ref(), timeout);
        self.settle(command.name(), result)
    }

    fn request_inner(
        &mut self,
        command: Command<P::Command>,
        args: Option<&Args>,
        timeout: Duration,
    ) -> Result<String> {
        self.prepare()?;
        self.send(command, args, true)?;
        self.read_reply_within(command.name(), timeout)
    }

    /// Send a command and read exactly `buf.len()` bytes within `timeout`
    /// (the basic timeout when `None`).
    pub fn request_bytes(
        &mut self,
        command: impl Into<Command<P::Command>>,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let command = command.into();
        let timeout = timeout.unwrap_or_else(|| self.profile.basic_timeout());
        let _busy = BusyGuard::new(self.shared);
        let result = self.request_bytes_inner(command, buf, timeout);
        self.settle(command.name(), result)
    }

    fn request_bytes_inner(
        &mut self,
        command: Command<P::Command>,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<()> {
        self.prepare()?;
        self.send(command, None, false)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.read_exact(command.name(), buf, timeout)
    }

    /// Send raw text with the `Custom` command.
    pub fn custom(&mut self, text: &str) -> Result<()> {
        self.command_with(BaseCommand::Custom, Some(Args::from(text)))
    }

    /// Send raw text with the `Custom` command and return the reply line.
    pub fn custom_request(&mut self, text: &str) -> Result<String> {
        self.request_with(BaseCommand::Custom, Some(Args::from(text)))
    }

    // ---- wire ----

    fn prepare(&mut self) -> Result<()> {
        self.ensure_connected()?;
        if self.shared.state().contains(ConnectionState::ERROR) {
            debug!(owner = %self.shared.label(), "Flushing after previous error");
            self.port.transport().flush()?;
        }
        Ok(())
    }

    fn send(&mut self, command: Command<P::Command>, args: Option<&Args>, query: bool) -> Result<()> {
        let frame = Frame::build(self.profile, command, args, query);
        debug!(
            owner = %self.shared.label(),
            command = command.name(),
            frame = %String::from_utf8_lossy(frame.payload()).escape_default(),
            "Sending frame"
        );
        let transport = self.port.transport();
        if let Some(address) = frame.address() {
            transport.set_parity(LineParity::Mark)?;
            transport.write(&[address])?;
            transport.set_parity(LineParity::Space)?;
        }
        transport.write(frame.payload())
    }

    /// Sleep one poll slice; watch the abort signal for long waits.
    fn wait_slice(&self, total: Duration, command: &str) -> Result<()> {
        if total > self.profile.basic_timeout().saturating_mul(2) {
            if self.abort_signal().wait_timeout(POLL_INTERVAL) {
                return Err(LinkError::Aborted {
                    command: command.to_string(),
                });
            }
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn read_reply(&mut self, command: &str) -> Result<String> {
        let timeout = self.port.transport().read_timeout();
        self.read_reply_within(command, timeout)
    }

    fn read_reply_within(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let terminator = self.profile.reply_terminator().as_bytes().to_vec();
        let start = Instant::now();
        loop {
            if let Some(line) = self.port.transport().poll_line(&terminator)? {
                let line = String::from_utf8_lossy(&line).into_owned();
                let line = if self.profile.trim_control_chars() {
                    line.trim_matches(FLOW_CONTROL_CHARS.as_slice()).to_string()
                } else {
                    line
                };
                trace!(command, reply = %line.escape_default(), "Reply line");
                return Ok(line);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LinkError::Timeout {
                    command: command.to_string(),
                    requested: 0,
                    received: self.port.transport().buffered(),
                    waited,
                });
            }
            self.wait_slice(timeout, command)?;
        }
    }

    fn read_exact(&mut self, command: &str, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let requested = buf.len();
        let start = Instant::now();
        let mut received = 0;
        while received < requested {
            let count = self.port.transport().bytes_to_read()?;
            if count > 0 {
                if received + count > requested {
                    return Err(LinkError::TooManyBytes {
                        command: command.to_string(),
                        requested,
                        received: received + count,
                    });
                }
                received += self.port.transport().read(&mut buf[received..received + count])?;
                if received == requested {
                    break;
                }
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LinkError::Timeout {
                    command: command.to_string(),
                    requested,
                    received,
                    waited,
                });
            }
            self.wait_slice(timeout, command)?;
        }
        debug!(command, requested, waited = ?start.elapsed(), "Binary reply complete");
        Ok(())
    }
}
