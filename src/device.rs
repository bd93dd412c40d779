//! Device front-end over a connection.
//!
//! A [`Device`] keeps the user-facing status of one instrument: a coarse
//! [`DeviceState`], a status message and a stream of [`DeviceStatus`]
//! notifications. Connect and disconnect are queued with `enqueue_unique`, so
//! repeated clicks do not pile up redundant attempts.

use crate::connection::{Connection, ConnectionEvent};
use crate::error::Result;
use crate::protocol::{DeviceProfile, ProtocolEngine};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

bitflags! {
    /// User-facing device state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceState: u32 {
        /// Not connected.
        const DISCONNECTED = 0x001;
        /// Connected and identified.
        const CONNECTED = 0x002;
        /// Connect in progress.
        const CONNECTING = 0x005;
        /// Last operation failed.
        const ERROR = 0x008;
        /// Disconnect in progress.
        const DISCONNECTING = 0x101;
    }
}

impl DeviceState {
    /// Connected and identified.
    pub fn is_connected(self) -> bool {
        self.contains(DeviceState::CONNECTED)
    }

    /// Last operation failed.
    pub fn has_error(self) -> bool {
        self.contains(DeviceState::ERROR)
    }
}

/// Status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    /// New message, if the change carried one.
    pub message: Option<String>,
    /// New state.
    pub state: DeviceState,
}

struct DeviceInner {
    name: String,
    state: AtomicU32,
    status: Mutex<String>,
    events: broadcast::Sender<DeviceStatus>,
}

impl DeviceInner {
    fn state(&self) -> DeviceState {
        DeviceState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn change(&self, message: Option<String>, state: DeviceState) {
        self.state.store(state.bits(), Ordering::Release);
        if let Some(message) = &message {
            if state.has_error() {
                warn!(device = %self.name, "{message}");
            } else {
                info!(device = %self.name, "{message}");
            }
            *self.status.lock() = message.clone();
        }
        let _ = self.events.send(DeviceStatus { message, state });
    }

    fn set_error(&self, message: String) {
        self.change(Some(message), self.state() | DeviceState::ERROR);
    }
}

/// Front-end of one instrument.
pub struct Device<P: DeviceProfile> {
    connection: Connection<P>,
    inner: Arc<DeviceInner>,
}

impl<P: DeviceProfile> Clone for Device<P> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<P: DeviceProfile> std::fmt::Debug for Device<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("status", &self.status())
            .finish()
    }
}

fn connect_and_identify<P: DeviceProfile>(
    engine: &mut ProtocolEngine<'_, P>,
    port: &str,
    opened: bool,
) -> Result<String> {
    if opened {
        engine.connect(port)?;
    }
    engine.initialize()
}

impl<P: DeviceProfile> Device<P> {
    /// Wrap a connection.
    pub fn new(connection: Connection<P>) -> Self {
        let (events, _) = broadcast::channel(32);
        let inner = Arc::new(DeviceInner {
            name: connection.profile().name().to_string(),
            state: AtomicU32::new(DeviceState::DISCONNECTED.bits()),
            status: Mutex::new(String::new()),
            events,
        });
        Self { connection, inner }
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection<P> {
        &self.connection
    }

    /// Current state. A port closed underneath the device reads as
    /// `DISCONNECTED`.
    pub fn state(&self) -> DeviceState {
        let state = self.inner.state();
        if state.is_connected() && !self.connection.is_connected() {
            DeviceState::DISCONNECTED | (state & DeviceState::ERROR)
        } else {
            state
        }
    }

    /// Last status message.
    pub fn status(&self) -> String {
        self.inner.status.lock().clone()
    }

    /// Connected and identified.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Last operation failed.
    pub fn has_error(&self) -> bool {
        self.state().has_error()
    }

    /// Subscribe to status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceStatus> {
        self.inner.events.subscribe()
    }

    /// Subscribe to the connection's notifications.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Queue a connect to `port` followed by identification.
    ///
    /// Returns `false` when already connected or when the same connect is
    /// already waiting. A port this call opened is closed again on failure.
    pub fn connect(&self, port: &str) -> bool {
        if self.is_connected() {
            return false;
        }
        let inner = self.inner.clone();
        let port = port.to_string();
        self.connection
            .enqueue_unique("connect", Some(port.clone()), move |engine| {
                inner.change(
                    Some(format!("Trying to connect to {port}")),
                    DeviceState::CONNECTING,
                );
                let opened = engine.port_name().as_deref() != Some(port.as_str());
                match connect_and_identify(engine, &port, opened) {
                    Ok(identification) => inner.change(
                        Some(format!("Connected to {port}: {identification}")),
                        DeviceState::CONNECTED,
                    ),
                    Err(e) => {
                        if opened {
                            engine.port().close();
                        }
                        inner.change(
                            Some(format!("Error connecting to {port}: {e}")),
                            DeviceState::DISCONNECTED | DeviceState::ERROR,
                        );
                    }
                }
            })
    }

    /// Queue a disconnect. Returns `false` when not connected or when a
    /// disconnect is already waiting.
    pub fn disconnect(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let inner = self.inner.clone();
        self.connection.enqueue_unique("disconnect", None, move |engine| {
            inner.change(None, DeviceState::DISCONNECTING);
            engine.disconnect();
            inner.change(
                Some("Disconnected, controller reset".to_string()),
                DeviceState::DISCONNECTED,
            );
        })
    }

    /// Run `op` on the worker and record its outcome in the status.
    ///
    /// Aborts are reported without setting `ERROR`.
    pub fn execute<F, R>(&self, label: &str, op: F) -> Result<R>
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let result = self.connection.run(op);
        match &result {
            Ok(_) => {
                let state = self.inner.state();
                if state.has_error() {
                    self.inner.change(None, state - DeviceState::ERROR);
                }
            }
            Err(e) if e.is_abort() => {
                self.inner
                    .change(Some(format!("{label} aborted")), self.inner.state());
            }
            Err(e) => self.inner.set_error(format!("{label} failed: {e}")),
        }
        result
    }

    /// Raise the abort signal.
    pub fn abort(&self) {
        self.connection.abort();
    }

    /// Clear the abort signal.
    pub fn clear_abort(&self) {
        self.connection.clear_abort();
    }

    /// Block until the queue is idle.
    ///
    /// Fails with `Aborted` when the abort signal is raised first and with
    /// `Timeout` when the device does not go idle in time.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<()> {
        self.connection.wait_for_idle(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConnectionManager;
    use crate::protocol::{CommandTable, NoDeviceCommands};
    use crate::transport::mock::MockDevice;

    struct Meter {
        table: CommandTable<NoDeviceCommands>,
    }

    impl DeviceProfile for Meter {
        type Command = NoDeviceCommands;

        fn name(&self) -> &str {
            "meter"
        }

        fn table(&self) -> &CommandTable<NoDeviceCommands> {
            &self.table
        }

        fn identification(&self) -> &str {
            "METER"
        }

        fn basic_timeout(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn ack(&self) -> Option<&str> {
            None
        }
    }

    fn meter(manager: &ConnectionManager) -> Device<Meter> {
        let connection = manager
            .open(
                Meter {
                    table: CommandTable::base(),
                },
                None,
            )
            .unwrap();
        Device::new(connection)
    }

    #[test]
    fn connect_identifies_and_disconnect_resets() {
        let mock = MockDevice::new();
        mock.respond_with(|frame| (frame == b"*IDN?\r").then(|| b"ACME METER 7\r".to_vec()));
        let manager = ConnectionManager::new(mock.opener());
        let device = meter(&manager);

        assert!(device.connect("COM5"));
        device.wait_for_idle(Duration::from_secs(2)).unwrap();
        assert!(device.is_connected());
        assert!(device.status().contains("ACME METER 7"));
        assert!(device.connection().is_initialized());

        assert!(device.disconnect());
        device.wait_for_idle(Duration::from_secs(2)).unwrap();
        assert_eq!(device.state(), DeviceState::DISCONNECTED);
        assert!(mock.frames().contains(&"*RST\r".to_string()));
        assert!(!mock.is_open());
    }

    #[test]
    fn failed_identification_closes_port() {
        let mock = MockDevice::new();
        mock.respond_with(|_| Some(b"SOMETHING ELSE\r".to_vec()));
        let manager = ConnectionManager::new(mock.opener());
        let device = meter(&manager);
        let mut status = device.subscribe();

        device.connect("COM5");
        device.wait_for_idle(Duration::from_secs(2)).unwrap();
        assert!(device.has_error());
        assert!(!device.is_connected());
        assert!(!mock.is_open());
        assert_eq!(status.try_recv().unwrap().state, DeviceState::CONNECTING);
    }

    #[test]
    fn execute_records_failures() {
        let mock = MockDevice::new();
        let manager = ConnectionManager::new(mock.opener());
        let device = meter(&manager);
        let err = device
            .execute("Read voltage", |engine| engine.custom_request("MEAS:VOLT?"))
            .unwrap_err();
        assert!(err.is_not_connected());
        assert!(device.has_error());
        assert!(device.status().starts_with("Read voltage failed"));
    }
}
