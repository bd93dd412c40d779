//! Connection state flags and notifications.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// State of a logical connection.
    ///
    /// `DISCONNECTED` and `CONNECTED` never appear together. `ERROR` stays set
    /// until the next successful exchange.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectionState: u32 {
        /// Port closed.
        const DISCONNECTED = 0x01;
        /// Port open.
        const CONNECTED = 0x02;
        /// An exchange is on the wire.
        const BUSY = 0x04;
        /// The last exchange failed.
        const ERROR = 0x08;
        /// An idle-timeout poll is running.
        const AUTO_POLLING = 0x10;
        /// Identification succeeded.
        const INITIALIZED = 0x20;
        /// A control loop drives the device.
        const CONTROL_ON = 0x40;

        /// Connected and identified.
        const READY = Self::CONNECTED.bits() | Self::INITIALIZED.bits();
        /// Ready and controlled.
        const CONTROLLED = Self::READY.bits() | Self::CONTROL_ON.bits();
        /// Ready and polling in the background.
        const AUTO_POLLING_ACTIVE =
            Self::READY.bits() | Self::AUTO_POLLING.bits() | Self::BUSY.bits();
        /// Ready with an exchange in flight.
        const WORKING = Self::READY.bits() | Self::BUSY.bits();
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::DISCONNECTED
    }
}

impl ConnectionState {
    /// Port open.
    pub fn is_connected(self) -> bool {
        self.contains(ConnectionState::CONNECTED)
    }

    /// Identification succeeded.
    pub fn is_initialized(self) -> bool {
        self.contains(ConnectionState::INITIALIZED)
    }

    /// Short label for status displays, most significant condition first.
    pub fn label(self) -> &'static str {
        if self.contains(ConnectionState::ERROR) {
            "error"
        } else if self.contains(ConnectionState::AUTO_POLLING_ACTIVE) {
            "polling"
        } else if self.contains(ConnectionState::WORKING) {
            "working"
        } else if self.contains(ConnectionState::CONTROLLED) {
            "controlled"
        } else if self.contains(ConnectionState::READY) {
            "ready"
        } else if self.contains(ConnectionState::CONNECTED) {
            "connected"
        } else {
            "disconnected"
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Notification broadcast to the subscribers of one connection.
///
/// Emitted on the worker thread; receivers decide where to handle them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state flags changed.
    StateChanged(ConnectionState),
    /// The shared port was opened.
    Connected,
    /// The shared device was identified.
    Initialized,
    /// The shared port was closed, or failed to open.
    Disconnected,
    /// The worker queue ran empty while connected.
    Idle,
    /// The idle wait elapsed while connected.
    IdleTimeout,
}
