//! State shared between a connection handle and the worker thread.

use crate::abort::AbortSignal;
use crate::connection::state::{ConnectionEvent, ConnectionState};
use crate::error::LinkError;
use crate::queue::{OwnerId, Transaction, WorkerQueue};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Per-owner state: flags, status text, error counter and notifications.
///
/// Flags are written on the worker thread and readable from anywhere.
pub struct ConnectionShared {
    id: OwnerId,
    label: String,
    state: AtomicU32,
    status: Mutex<String>,
    errors: AtomicU32,
    max_errors: u32,
    abort: AbortSignal,
    events: broadcast::Sender<ConnectionEvent>,
    queue: Weak<WorkerQueue<PortContext>>,
}

impl ConnectionShared {
    pub(crate) fn new(
        id: OwnerId,
        label: &str,
        max_errors: u32,
        queue: Weak<WorkerQueue<PortContext>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            label: label.to_string(),
            state: AtomicU32::new(ConnectionState::DISCONNECTED.bits()),
            status: Mutex::new(String::new()),
            errors: AtomicU32::new(0),
            max_errors,
            abort: AbortSignal::new(),
            events,
            queue,
        }
    }

    /// Owner id.
    pub fn id(&self) -> OwnerId {
        self.id
    }

    /// Owner label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current flags.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Abort signal of this owner.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Last status message.
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    /// Failed exchanges since the last success.
    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Acquire)
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    /// Replace the flags, notifying subscribers on change.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state.bits(), Ordering::AcqRel);
        if previous != state.bits() {
            if !state.contains(ConnectionState::ERROR) {
                self.errors.store(0, Ordering::Release);
            }
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    pub(crate) fn insert(&self, flags: ConnectionState) {
        self.set_state(self.state() | flags);
    }

    pub(crate) fn remove(&self, flags: ConnectionState) {
        self.set_state(self.state() - flags);
    }

    /// Clear the error flag and counter after a successful exchange.
    pub(crate) fn record_success(&self) {
        self.remove(ConnectionState::ERROR);
        self.errors.store(0, Ordering::Release);
    }

    /// Record a failed exchange. Reaching the error limit schedules a
    /// disconnect that supersedes everything pending on the queue.
    pub(crate) fn record_failure(&self, error: &LinkError) {
        self.insert(ConnectionState::ERROR);
        self.set_status(error.to_string());
        let count = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(owner = %self.label, count, class = %error.class(), "Exchange failed: {error}");
        if count >= self.max_errors {
            self.errors.store(0, Ordering::Release);
            self.schedule_disconnect();
        }
    }

    fn schedule_disconnect(&self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        warn!(owner = %self.label, "Too many errors, disconnecting");
        queue.enqueue_replace(Transaction::new(|port: &mut PortContext| port.close()));
    }
}

impl std::fmt::Debug for ConnectionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionShared")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .field("errors", &self.error_count())
            .finish()
    }
}

/// Context of a connection queue: the line and the owners riding it.
///
/// Built on the worker thread and only ever touched there.
pub struct PortContext {
    transport: Transport,
    owners: Vec<Weak<ConnectionShared>>,
}

impl PortContext {
    /// Wrap a closed transport.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            owners: Vec::new(),
        }
    }

    /// The line.
    pub fn transport(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Check if the port is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Add an owner; it picks up the current port state.
    pub fn register(&mut self, owner: Weak<ConnectionShared>) {
        if let Some(shared) = owner.upgrade() {
            if self.transport.is_open() {
                shared.set_state(ConnectionState::CONNECTED);
            }
            debug!(owner = %shared.label(), owners = self.owners.len() + 1, "Owner registered on port");
        }
        self.owners.push(owner);
    }

    /// Live owners.
    pub fn owners(&mut self) -> Vec<Arc<ConnectionShared>> {
        self.owners.retain(|owner| owner.strong_count() > 0);
        self.owners.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn notify_connected(&mut self) {
        for owner in self.owners() {
            owner.set_state(ConnectionState::CONNECTED);
            owner.emit(ConnectionEvent::Connected);
        }
    }

    pub(crate) fn notify_initialized(&mut self) {
        for owner in self.owners() {
            owner.set_state((owner.state() - ConnectionState::DISCONNECTED) | ConnectionState::READY);
            owner.emit(ConnectionEvent::Initialized);
        }
    }

    pub(crate) fn notify_disconnected(&mut self) {
        for owner in self.owners() {
            owner.set_state(ConnectionState::DISCONNECTED);
            owner.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Close the port without a pre-disconnect command and tell every owner.
    pub fn close(&mut self) {
        let was_open = self.transport.is_open();
        self.transport.disconnect();
        if was_open {
            info!(owners = self.owners.len(), "Port closed");
        }
        self.notify_disconnected();
    }
}

impl std::fmt::Debug for PortContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortContext")
            .field("port", &self.transport.port_name())
            .field("owners", &self.owners.len())
            .finish()
    }
}
