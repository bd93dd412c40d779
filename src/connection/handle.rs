//! Connection handle: a logical device riding a (possibly shared) port queue.
//!
//! Every operation is a transaction on the queue. Blocking callers submit and
//! wait on the completion handle; async callers await it. Both routes run the
//! same closure on the worker thread with a [`ProtocolEngine`].

use crate::abort::AbortSignal;
use crate::connection::shared::{ConnectionShared, PortContext};
use crate::connection::state::{ConnectionEvent, ConnectionState};
use crate::error::{LinkError, Result};
use crate::protocol::{Args, Command, DeviceProfile, ProtocolEngine};
use crate::queue::{
    Completion, HookId, OwnerId, QueueEvent, QueueRegistry, Transaction, TransactionKey,
    WorkerQueue,
};
use crate::transport::{LineOpener, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Queue type carrying a port.
pub type PortQueue = WorkerQueue<PortContext>;

/// Registry of port queues.
pub type PortRegistry = QueueRegistry<PortContext>;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

struct Inner<P: DeviceProfile> {
    profile: Arc<P>,
    shared: Arc<ConnectionShared>,
    queue: Arc<PortQueue>,
    hooks: Mutex<Vec<HookId>>,
}

impl<P: DeviceProfile> Drop for Inner<P> {
    fn drop(&mut self) {
        for id in self.hooks.get_mut().drain(..) {
            self.queue.unsubscribe(id);
        }
        debug!(owner = %self.shared.label(), "Connection released");
    }
}

/// Cloneable handle to one logical device connection.
pub struct Connection<P: DeviceProfile> {
    inner: Arc<Inner<P>>,
}

impl<P: DeviceProfile> Clone for Connection<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: DeviceProfile> std::fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("owner", &self.inner.shared)
            .field("queue", &self.inner.queue.label())
            .finish()
    }
}

impl<P: DeviceProfile> Connection<P> {
    /// Attach to the queue named `queue_name`, creating and starting it if
    /// needed. `None` gets a private queue.
    pub fn open(
        registry: &PortRegistry,
        opener: Arc<dyn LineOpener>,
        profile: P,
        queue_name: Option<&str>,
    ) -> Result<Self> {
        let settings = profile.line_settings();
        let (queue, created) = registry.get_or_create(queue_name, || {
            WorkerQueue::new(queue_name, profile.name(), move || {
                PortContext::new(Transport::new(opener, settings))
            })
        });
        if created {
            queue.set_idle_wait(profile.idle_wait());
            queue.subscribe(QueueEvent::Dispose, |port: &mut PortContext| port.close());
        }
        queue.start()?;

        let id: OwnerId = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ConnectionShared::new(
            id,
            profile.name(),
            profile.max_errors(),
            Arc::downgrade(&queue),
        ));

        let owner = Arc::downgrade(&shared);
        queue.enqueue(Transaction::new(move |port: &mut PortContext| port.register(owner)));

        let owner = Arc::downgrade(&shared);
        let idle = queue.subscribe(QueueEvent::Idle, move |_: &mut PortContext| {
            if let Some(shared) = owner.upgrade() {
                if shared.state().is_connected() {
                    shared.emit(ConnectionEvent::Idle);
                }
            }
        });

        info!(
            owner = id,
            profile = profile.name(),
            queue = queue.label(),
            shared_queue = !created,
            "Connection opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                profile: Arc::new(profile),
                shared,
                queue,
                hooks: Mutex::new(vec![idle]),
            }),
        })
    }

    // ---- accessors ----

    /// Owner id, unique per process.
    pub fn id(&self) -> OwnerId {
        self.inner.shared.id()
    }

    /// Device profile.
    pub fn profile(&self) -> &P {
        &self.inner.profile
    }

    /// Underlying queue.
    pub fn queue(&self) -> &Arc<PortQueue> {
        &self.inner.queue
    }

    /// Shared owner state.
    pub fn shared(&self) -> &Arc<ConnectionShared> {
        &self.inner.shared
    }

    /// Current flags.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Last status message.
    pub fn status(&self) -> String {
        self.inner.shared.status()
    }

    /// Failed exchanges since the last success.
    pub fn error_count(&self) -> u32 {
        self.inner.shared.error_count()
    }

    /// Port open.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Identification succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.shared.subscribe()
    }

    /// Abort signal shared with in-flight reads.
    pub fn abort_signal(&self) -> &AbortSignal {
        self.inner.shared.abort_signal()
    }

    /// Raise the abort signal. In-flight long reads unwind with `Aborted`.
    /// The signal stays raised until [`clear_abort`](Self::clear_abort).
    pub fn abort(&self) {
        info!(owner = %self.inner.shared.label(), "Abort requested");
        self.inner.shared.abort_signal().signal();
    }

    /// Clear the abort signal.
    pub fn clear_abort(&self) {
        self.inner.shared.abort_signal().clear();
    }

    // ---- transactions ----

    fn job<F, R>(&self, op: F) -> impl FnOnce(&mut PortContext) -> R + Send + 'static
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) -> R + Send + 'static,
        R: 'static,
    {
        let profile = self.inner.profile.clone();
        let shared = self.inner.shared.clone();
        move |port: &mut PortContext| {
            let mut engine = ProtocolEngine::new(port, &*profile, &shared);
            op(&mut engine)
        }
    }

    /// Queue `op` and return a handle to its result.
    pub fn submit<F, R>(&self, op: F) -> Completion<Result<R>>
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.queue.submit(self.job(op))
    }

    /// Queue `op` and block until it ran.
    ///
    /// Must not be called from inside an async runtime or from a hook.
    pub fn run<F, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.queue.is_worker_thread() {
            return Err(LinkError::WorkerThread {
                queue: self.inner.queue.label().to_string(),
            });
        }
        self.submit(op).wait()?
    }

    /// Queue `op` and await its result.
    pub async fn run_async<F, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.submit(op).recv().await?
    }

    /// Queue `op` without waiting.
    pub fn enqueue<F>(&self, op: F)
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) + Send + 'static,
    {
        self.inner.queue.enqueue(Transaction::new(self.job(op)));
    }

    /// Queue `op` unless the same operation of this owner with the same
    /// arguments is already waiting. Returns `true` if it was queued.
    pub fn enqueue_unique<F>(&self, op_name: &'static str, args: Option<String>, op: F) -> bool
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) + Send + 'static,
    {
        let mut key = TransactionKey::new(op_name).with_owner(self.id());
        if let Some(args) = args {
            key = key.with_args(args);
        }
        self.inner
            .queue
            .enqueue_unique(Transaction::keyed(key, self.job(op)))
    }

    /// Discard everything waiting on the queue and queue `op` alone.
    /// Returns the number of discarded transactions.
    pub fn enqueue_replace<F>(&self, op: F) -> usize
    where
        F: FnOnce(&mut ProtocolEngine<'_, P>) + Send + 'static,
    {
        self.inner
            .queue
            .enqueue_replace(Transaction::new(self.job(op)))
    }

    /// Run `handler` whenever the queue goes idle while connected.
    pub fn on_idle<F>(&self, handler: F) -> HookId
    where
        F: Fn(&mut ProtocolEngine<'_, P>) + Send + Sync + 'static,
    {
        let profile = self.inner.profile.clone();
        let owner = Arc::downgrade(&self.inner.shared);
        let id = self
            .inner
            .queue
            .subscribe(QueueEvent::Idle, move |port: &mut PortContext| {
                let Some(shared) = owner.upgrade() else {
                    return;
                };
                if port.is_open() && shared.state().is_connected() {
                    handler(&mut ProtocolEngine::new(port, &*profile, &shared));
                }
            });
        self.inner.hooks.lock().push(id);
        id
    }

    /// Run `handler` on idle timeouts while connected, with `AUTO_POLLING`
    /// set. Handlers of all owners on the queue take turns, one per timeout.
    pub fn on_idle_timeout<F>(&self, handler: F) -> HookId
    where
        F: Fn(&mut ProtocolEngine<'_, P>) + Send + Sync + 'static,
    {
        let profile = self.inner.profile.clone();
        let owner = Arc::downgrade(&self.inner.shared);
        let id = self
            .inner
            .queue
            .subscribe(QueueEvent::IdleTimeout, move |port: &mut PortContext| {
                let Some(shared) = owner.upgrade() else {
                    return;
                };
                if !port.is_open() || !shared.state().is_connected() {
                    return;
                }
                shared.insert(ConnectionState::AUTO_POLLING);
                shared.emit(ConnectionEvent::IdleTimeout);
                handler(&mut ProtocolEngine::new(port, &*profile, &shared));
                shared.remove(ConnectionState::AUTO_POLLING);
            });
        self.inner.hooks.lock().push(id);
        id
    }

    /// Remove a handler registered by this connection.
    pub fn remove_handler(&self, id: HookId) -> bool {
        self.inner.hooks.lock().retain(|hook| *hook != id);
        self.inner.queue.unsubscribe(id)
    }

    /// Block until the queue is idle, the abort signal is raised or `timeout`
    /// elapses.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<()> {
        self.inner
            .queue
            .wait_for_idle(timeout, Some(self.inner.shared.abort_signal()))
    }

    // ---- blocking operations ----

    /// Open `port`.
    pub fn connect(&self, port: &str) -> Result<()> {
        let port = port.to_string();
        self.run(move |engine| engine.connect(&port))
    }

    /// Close the port after the best-effort pre-disconnect command.
    pub fn disconnect(&self) -> Result<()> {
        self.run(|engine| {
            engine.disconnect();
            Ok(())
        })
    }

    /// Identify the device. Returns the identification reply.
    pub fn initialize(&self) -> Result<String> {
        self.run(|engine| engine.initialize())
    }

    /// Reset the device.
    pub fn reset(&self) -> Result<()> {
        self.run(|engine| engine.reset())
    }

    /// Send the device abort command.
    pub fn abort_device(&self) -> Result<()> {
        self.run(|engine| engine.abort_device())
    }

    /// Flush the line.
    pub fn flush(&self) -> Result<()> {
        self.run(|engine| engine.flush())
    }

    /// Send a command.
    pub fn command(&self, command: impl Into<Command<P::Command>>) -> Result<()> {
        let command = command.into();
        self.run(move |engine| engine.command(command))
    }

    /// Send a command with arguments.
    pub fn command_with(
        &self,
        command: impl Into<Command<P::Command>>,
        args: impl Into<Args>,
    ) -> Result<()> {
        let command = command.into();
        let args = args.into();
        self.run(move |engine| engine.command_with(command, Some(args)))
    }

    /// Send a request and return the reply line.
    pub fn request(&self, command: impl Into<Command<P::Command>>) -> Result<String> {
        let command = command.into();
        self.run(move |engine| engine.request(command))
    }

    /// Send a request with arguments and return the reply line.
    pub fn request_with(
        &self,
        command: impl Into<Command<P::Command>>,
        args: impl Into<Args>,
    ) -> Result<String> {
        let command = command.into();
        let args = args.into();
        self.run(move |engine| engine.request_with(command, Some(args)))
    }

    /// Send a request and wait up to `timeout` for the reply line. Waits
    /// longer than twice the basic timeout can be cut short with [`abort`](Self::abort).
    pub fn request_with_timeout(
        &self,
        command: impl Into<Command<P::Command>>,
        args: Option<Args>,
        timeout: Duration,
    ) -> Result<String> {
        let command = command.into();
        self.run(move |engine| engine.request_with_timeout(command, args, timeout))
    }

    /// Send a command and read `len` bytes within `timeout`.
    pub fn request_bytes(
        &self,
        command: impl Into<Command<P::Command>>,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let command = command.into();
        self.run(move |engine| {
            let mut buf = vec![0u8; len];
            engine.request_bytes(command, &mut buf, timeout)?;
            Ok(buf)
        })
    }

    /// Send raw text.
    pub fn custom(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.run(move |engine| engine.custom(&text))
    }

    /// Send raw text and return the reply line.
    pub fn custom_request(&self, text: &str) -> Result<String> {
        let text = text.to_string();
        self.run(move |engine| engine.custom_request(&text))
    }

    // ---- async operations ----

    /// Open `port`.
    pub async fn connect_async(&self, port: &str) -> Result<()> {
        let port = port.to_string();
        self.run_async(move |engine| engine.connect(&port)).await
    }

    /// Close the port.
    pub async fn disconnect_async(&self) -> Result<()> {
        self.run_async(|engine| {
            engine.disconnect();
            Ok(())
        })
        .await
    }

    /// Identify the device.
    pub async fn initialize_async(&self) -> Result<String> {
        self.run_async(|engine| engine.initialize()).await
    }

    /// Send a command with optional arguments.
    pub async fn command_async(
        &self,
        command: impl Into<Command<P::Command>>,
        args: Option<Args>,
    ) -> Result<()> {
        let command = command.into();
        self.run_async(move |engine| engine.command_with(command, args))
            .await
    }

    /// Send a request with optional arguments and return the reply line.
    pub async fn request_async(
        &self,
        command: impl Into<Command<P::Command>>,
        args: Option<Args>,
    ) -> Result<String> {
        let command = command.into();
        self.run_async(move |engine| engine.request_with(command, args))
            .await
    }
}
