//! Single-thread FIFO executor, one per physical connection.
//!
//! The worker thread builds the queue context `C` itself (through the init
//! closure passed to [`WorkerQueue::new`]) so anything living in the context,
//! like the serial line, is created and touched only on that thread.
//!
//! # Loop
//!
//! While not exiting, the worker pops one transaction under the queue lock and
//! runs it with the lock released. When the queue is empty it fires the
//! `idle` hooks and sleeps on the wake condition for at most the idle wait.
//! If that wait elapses with nothing enqueued, one `idle_timeout` hook fires.
//! Several idle-timeout hooks take turns, one per timeout, so periodic polls of
//! different values are spread across ticks.
//!
//! Hooks hold shared state of the queue; a hook that captures an
//! `Arc<WorkerQueue>` of its own queue keeps the queue alive forever.

use crate::abort::AbortSignal;
use crate::error::{LinkError, Result};
use crate::queue::transaction::{Completion, Transaction, TransactionKey};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Callback run on the worker thread with the queue context.
pub type Hook<C> = Arc<dyn Fn(&mut C) + Send + Sync>;

type Init<C> = Box<dyn FnOnce() -> C + Send>;

/// Handle returned by hook registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Worker notifications hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    /// The queue was found empty.
    Idle,
    /// The worker picked up work after being idle.
    ExitIdle,
    /// The idle wait elapsed with nothing enqueued.
    IdleTimeout,
    /// The worker is about to exit and drop its context.
    Dispose,
}

struct Hooks<C> {
    idle: Vec<(HookId, Hook<C>)>,
    exit_idle: Vec<(HookId, Hook<C>)>,
    idle_timeout: Vec<(HookId, Hook<C>)>,
    dispose: Vec<(HookId, Hook<C>)>,
    rotation: usize,
    next_id: u64,
}

impl<C> Hooks<C> {
    fn list(&self, event: QueueEvent) -> &Vec<(HookId, Hook<C>)> {
        match event {
            QueueEvent::Idle => &self.idle,
            QueueEvent::ExitIdle => &self.exit_idle,
            QueueEvent::IdleTimeout => &self.idle_timeout,
            QueueEvent::Dispose => &self.dispose,
        }
    }

    fn list_mut(&mut self, event: QueueEvent) -> &mut Vec<(HookId, Hook<C>)> {
        match event {
            QueueEvent::Idle => &mut self.idle,
            QueueEvent::ExitIdle => &mut self.exit_idle,
            QueueEvent::IdleTimeout => &mut self.idle_timeout,
            QueueEvent::Dispose => &mut self.dispose,
        }
    }
}

struct QueueShared<C> {
    label: String,
    pending: Mutex<VecDeque<Transaction<C>>>,
    wake: Condvar,
    exit: AtomicBool,
    closed: AtomicBool,
    idle: Mutex<bool>,
    idle_changed: Condvar,
    idle_wait: Mutex<Option<Duration>>,
    hooks: Mutex<Hooks<C>>,
}

impl<C> QueueShared<C> {
    fn set_idle(&self, value: bool) {
        let mut idle = self.idle.lock();
        if *idle != value {
            *idle = value;
            self.idle_changed.notify_all();
        }
    }

    fn fire(&self, event: QueueEvent, ctx: &mut C) {
        let hooks: Vec<Hook<C>> = self
            .hooks
            .lock()
            .list(event)
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(ctx);
        }
    }

    fn fire_idle_timeout(&self, ctx: &mut C) {
        let hook = {
            let mut hooks = self.hooks.lock();
            let count = hooks.idle_timeout.len();
            if count == 0 {
                return;
            }
            let index = hooks.rotation % count;
            hooks.rotation = hooks.rotation.wrapping_add(1);
            hooks.idle_timeout[index].1.clone()
        };
        hook(ctx);
    }

    fn drain(&self) {
        let dropped: Vec<Transaction<C>> = self.pending.lock().drain(..).collect();
        if !dropped.is_empty() {
            debug!(queue = %self.label, count = dropped.len(), "Discarding pending transactions");
        }
        // Dropped outside the lock: a transaction may own the last handle to this queue.
        drop(dropped);
    }
}

/// Marks the queue closed when the worker exits, including by panic.
struct CloseGuard<'a, C>(&'a QueueShared<C>);

impl<C> Drop for CloseGuard<'_, C> {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        if std::thread::panicking() {
            error!(queue = %self.0.label, "Transaction panicked, worker queue is dead");
        }
        self.0.drain();
        self.0.set_idle(true);
    }
}

/// Per-connection single-thread FIFO executor.
pub struct WorkerQueue<C: 'static> {
    name: Option<String>,
    owner: String,
    shared: Arc<QueueShared<C>>,
    init: Mutex<Option<Init<C>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
    disposed: AtomicBool,
}

impl<C: 'static> WorkerQueue<C> {
    /// Create a stopped queue.
    ///
    /// `init` runs on the worker thread when it starts and builds the context
    /// every transaction receives. Anonymous queues (`name == None`) are never
    /// shared through a registry.
    pub fn new<F>(name: Option<&str>, owner: &str, init: F) -> Self
    where
        F: FnOnce() -> C + Send + 'static,
    {
        let label = name.unwrap_or("noname").to_string();
        Self {
            name: name.map(str::to_string),
            owner: owner.to_string(),
            shared: Arc::new(QueueShared {
                label,
                pending: Mutex::new(VecDeque::with_capacity(100)),
                wake: Condvar::new(),
                exit: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                idle: Mutex::new(false),
                idle_changed: Condvar::new(),
                idle_wait: Mutex::new(None),
                hooks: Mutex::new(Hooks {
                    idle: Vec::new(),
                    exit_idle: Vec::new(),
                    idle_timeout: Vec::new(),
                    dispose: Vec::new(),
                    rotation: 0,
                    next_id: 0,
                }),
            }),
            init: Mutex::new(Some(Box::new(init))),
            thread: Mutex::new(None),
            worker_id: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Registry name, `None` for anonymous queues.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name used in logs and errors.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Label of the owner that created the queue.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Set how long the idle worker waits before firing an idle timeout.
    /// `None` waits forever and never fires one.
    pub fn set_idle_wait(&self, wait: Option<Duration>) {
        *self.shared.idle_wait.lock() = wait;
        self.notify();
    }

    /// Current idle wait.
    pub fn idle_wait(&self) -> Option<Duration> {
        *self.shared.idle_wait.lock()
    }

    /// Launch the worker thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() || self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(init) = self.init.lock().take() else {
            return Ok(());
        };

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-queue({})", self.shared.label))
            .spawn(move || run_worker(&shared, init))
            .map_err(|e| LinkError::io("spawning worker thread", e))?;

        *self.worker_id.lock() = Some(handle.thread().id());
        *thread = Some(handle);
        debug!(queue = %self.shared.label, owner = %self.owner, "Worker queue started");
        Ok(())
    }

    /// Check if the worker thread was started and has not exited.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.shared.closed.load(Ordering::Acquire)
    }

    /// Check if the calling thread is this queue's worker.
    pub fn is_worker_thread(&self) -> bool {
        *self.worker_id.lock() == Some(std::thread::current().id())
    }

    /// Check if the queue no longer accepts work.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.disposed.load(Ordering::Acquire)
    }

    /// Number of transactions waiting to run.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Check if the worker is waiting with an empty queue.
    pub fn is_idle(&self) -> bool {
        *self.shared.idle.lock()
    }

    fn notify(&self) {
        let _pending = self.shared.pending.lock();
        self.shared.wake.notify_all();
    }

    fn accept(&self, transaction: &Transaction<C>) -> bool {
        if self.is_closed() {
            warn!(
                queue = %self.shared.label,
                key = ?transaction.key(),
                "Worker queue closed, transaction dropped"
            );
            return false;
        }
        true
    }

    /// Append to the tail.
    pub fn enqueue(&self, transaction: Transaction<C>) {
        if !self.accept(&transaction) {
            return;
        }
        let mut pending = self.shared.pending.lock();
        pending.push_back(transaction);
        self.shared.set_idle(false);
        self.shared.wake.notify_all();
    }

    /// Append unless an equal transaction is already waiting.
    /// Returns `true` if it was appended.
    pub fn enqueue_unique(&self, transaction: Transaction<C>) -> bool {
        if !self.accept(&transaction) {
            return false;
        }
        let mut pending = self.shared.pending.lock();
        let appended = !pending.iter().any(|queued| *queued == transaction);
        if appended {
            pending.push_back(transaction);
            self.shared.set_idle(false);
        } else {
            trace!(queue = %self.shared.label, key = ?transaction.key(), "Duplicate transaction skipped");
        }
        self.shared.wake.notify_all();
        appended
    }

    /// Discard everything waiting and append this transaction alone.
    /// Returns the number of discarded transactions.
    pub fn enqueue_replace(&self, transaction: Transaction<C>) -> usize {
        if !self.accept(&transaction) {
            return 0;
        }
        let discarded: Vec<Transaction<C>> = {
            let mut pending = self.shared.pending.lock();
            let discarded = pending.drain(..).collect();
            pending.push_back(transaction);
            self.shared.set_idle(false);
            self.shared.wake.notify_all();
            discarded
        };
        let count = discarded.len();
        if count > 0 {
            debug!(queue = %self.shared.label, count, "Pending transactions superseded");
        }
        count
    }

    /// Append a transaction and return a handle to its result.
    pub fn submit<F, R>(&self, job: F) -> Completion<R>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (transaction, completion) =
            Transaction::with_completion(None, &self.shared.label, job);
        self.enqueue(transaction);
        completion
    }

    /// Like [`submit`](Self::submit) but skipped when an equal transaction is
    /// already waiting; a skipped submission resolves to `QueueClosed`.
    pub fn submit_unique<F, R>(&self, key: TransactionKey, job: F) -> Completion<R>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (transaction, completion) =
            Transaction::with_completion(Some(key), &self.shared.label, job);
        self.enqueue_unique(transaction);
        completion
    }

    /// Like [`submit`](Self::submit) but superseding everything waiting.
    pub fn submit_replace<F, R>(&self, job: F) -> Completion<R>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (transaction, completion) =
            Transaction::with_completion(None, &self.shared.label, job);
        self.enqueue_replace(transaction);
        completion
    }

    /// Subscribe a hook to a worker notification.
    pub fn subscribe<F>(&self, event: QueueEvent, hook: F) -> HookId
    where
        F: Fn(&mut C) + Send + Sync + 'static,
    {
        let mut hooks = self.shared.hooks.lock();
        let id = HookId(hooks.next_id);
        hooks.next_id += 1;
        hooks.list_mut(event).push((id, Arc::new(hook)));
        id
    }

    /// Remove a hook. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: HookId) -> bool {
        let mut hooks = self.shared.hooks.lock();
        let mut removed = false;
        for event in [
            QueueEvent::Idle,
            QueueEvent::ExitIdle,
            QueueEvent::IdleTimeout,
            QueueEvent::Dispose,
        ] {
            let list = hooks.list_mut(event);
            let before = list.len();
            list.retain(|(hook_id, _)| *hook_id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of hooks subscribed to `event`.
    pub fn hook_count(&self, event: QueueEvent) -> usize {
        self.shared.hooks.lock().list(event).len()
    }

    /// Block until the worker is idle.
    ///
    /// Fails with `Aborted` if `abort` is raised first, or `Timeout` if
    /// `timeout` elapses first.
    pub fn wait_for_idle(&self, timeout: Duration, abort: Option<&AbortSignal>) -> Result<()> {
        const SLICE: Duration = Duration::from_millis(10);
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut idle = self.shared.idle.lock();
        loop {
            if *idle {
                return Ok(());
            }
            if abort.is_some_and(AbortSignal::is_signaled) {
                return Err(LinkError::Aborted {
                    command: "wait for idle".into(),
                });
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(LinkError::Timeout {
                    command: format!("{} idle", self.shared.label),
                    requested: 0,
                    received: 0,
                    waited: now - start,
                });
            }
            let slice_end = now + SLICE;
            let until = deadline.map_or(slice_end, |deadline| slice_end.min(deadline));
            self.shared.idle_changed.wait_until(&mut idle, until);
        }
    }

    /// Signal exit, wake the worker and join it.
    ///
    /// Safe to call more than once and from the worker thread itself, in which
    /// case the thread is detached instead of joined.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.exit.store(true, Ordering::Release);
        self.notify();

        let handle = self.thread.lock().take();
        match handle {
            Some(handle) if handle.thread().id() != std::thread::current().id() => {
                if handle.join().is_err() {
                    error!(queue = %self.shared.label, "Worker thread panicked");
                }
            }
            Some(_) => {}
            None => {
                // Never started: nothing will drain the queue.
                self.shared.closed.store(true, Ordering::Release);
                self.shared.drain();
            }
        }
        self.init.lock().take();
        debug!(queue = %self.shared.label, "Worker queue disposed");
    }
}

impl<C: 'static> Drop for WorkerQueue<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C: 'static> std::fmt::Debug for WorkerQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("name", &self.shared.label)
            .field("owner", &self.owner)
            .field("pending", &self.pending_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn run_worker<C>(shared: &QueueShared<C>, init: Init<C>) {
    let _guard = CloseGuard(shared);
    let mut ctx = init();
    let mut was_idle = false;

    while !shared.exit.load(Ordering::Acquire) {
        // Idle is raised here and cleared by enqueues, both under the pending
        // lock, so it never reads true while work is waiting.
        let next = {
            let mut pending = shared.pending.lock();
            let next = pending.pop_front();
            if next.is_none() {
                shared.set_idle(true);
            }
            next
        };
        match next {
            Some(transaction) => {
                if was_idle {
                    was_idle = false;
                    shared.fire(QueueEvent::ExitIdle, &mut ctx);
                }
                transaction.run(&mut ctx);
            }
            None => {
                was_idle = true;
                shared.fire(QueueEvent::Idle, &mut ctx);

                let idle_wait = *shared.idle_wait.lock();
                let timed_out = {
                    let mut pending = shared.pending.lock();
                    if !pending.is_empty() || shared.exit.load(Ordering::Acquire) {
                        false
                    } else {
                        match idle_wait {
                            Some(wait) => {
                                shared.wake.wait_for(&mut pending, wait).timed_out()
                                    && pending.is_empty()
                            }
                            None => {
                                shared.wake.wait(&mut pending);
                                false
                            }
                        }
                    }
                };
                if timed_out && !shared.exit.load(Ordering::Acquire) {
                    shared.fire_idle_timeout(&mut ctx);
                }
            }
        }
    }

    shared.fire(QueueEvent::Dispose, &mut ctx);
    debug!(queue = %shared.label, "Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_queue() -> WorkerQueue<Vec<u32>> {
        WorkerQueue::new(Some("unit"), "test", Vec::new)
    }

    #[test]
    fn runs_in_fifo_order() {
        let queue = counter_queue();
        for i in 0..20 {
            queue.enqueue(Transaction::new(move |log: &mut Vec<u32>| log.push(i)));
        }
        let log = queue.submit(|log: &mut Vec<u32>| log.clone());
        queue.start().unwrap();
        assert_eq!(log.wait().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn unique_skips_equal_pending_transaction() {
        let queue = counter_queue();
        let key = TransactionKey::new("poll").with_args(1);
        assert!(queue.enqueue_unique(Transaction::keyed(key.clone(), |log: &mut Vec<u32>| log.push(1))));
        assert!(!queue.enqueue_unique(Transaction::keyed(key, |log: &mut Vec<u32>| log.push(1))));
        assert_eq!(queue.pending_len(), 1);

        let log = queue.submit(|log: &mut Vec<u32>| log.clone());
        queue.start().unwrap();
        assert_eq!(log.wait().unwrap(), vec![1]);
    }

    #[test]
    fn replace_discards_pending() {
        let queue = counter_queue();
        queue.enqueue(Transaction::new(|log: &mut Vec<u32>| log.push(1)));
        let superseded = queue.submit(|log: &mut Vec<u32>| log.push(2));
        assert_eq!(queue.enqueue_replace(Transaction::new(|log: &mut Vec<u32>| log.push(3))), 2);

        let log = queue.submit(|log: &mut Vec<u32>| log.clone());
        queue.start().unwrap();
        assert_eq!(log.wait().unwrap(), vec![3]);
        assert!(matches!(superseded.wait(), Err(LinkError::QueueClosed { .. })));
    }

    #[test]
    fn start_is_idempotent_and_dispose_joins() {
        let queue = counter_queue();
        queue.start().unwrap();
        queue.start().unwrap();
        assert!(queue.is_running());
        queue.dispose();
        queue.dispose();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.submit(|_: &mut Vec<u32>| ()).wait(),
            Err(LinkError::QueueClosed { .. })
        ));
    }

    #[test]
    fn context_is_built_on_worker_thread() {
        let queue: WorkerQueue<Option<String>> = WorkerQueue::new(None, "test", || {
            std::thread::current().name().map(str::to_string)
        });
        let name = queue.submit(|ctx: &mut Option<String>| ctx.clone());
        queue.start().unwrap();
        assert_eq!(name.wait().unwrap().as_deref(), Some("worker-queue(noname)"));
    }

    #[test]
    fn dispose_hook_runs_with_context() {
        let fired = Arc::new(AtomicUsize::new(0));
        let queue = counter_queue();
        let seen = fired.clone();
        queue.subscribe(QueueEvent::Dispose, move |log: &mut Vec<u32>| {
            seen.store(log.len() + 1, Ordering::SeqCst);
        });
        queue.enqueue(Transaction::new(|log: &mut Vec<u32>| log.push(9)));
        queue.start().unwrap();
        queue.wait_for_idle(Duration::from_secs(1), None).unwrap();
        queue.dispose();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_hook() {
        let queue = counter_queue();
        let id = queue.subscribe(QueueEvent::Idle, |_: &mut Vec<u32>| {});
        assert_eq!(queue.hook_count(QueueEvent::Idle), 1);
        assert!(queue.unsubscribe(id));
        assert!(!queue.unsubscribe(id));
        assert_eq!(queue.hook_count(QueueEvent::Idle), 0);
    }
}
