//! Named queue registry.
//!
//! Several logical devices can ride one physical line by asking for the same
//! queue name. The registry holds weak references, so a queue lives exactly as
//! long as the connections using it; a lookup never resurrects a disposed queue.

use crate::queue::worker::WorkerQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Map from queue name to live worker queue, guarded by one mutex.
pub struct QueueRegistry<C: 'static> {
    queues: Mutex<HashMap<String, Weak<WorkerQueue<C>>>>,
}

impl<C: 'static> Default for QueueRegistry<C> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: 'static> QueueRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a live queue by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<WorkerQueue<C>>> {
        let mut queues = self.queues.lock();
        live_entry(&mut queues, name)
    }

    /// Return the queue registered under `name`, or build and register one.
    ///
    /// `None` always builds an anonymous queue that is not registered. The
    /// boolean is `true` when `create` was called. Lookup and insert happen
    /// under the same lock, so two owners racing for one name share a queue.
    pub fn get_or_create<F>(&self, name: Option<&str>, create: F) -> (Arc<WorkerQueue<C>>, bool)
    where
        F: FnOnce() -> WorkerQueue<C>,
    {
        let Some(name) = name else {
            return (Arc::new(create()), true);
        };

        let mut queues = self.queues.lock();
        if let Some(queue) = live_entry(&mut queues, name) {
            debug!(queue = name, owner = queue.owner(), "Sharing existing worker queue");
            return (queue, false);
        }

        let queue = Arc::new(create());
        queues.insert(name.to_string(), Arc::downgrade(&queue));
        info!(queue = name, owner = queue.owner(), "Registered worker queue");
        (queue, true)
    }

    /// Drop the entry for `name`. Returns `true` if a live queue was registered.
    pub fn remove(&self, name: &str) -> bool {
        self.queues
            .lock()
            .remove(name)
            .is_some_and(|queue| queue.strong_count() > 0)
    }

    /// Names of live queues.
    pub fn names(&self) -> Vec<String> {
        let mut queues = self.queues.lock();
        prune(&mut queues);
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        let mut queues = self.queues.lock();
        prune(&mut queues);
        queues.len()
    }

    /// Check if no live queue is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every live queue and clear the registry.
    pub fn dispose_all(&self) {
        let live: Vec<Arc<WorkerQueue<C>>> = {
            let mut queues = self.queues.lock();
            queues.drain().filter_map(|(_, queue)| queue.upgrade()).collect()
        };
        let count = live.len();
        for queue in live {
            queue.dispose();
        }
        info!(count, "Disposed all worker queues");
    }
}

fn live_entry<C>(
    queues: &mut HashMap<String, Weak<WorkerQueue<C>>>,
    name: &str,
) -> Option<Arc<WorkerQueue<C>>> {
    match queues.get(name).and_then(Weak::upgrade) {
        Some(queue) if !queue.is_closed() => Some(queue),
        Some(_) | None => {
            queues.remove(name);
            None
        }
    }
}

fn prune<C>(queues: &mut HashMap<String, Weak<WorkerQueue<C>>>) {
    queues.retain(|_, queue| queue.upgrade().is_some_and(|queue| !queue.is_closed()));
}
