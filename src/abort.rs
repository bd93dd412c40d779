//! Explicitly-cleared cancellation signal.
//!
//! One [`AbortSignal`] is shared between a connection and every blocking read
//! running on its behalf. Raising it unwinds the read at the next poll boundary
//! with [`LinkError::Aborted`](crate::error::LinkError::Aborted). The signal
//! stays raised until [`AbortSignal::clear`] is called.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct AbortState {
    raised: Mutex<bool>,
    cond: Condvar,
}

/// Manual-reset cancellation handle, cheap to clone.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    /// Create a signal in the cleared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn signal(&self) {
        let mut raised = self.state.raised.lock();
        *raised = true;
        self.state.cond.notify_all();
    }

    /// Clear the signal so new operations can run.
    pub fn clear(&self) {
        *self.state.raised.lock() = false;
    }

    /// Check the signal without blocking.
    pub fn is_signaled(&self) -> bool {
        *self.state.raised.lock()
    }

    /// Block up to `timeout` for the signal. Returns `true` if it is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut raised = self.state.raised.lock();
        while !*raised {
            match deadline {
                Some(deadline) => {
                    if self.state.cond.wait_until(&mut raised, deadline).timed_out() {
                        break;
                    }
                }
                None => self.state.cond.wait(&mut raised),
            }
        }
        *raised
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
