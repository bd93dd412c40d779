//! Units of queued work.

use crate::error::{LinkError, Result};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Identity of a logical owner of a queue (one per connection front-end).
pub type OwnerId = u64;

/// Equality key of a transaction.
///
/// Two keyed transactions are equal when the operation, the owner and the
/// captured arguments are all equal. Anonymous transactions are never equal to
/// anything, so `enqueue_unique` always accepts them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    owner: Option<OwnerId>,
    op: &'static str,
    args: Option<String>,
}

impl TransactionKey {
    /// Key for an operation with no owner and no arguments.
    pub fn new(op: &'static str) -> Self {
        Self {
            owner: None,
            op,
            args: None,
        }
    }

    /// Scope the key to one owner.
    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Attach the captured arguments.
    pub fn with_args(mut self, args: impl ToString) -> Self {
        self.args = Some(args.to_string());
        self
    }

    /// Operation name.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Captured arguments, if any.
    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }
}

type Job<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// One unit of work executed on the worker thread with the queue context.
pub struct Transaction<C> {
    key: Option<TransactionKey>,
    job: Job<C>,
}

impl<C> Transaction<C> {
    /// Anonymous transaction.
    pub fn new<F>(job: F) -> Self
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        Self {
            key: None,
            job: Box::new(job),
        }
    }

    /// Transaction that compares equal to any other with the same key.
    pub fn keyed<F>(key: TransactionKey, job: F) -> Self
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        Self {
            key: Some(key),
            job: Box::new(job),
        }
    }

    /// Transaction that reports its result through a [`Completion`].
    pub(crate) fn with_completion<F, R>(
        key: Option<TransactionKey>,
        queue: &str,
        job: F,
    ) -> (Self, Completion<R>)
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let transaction = Self {
            key,
            job: Box::new(move |ctx: &mut C| {
                // The waiter may have given up; nothing to do then.
                let _ = tx.send(job(ctx));
            }),
        };
        (transaction, Completion::new(rx, queue))
    }

    /// Equality key, if this transaction has one.
    pub fn key(&self) -> Option<&TransactionKey> {
        self.key.as_ref()
    }

    pub(crate) fn run(self, ctx: &mut C) {
        (self.job)(ctx)
    }
}

impl<C> PartialEq for Transaction<C> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.key, &other.key) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl<C> std::fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("key", &self.key).finish()
    }
}

/// Handle to the result of a submitted transaction.
///
/// `wait` blocks the calling thread and must not be used from inside an async
/// runtime; async callers use `recv().await`.
#[derive(Debug)]
pub struct Completion<R> {
    rx: oneshot::Receiver<R>,
    queue: String,
}

impl<R> Completion<R> {
    fn new(rx: oneshot::Receiver<R>, queue: &str) -> Self {
        Self {
            rx,
            queue: queue.to_string(),
        }
    }

    fn closed(&self) -> LinkError {
        LinkError::QueueClosed {
            queue: self.queue.clone(),
        }
    }

    /// Block until the transaction has run.
    pub fn wait(self) -> Result<R> {
        let closed = self.closed();
        self.rx.blocking_recv().map_err(|_| closed)
    }

    /// Await the transaction result.
    pub async fn recv(self) -> Result<R> {
        let closed = self.closed();
        self.rx.await.map_err(|_| closed)
    }

    /// Take the result if the transaction has already run.
    pub fn try_take(&mut self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(self.closed())),
        }
    }
}
