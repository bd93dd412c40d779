//! Per-connection transaction queues.
//!
//! - [`WorkerQueue`]: one worker thread executing a FIFO of [`Transaction`]s
//! - [`QueueRegistry`]: name lookup so several owners can share one queue
//! - [`Completion`]: blocking or async handle to a submitted transaction

pub mod registry;
pub mod transaction;
pub mod worker;

pub use registry::QueueRegistry;
pub use transaction::{Completion, OwnerId, Transaction, TransactionKey};
pub use worker::{Hook, HookId, QueueEvent, WorkerQueue};
