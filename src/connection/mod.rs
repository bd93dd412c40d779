//! Logical connections over shared port queues.
//!
//! - [`ConnectionState`] / [`ConnectionEvent`]: flags and notifications
//! - [`ConnectionShared`]: per-owner state readable from any thread
//! - [`PortContext`]: the worker-side context holding the line and its owners
//! - [`Connection`]: the cloneable handle callers use

pub mod handle;
pub mod shared;
pub mod state;

pub use handle::{Connection, PortQueue, PortRegistry};
pub use shared::{ConnectionShared, PortContext};
pub use state::{ConnectionEvent, ConnectionState};
