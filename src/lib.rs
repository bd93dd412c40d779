//! # DAQ Link
//!
//! Serialized command queue and serial protocol engine for laboratory
//! instruments. Every exchange with a device runs as a transaction on a
//! dedicated worker thread, so request/reply pairs never interleave, even when
//! several logical devices share one physical line.
//!
//! ## Crate Structure
//!
//! - **`queue`**: `WorkerQueue`, one worker thread per queue executing
//!   transactions in FIFO order, with idle and idle-timeout hooks. The
//!   `QueueRegistry` lets owners share a queue by name.
//! - **`transport`**: the `SerialLine` seam, the buffering `Transport` with
//!   line polling and emulated Mark/Space parity, the `serialport` backend and
//!   an in-memory mock device.
//! - **`protocol`**: command tables, device profiles, frame building and the
//!   `ProtocolEngine` that runs ACK, request and binary exchanges.
//! - **`connection`**: the cloneable `Connection` handle, its state flags and
//!   the notifications shared by every owner of a line.
//! - **`device`**: user-facing device front-end with status messages.
//! - **`manager`**: `ConnectionManager`, the entry point owning the registry.
//! - **`config`**: Figment-based configuration of queues and instruments.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: the `LinkError` enum shared by every module.
//! - **`abort`**: the abort signal raised by users and polled by long reads.
//!
//! ## Example
//! ```no_run
//! use daq_link::{config::LinkConfig, logging, manager::ConnectionManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::load()?;
//! logging::init_from_config(&config)?;
//! let manager = ConnectionManager::system();
//! let psu = manager.open_by_id(&config, "psu")?;
//! psu.connect("/dev/ttyUSB0")?;
//! println!("{}", psu.initialize()?);
//! println!("{}", psu.custom_request("MEAS:VOLT?")?);
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use abort::AbortSignal;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use device::{Device, DeviceState, DeviceStatus};
pub use error::{ErrorClass, LinkError, Result};
pub use manager::ConnectionManager;
pub use protocol::{BaseCommand, Command, CommandTable, DeviceCommand, DeviceProfile};
