//! Serial protocol: command tables, device profiles, framing and the engine.

pub mod command;
pub mod engine;
pub mod frame;
pub mod profile;
pub mod scpi;

pub use command::{BaseCommand, Command, CommandTable, DeviceCommand, NoDeviceCommands};
pub use engine::{ProtocolEngine, POLL_INTERVAL};
pub use frame::{Args, Frame, ParsedFrame};
pub use profile::{DeviceProfile, TransferMode};
pub use scpi::ScpiProfile;
