//! Data-driven profile for configured instruments.
//!
//! Instruments described in the configuration file have no device enum of
//! their own; they talk through the base commands and `Custom` text.

use crate::config::ProfileConfig;
use crate::protocol::command::{BaseCommand, CommandTable, NoDeviceCommands};
use crate::protocol::profile::{DeviceProfile, TransferMode};
use std::time::Duration;

/// Profile built at runtime from a [`ProfileConfig`].
#[derive(Debug, Clone)]
pub struct ScpiProfile {
    name: String,
    identification: String,
    baud_rate: u32,
    basic_timeout: Duration,
    newline: Option<String>,
    ack: Option<String>,
    separator: String,
    query_marker: Option<String>,
    address: Option<u8>,
    trim_control_chars: bool,
    transfer_mode: TransferMode,
    max_errors: u32,
    idle_wait: Option<Duration>,
    table: CommandTable<NoDeviceCommands>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl ScpiProfile {
    /// Build from configuration. `idle_wait` comes from the queue section.
    pub fn from_config(config: &ProfileConfig, idle_wait: Option<Duration>) -> Self {
        let table = CommandTable::base()
            .with_base(BaseCommand::Init, config.init_command.clone())
            .with_base(BaseCommand::Reset, config.reset_command.clone())
            .with_base(BaseCommand::Abort, config.abort_command.clone());
        Self {
            name: config.name.clone(),
            identification: config.identification.clone(),
            baud_rate: config.baud_rate,
            basic_timeout: Duration::from_millis(config.basic_timeout_ms),
            newline: non_empty(&config.newline),
            ack: non_empty(&config.ack),
            separator: config.separator.clone(),
            query_marker: non_empty(&config.query_marker),
            address: config.address,
            trim_control_chars: config.trim_control_chars,
            transfer_mode: if config.binary {
                TransferMode::Binary
            } else {
                TransferMode::Ascii
            },
            max_errors: config.max_errors.max(1),
            idle_wait,
            table,
        }
    }
}

impl DeviceProfile for ScpiProfile {
    type Command = NoDeviceCommands;

    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &CommandTable<NoDeviceCommands> {
        &self.table
    }

    fn identification(&self) -> &str {
        &self.identification
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn basic_timeout(&self) -> Duration {
        self.basic_timeout
    }

    fn address(&self) -> Option<u8> {
        self.address
    }

    fn newline(&self) -> Option<&str> {
        self.newline.as_deref()
    }

    fn ack(&self) -> Option<&str> {
        self.ack.as_deref()
    }

    fn arg_separator(&self) -> &str {
        &self.separator
    }

    fn query_marker(&self) -> Option<&str> {
        self.query_marker.as_deref()
    }

    fn trim_control_chars(&self) -> bool {
        self.trim_control_chars
    }

    fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    fn max_errors(&self) -> u32 {
        self.max_errors
    }

    fn idle_wait(&self) -> Option<Duration> {
        self.idle_wait
    }
}
