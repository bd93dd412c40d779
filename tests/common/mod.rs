//! Shared bench profile for integration tests.

#![allow(dead_code)]

use daq_link::protocol::{CommandTable, DeviceCommand, DeviceProfile};
use std::time::Duration;

/// Commands of the bench power supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Psu {
    SetVoltage,
    Output,
    Status,
    Fetch,
}

impl DeviceCommand for Psu {
    const ALL: &'static [Self] = &[Psu::SetVoltage, Psu::Output, Psu::Status, Psu::Fetch];

    fn name(self) -> &'static str {
        match self {
            Psu::SetVoltage => "SetVoltage",
            Psu::Output => "Output",
            Psu::Status => "Status",
            Psu::Fetch => "Fetch",
        }
    }
}

fn psu_template(command: Psu) -> &'static str {
    match command {
        Psu::SetVoltage => "VSET <X>",
        Psu::Output => "OUT",
        Psu::Status => "STATUS",
        Psu::Fetch => "FETC:DATA",
    }
}

/// Bench power supply: `\n` terminated, ACK acknowledged, 20 ms basic timeout.
pub struct BenchPsu {
    pub name: &'static str,
    pub table: CommandTable<Psu>,
    pub address: Option<u8>,
    pub idle_wait: Option<Duration>,
}

impl BenchPsu {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            table: CommandTable::new(psu_template),
            address: None,
            idle_wait: None,
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = Some(wait);
        self
    }
}

impl DeviceProfile for BenchPsu {
    type Command = Psu;

    fn name(&self) -> &str {
        self.name
    }

    fn table(&self) -> &CommandTable<Psu> {
        &self.table
    }

    fn identification(&self) -> &str {
        "BENCH PSU"
    }

    fn basic_timeout(&self) -> Duration {
        Duration::from_millis(20)
    }

    fn newline(&self) -> Option<&str> {
        Some("\n")
    }

    fn arg_separator(&self) -> &str {
        ":"
    }

    fn address(&self) -> Option<u8> {
        self.address
    }

    fn idle_wait(&self) -> Option<Duration> {
        self.idle_wait
    }
}
