//! Link probe: command-line access to configured instruments.
//!
//! # Usage
//!
//! List serial ports:
//! ```bash
//! link_probe ports
//! ```
//!
//! Identify a configured instrument:
//! ```bash
//! link_probe --config config/daq-link.toml probe psu
//! ```
//!
//! Send a query:
//! ```bash
//! link_probe query psu "MEAS:VOLT?"
//! ```
//!
//! Probing sends the identification command of each configured profile.
//! Do not scan ports while an experiment is running.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_link::config::{InstrumentConfig, LinkConfig, DEFAULT_CONFIG_PATH};
use daq_link::logging;
use daq_link::manager::ConnectionManager;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "link_probe")]
#[command(about = "Probe and query serial instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports visible on this machine
    Ports,

    /// Connect to an instrument and check its identification
    Probe {
        /// Instrument id from the configuration
        id: String,

        /// Port overriding the configured one
        #[arg(long)]
        port: Option<String>,
    },

    /// Send raw text and print the reply line
    Query {
        /// Instrument id from the configuration
        id: String,

        /// Text to send
        text: String,

        /// Port overriding the configured one
        #[arg(long)]
        port: Option<String>,
    },

    /// Try every enabled instrument profile on every visible port
    Scan,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LinkConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    let manager = ConnectionManager::system();
    match cli.command {
        Commands::Ports => list_ports(&manager),
        Commands::Probe { id, port } => probe(&manager, &config, &id, port),
        Commands::Query { id, text, port } => query(&manager, &config, &id, port, &text),
        Commands::Scan => scan(&manager, &config),
    }
}

fn list_ports(manager: &ConnectionManager) -> Result<()> {
    let ports = manager.available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn instrument<'a>(config: &'a LinkConfig, id: &str) -> Result<&'a InstrumentConfig> {
    match config.instrument(id) {
        Some(instrument) => Ok(instrument),
        None => bail!("no instrument '{id}' in the configuration"),
    }
}

fn probe(
    manager: &ConnectionManager,
    config: &LinkConfig,
    id: &str,
    port: Option<String>,
) -> Result<()> {
    let instrument = instrument(config, id)?;
    let port = port.unwrap_or_else(|| instrument.port.clone());
    let connection = manager.open_configured(config, instrument)?;
    connection
        .connect(&port)
        .with_context(|| format!("connecting {id} on {port}"))?;
    let identification = connection
        .initialize()
        .with_context(|| format!("identifying {id} on {port}"))?;
    println!("{id} on {port}: {identification}");
    connection.disconnect()?;
    Ok(())
}

fn query(
    manager: &ConnectionManager,
    config: &LinkConfig,
    id: &str,
    port: Option<String>,
    text: &str,
) -> Result<()> {
    let instrument = instrument(config, id)?;
    let port = port.unwrap_or_else(|| instrument.port.clone());
    let connection = manager.open_configured(config, instrument)?;
    connection
        .connect(&port)
        .with_context(|| format!("connecting {id} on {port}"))?;
    let reply = connection.custom_request(text)?;
    println!("{reply}");
    connection.disconnect()?;
    Ok(())
}

fn scan(manager: &ConnectionManager, config: &LinkConfig) -> Result<()> {
    let ports = manager.available_ports()?;
    let mut found = 0;
    for port in &ports {
        for instrument in config.enabled_instruments() {
            let connection = manager.open_configured(config, instrument)?;
            let result = connection
                .connect(port)
                .and_then(|()| connection.initialize());
            match result {
                Ok(identification) => {
                    println!("{port}: {} ({identification})", instrument.id);
                    found += 1;
                }
                Err(e) => debug!(port = %port, instrument = %instrument.id, "No match: {e}"),
            }
            connection.disconnect()?;
        }
    }
    println!("Scanned {} ports, found {found} instruments", ports.len());
    Ok(())
}
