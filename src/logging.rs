//! Tracing initialisation.
//!
//! The library only emits `tracing` events; binaries and tests install a
//! subscriber through this module. `RUST_LOG` overrides the configured level.
//!
//! # Example
//! ```no_run
//! use daq_link::{config::LinkConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!("Link layer started");
//! # Ok(())
//! # }
//! ```

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colors, for development.
    Pretty,
    /// One line per event without colors.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level unless `RUST_LOG` says otherwise.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Include file and line numbers.
    pub with_file_and_line: bool,
    /// Include thread names. Worker threads are named after their queue.
    pub with_thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_thread_names: true,
        }
    }
}

impl TracingConfig {
    /// Options with the given level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from the `[application]` section. File and line numbers are
    /// added at `debug` and `trace`.
    pub fn from_link_config(config: &LinkConfig) -> Result<Self> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self {
            level,
            format: parse_log_format(&config.application.log_format)?,
            with_file_and_line: level >= Level::DEBUG,
            with_thread_names: true,
        })
    }

    /// Set output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install a subscriber configured from `config`.
pub fn init_from_config(config: &LinkConfig) -> Result<()> {
    init(TracingConfig::from_link_config(config)?)
}

/// Install a global subscriber.
///
/// Idempotent: when a subscriber is already installed this returns `Ok(())`,
/// so tests and libraries may call it freely.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));
    let base = fmt::layer()
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(already_initialized)
}

fn already_initialized(e: TryInitError) -> Result<()> {
    // Expected in tests and when several components initialise tracing.
    if e.to_string().contains("already been set") {
        Ok(())
    } else {
        Err(LinkError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        )))
    }
}

/// Parse a format name (`pretty`, `compact` or `json`), case-insensitively.
pub fn parse_log_format(format: &str) -> Result<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(LinkError::Configuration(format!(
            "Invalid log format '{format}'. Must be one of: pretty, compact, json"
        ))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LinkError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
