//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/daq-link.toml`)
//! 2. environment variables prefixed with `DAQ_LINK_`, nested keys split on
//!    `__` (for example `DAQ_LINK_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use daq_link::config::LinkConfig;
//!
//! let config = LinkConfig::load()?;
//! config.validate()?;
//! for instrument in config.enabled_instruments() {
//!     println!("{} on {}", instrument.id, instrument.port);
//! }
//! # Ok::<(), daq_link::error::LinkError>(())
//! ```

use crate::error::{LinkError, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq-link.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_LINK_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Worker queue defaults
    #[serde(default)]
    pub queue: QueueConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Worker queue defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Idle wait before an idle-timeout poll; omitted waits forever
    #[serde(default)]
    pub idle_wait_ms: Option<u64>,
}

/// One instrument on a serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique instrument identifier
    pub id: String,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Shared queue name; instruments naming the same queue share one line
    #[serde(default)]
    pub queue: Option<String>,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Wire policy
    pub profile: ProfileConfig,
}

/// Wire policy of a configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Model name
    pub name: String,
    /// Substring expected in the identification reply
    pub identification: String,
    /// Line speed
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Typical turnaround in milliseconds
    #[serde(default = "default_basic_timeout")]
    pub basic_timeout_ms: u64,
    /// Frame terminator; omitted sends none
    #[serde(default)]
    pub newline: Option<String>,
    /// ACK token; empty or omitted expects none
    #[serde(default)]
    pub ack: Option<String>,
    /// Separator between command and arguments
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Marker appended to requests; empty or omitted appends none
    #[serde(default)]
    pub query_marker: Option<String>,
    /// 9-bit address byte
    #[serde(default)]
    pub address: Option<u8>,
    /// Strip XON/XOFF from replies
    #[serde(default = "default_enabled")]
    pub trim_control_chars: bool,
    /// Identification query
    #[serde(default = "default_init_command")]
    pub init_command: String,
    /// Reset command
    #[serde(default = "default_reset_command")]
    pub reset_command: String,
    /// Abort command
    #[serde(default = "default_abort_command")]
    pub abort_command: String,
    /// Failed exchanges in a row before disconnecting
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    /// Binary single-byte identification instead of a text line
    #[serde(default)]
    pub binary: bool,
}

// Default value functions
fn default_name() -> String {
    "daq-link".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    57600
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_basic_timeout() -> u64 {
    100
}

fn default_separator() -> String {
    " ".to_string()
}

fn default_init_command() -> String {
    "*IDN?".to_string()
}

fn default_reset_command() -> String {
    "*RST".to_string()
}

fn default_abort_command() -> String {
    "ABOR".to_string()
}

fn default_max_errors() -> u32 {
    3
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LinkConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(Figment::new().merge(Toml::string(text)).extract()?)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LinkError::Configuration(format!("Cannot serialize configuration: {e}")))
    }

    /// Write the configuration to `path`, e.g. after a port scan filled in
    /// the instrument ports.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = self.to_toml_string()?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| LinkError::io(format!("writing {}", path.as_ref().display()), e))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(LinkError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        crate::logging::parse_log_format(&self.application.log_format)?;

        if self.queue.idle_wait_ms == Some(0) {
            return Err(LinkError::Configuration(
                "queue.idle_wait_ms must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(LinkError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            if instrument.port.trim().is_empty() {
                return Err(LinkError::Configuration(format!(
                    "Instrument '{}' has no port",
                    instrument.id
                )));
            }
            let profile = &instrument.profile;
            if profile.baud_rate == 0 {
                return Err(LinkError::Configuration(format!(
                    "Instrument '{}' has baud_rate 0",
                    instrument.id
                )));
            }
            if profile.basic_timeout_ms == 0 {
                return Err(LinkError::Configuration(format!(
                    "Instrument '{}' has basic_timeout_ms 0",
                    instrument.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentConfig> {
        self.instruments.iter().filter(|inst| inst.enabled).collect()
    }

    /// Find an instrument by id
    pub fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|inst| inst.id == id)
    }

    /// Idle wait for new queues
    pub fn idle_wait(&self) -> Option<Duration> {
        self.queue.idle_wait_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "bench"
log_level = "debug"

[queue]
idle_wait_ms = 30

[[instruments]]
id = "psu"
port = "/dev/ttyUSB0"
queue = "bench-bus"
[instruments.profile]
name = "GPD-3303"
identification = "GW INSTEK,GPD-X3303"
basic_timeout_ms = 1000
newline = "\n"
separator = ":"
query_marker = "?"

[[instruments]]
id = "meter"
port = "/dev/ttyUSB1"
enabled = false
[instruments.profile]
name = "K2400"
identification = "KEITHLEY INSTRUMENTS INC.,"
"#;

    #[test]
    fn test_parse_sample() {
        let config = LinkConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.idle_wait(), Some(Duration::from_millis(30)));
        assert!(config.validate().is_ok());

        let psu = config.instrument("psu").unwrap();
        assert_eq!(psu.queue.as_deref(), Some("bench-bus"));
        assert_eq!(psu.profile.baud_rate, 57600);
        assert_eq!(psu.profile.separator, ":");
        assert_eq!(psu.profile.init_command, "*IDN?");
        assert!(psu.profile.ack.is_none());

        let enabled: Vec<_> = config.enabled_instruments().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(enabled, ["psu"]);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = LinkConfig::load_from(file.path()).unwrap();
        assert_eq!(config.instruments.len(), 2);
    }

    #[test]
    fn test_saved_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = LinkConfig::from_toml(SAMPLE).unwrap();
        config.instruments[0].port = "/dev/ttyACM0".to_string();
        config.save(&path).unwrap();

        let loaded = LinkConfig::load_from(&path).unwrap();
        assert_eq!(loaded.instrument("psu").unwrap().port, "/dev/ttyACM0");
        assert_eq!(loaded.instrument("psu").unwrap().profile.newline.as_deref(), Some("\n"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.instruments.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LinkConfig::from_toml(SAMPLE).unwrap();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(LinkError::Configuration(_))));

        let mut config = LinkConfig::from_toml(SAMPLE).unwrap();
        config.application.log_format = "xml".to_string();
        assert!(matches!(config.validate(), Err(LinkError::Configuration(_))));

        let mut config = LinkConfig::from_toml(SAMPLE).unwrap();
        config.instruments[1].id = "psu".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));

        let mut config = LinkConfig::from_toml(SAMPLE).unwrap();
        config.instruments[0].profile.baud_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_field_is_config_error() {
        let err = LinkConfig::from_toml("[[instruments]]\nid = \"x\"\n").unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }
}
