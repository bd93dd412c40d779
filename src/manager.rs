//! Connection manager: owns the queue registry and the line opener.
//!
//! Queues live as long as the manager; dropping it disposes every queue still
//! registered, which closes their ports.

use crate::config::{InstrumentConfig, LinkConfig};
use crate::connection::{Connection, PortRegistry};
use crate::error::{LinkError, Result};
use crate::protocol::{DeviceProfile, ScpiProfile};
use crate::transport::{self, LineOpener};
use std::sync::Arc;
use tracing::info;

/// Factory for connections sharing one registry.
pub struct ConnectionManager {
    registry: PortRegistry,
    opener: Arc<dyn LineOpener>,
}

impl ConnectionManager {
    /// Manager opening lines through `opener`.
    pub fn new(opener: Arc<dyn LineOpener>) -> Self {
        Self {
            registry: PortRegistry::new(),
            opener,
        }
    }

    /// Manager for the ports of this machine.
    pub fn system() -> Self {
        Self::new(transport::system_opener())
    }

    /// Queue registry.
    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    /// Line opener.
    pub fn opener(&self) -> &Arc<dyn LineOpener> {
        &self.opener
    }

    /// Open a connection for `profile`. Connections naming the same queue
    /// share one worker thread and one line.
    pub fn open<P: DeviceProfile>(&self, profile: P, queue: Option<&str>) -> Result<Connection<P>> {
        Connection::open(&self.registry, self.opener.clone(), profile, queue)
    }

    /// Open a connection for a configured instrument.
    pub fn open_configured(
        &self,
        config: &LinkConfig,
        instrument: &InstrumentConfig,
    ) -> Result<Connection<ScpiProfile>> {
        let profile = ScpiProfile::from_config(&instrument.profile, config.idle_wait());
        self.open(profile, instrument.queue.as_deref())
    }

    /// Open a connection for the configured instrument `id`.
    pub fn open_by_id(&self, config: &LinkConfig, id: &str) -> Result<Connection<ScpiProfile>> {
        let instrument = config
            .instrument(id)
            .ok_or_else(|| LinkError::Configuration(format!("Unknown instrument '{id}'")))?;
        self.open_configured(config, instrument)
    }

    /// Names of live shared queues.
    pub fn queue_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Ports the opener can see.
    pub fn available_ports(&self) -> Result<Vec<String>> {
        self.opener
            .available_ports()
            .map_err(|e| LinkError::io("listing serial ports", e))
    }

    /// Dispose every registered queue.
    pub fn shutdown(&self) {
        info!(queues = self.registry.len(), "Shutting down connection manager");
        self.registry.dispose_all();
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::system()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.registry.dispose_all();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("queues", &self.registry.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockDevice;

    const CONFIG: &str = r#"
[[instruments]]
id = "psu"
port = "COM1"
queue = "bus"
[instruments.profile]
name = "PSU"
identification = "PSU"

[[instruments]]
id = "load"
port = "COM1"
queue = "bus"
[instruments.profile]
name = "LOAD"
identification = "LOAD"
"#;

    #[test]
    fn configured_instruments_share_named_queue() {
        let device = MockDevice::new();
        let manager = ConnectionManager::new(device.opener());
        let config = LinkConfig::from_toml(CONFIG).unwrap();
        let psu = manager.open_by_id(&config, "psu").unwrap();
        let load = manager.open_by_id(&config, "load").unwrap();
        assert!(Arc::ptr_eq(psu.queue(), load.queue()));
        assert_eq!(manager.queue_names(), vec!["bus".to_string()]);
        assert!(matches!(
            manager.open_by_id(&config, "scope"),
            Err(LinkError::Configuration(_))
        ));
    }

    #[test]
    fn shutdown_closes_queues() {
        let device = MockDevice::new();
        device.set_ports(&["COM1", "COM2"]);
        let manager = ConnectionManager::new(device.opener());
        assert_eq!(manager.available_ports().unwrap(), ["COM1", "COM2"]);
        let config = LinkConfig::from_toml(CONFIG).unwrap();
        let psu = manager.open_by_id(&config, "psu").unwrap();
        psu.connect("COM1").unwrap();
        manager.shutdown();
        assert!(psu.queue().is_closed());
        assert!(!device.is_open());
        assert!(matches!(psu.connect("COM1"), Err(LinkError::QueueClosed { .. })));
    }
}
