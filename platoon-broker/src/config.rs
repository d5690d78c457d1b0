use std::time::Duration;

use platoon_protocol::DEFAULT_BROKER_PORT;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// How often the collector logs a platoon snapshot
    pub snapshot_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_BROKER_PORT,
            snapshot_interval: Duration::from_secs(1),
        }
    }
}
