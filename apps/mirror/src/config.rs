use std::env;

use mirror_transport::TransportConfig;
use mirror_transport::relay::RelayConfig;

/// Mirror CLI configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub relay: RelayConfig,
    pub transport: TransportConfig,
    /// Bound on unacknowledged events held by the source.
    pub buffer_capacity: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut relay = RelayConfig::from_env();
        // Prefer IPv4 loopback over ::1
        if relay.host == "localhost" {
            relay.host = "127.0.0.1".to_string();
        }
        let buffer_capacity = env::var("MIRROR_BUFFER_CAPACITY")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .filter(|capacity: &usize| *capacity > 0);
        Self {
            relay,
            transport: TransportConfig::from_env(),
            buffer_capacity,
        }
    }
}
