#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix in front of `/peers/{address}`.
    pub path: String,
    /// Shared key peers must present; any key is accepted when `None`.
    pub key: Option<String>,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            path: "/".to_string(),
            key: None,
        }
    }
}

impl RelayServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Route pattern for peer sockets under the configured prefix.
    pub fn peer_route(&self) -> String {
        let prefix = self.path.trim_end_matches('/');
        let prefix = if prefix.is_empty() || prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };
        format!("{prefix}/peers/:address")
    }
}
