use std::env;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 10_000;

/// Timeouts applied by [`crate::PeerTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bound on reaching the counterpart in `connect()`.
    pub connect_timeout: Duration,
    /// Bound on the source-role wait for an open channel in `send()`.
    pub open_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
        }
    }
}

impl TransportConfig {
    /// Reads `MIRROR_CONNECT_TIMEOUT_MS` and `MIRROR_OPEN_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_millis(
                millis_from_env("MIRROR_CONNECT_TIMEOUT_MS").unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            open_timeout: Duration::from_millis(
                millis_from_env("MIRROR_OPEN_TIMEOUT_MS").unwrap_or(DEFAULT_OPEN_TIMEOUT_MS),
            ),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

fn millis_from_env(var: &str) -> Option<u64> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .filter(|value| *value > 0)
}
