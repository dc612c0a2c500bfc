use std::time::Duration;

use serde::Deserialize;

/// How long the orchestrator waits for workers to drain once shutdown has
/// been requested.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2500;

/// Tunables for a [`ProxySession`](crate::session::ProxySession).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Drain timeout applied after shutdown. While the session is running
    /// normally the orchestrator waits without a bound.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Upper bound on the two handshake reads. `None` waits forever.
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout(),
            handshake_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}
