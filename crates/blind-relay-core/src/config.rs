//! Engine configuration

use std::time::Duration;

/// Default time a lone connection waits for its peer
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on closing a connection during teardown
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of registry shards
pub const DEFAULT_REGISTRY_SHARDS: usize = 16;

/// Relay engine configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a waiting session may stay unpaired
    pub pairing_timeout: Duration,
    /// Upper bound on waiting plus paired sessions (0 = unbounded)
    pub max_sessions: usize,
    /// Upper bound on flushing and closing a connection at teardown
    pub close_timeout: Duration,
    /// Number of independently locked registry shards
    pub registry_shards: usize,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            max_sessions: 0,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            registry_shards: DEFAULT_REGISTRY_SHARDS,
            event_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Set the pairing timeout
    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    /// Set the session limit
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
}
