//! Server configuration

use std::time::Duration;

use hsrv_protocol::parser::MAX_PENDING_BYTES;

/// Per-connection limits and protocol switches
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// How long a read may wait for a complete line
    pub idle_timeout: Duration,
    /// Granularity of the wait loop
    pub poll_interval: Duration,
    /// Most bytes buffered without a newline
    pub max_pending_bytes: usize,
    /// Answer STATUS with corpus and load figures
    pub status_enabled: bool,
    /// Refuse generation 2 clients
    pub old_protocol_only: bool,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max;
        self
    }

    pub fn with_status(mut self, enabled: bool) -> Self {
        self.status_enabled = enabled;
        self
    }

    pub fn with_old_protocol_only(mut self, old_only: bool) -> Self {
        self.old_protocol_only = old_only;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            max_pending_bytes: MAX_PENDING_BYTES,
            status_enabled: false,
            old_protocol_only: false,
        }
    }
}
