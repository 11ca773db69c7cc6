//! Broker tuning knobs.

use std::time::Duration;

/// Configuration for the broker and its registry.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a client stays registered without a heartbeat (default: 4s)
    pub client_ttl: Duration,
    /// Period of the polling requester (default: 2s)
    pub poll_interval: Duration,
    /// Maximum number of open sessions (default: 1024)
    pub max_sessions: usize,
    /// Queue depth of each session's worker inbox (default: 32)
    pub session_inbox: usize,
    /// Queue depth of each reply channel (default: 256)
    pub reply_capacity: usize,
    /// How long a reply send may wait on a full channel (default: 250ms)
    pub send_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_ttl: Duration::from_millis(4000),
            poll_interval: Duration::from_secs(2),
            max_sessions: 1024,
            session_inbox: 32,
            reply_capacity: 256,
            send_timeout: Duration::from_millis(250),
        }
    }
}
