//! Router Configuration

use std::time::Duration;

use crate::retry::RetryConfig;

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Interval between channel-list refreshes
    pub channel_refresh_interval: Duration,
    /// Page size for the forwards-listing API
    pub forwards_page_limit: usize,
    /// Gap added after the latest stored event when resuming a sync
    pub resume_gap: Duration,
    /// How far before an event's timestamp the fiat rate is sampled
    pub rate_lookup_offset: Duration,
    /// Operator-controlled node keys exempt from auto-reclassification
    pub node_whitelist: Vec<String>,
    /// Retry policy for transient collaborator failures
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            channel_refresh_interval: Duration::from_secs(5),
            forwards_page_limit: 100,
            resume_gap: Duration::from_secs(1),
            rate_lookup_offset: Duration::from_secs(5),
            node_whitelist: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Whether a node public key is operator-whitelisted.
    pub fn is_whitelisted(&self, public_key: &str) -> bool {
        self.node_whitelist.iter().any(|pk| pk == public_key)
    }
}
