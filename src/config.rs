//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the restore core of the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base directory holding one sub-directory per endpoint.
    pub state_dir: PathBuf,

    /// Minimum TTL enforced on DNS history entries, in seconds.
    pub dns_min_ttl: u32,

    /// Maximum number of tracked IPs per DNS name per endpoint.
    pub dns_max_ips_per_host: usize,

    /// Maximum number of expired DNS entries kept for deferred
    /// connection-tracking confirmation.
    pub dns_max_deferred_deletes: usize,

    /// Delay applied before committing a changed security identity to a
    /// restored endpoint, bounding the cluster-wide window in which policy
    /// decisions may disagree about the endpoint.
    pub identity_change_grace_period: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/run/netwarden"),
            dns_min_ttl: 0,
            dns_max_ips_per_host: 50,
            dns_max_deferred_deletes: 10_000,
            identity_change_grace_period: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Create a new configuration with the given state directory.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Set the minimum DNS TTL.
    pub fn with_dns_min_ttl(mut self, ttl: u32) -> Self {
        self.dns_min_ttl = ttl;
        self
    }

    /// Set the per-host DNS IP cap.
    pub fn with_dns_max_ips_per_host(mut self, max: usize) -> Self {
        self.dns_max_ips_per_host = max;
        self
    }

    /// Set the deferred-delete cap for expired DNS entries.
    pub fn with_dns_max_deferred_deletes(mut self, max: usize) -> Self {
        self.dns_max_deferred_deletes = max;
        self
    }

    /// Set the identity-change grace period.
    pub fn with_identity_change_grace_period(mut self, period: Duration) -> Self {
        self.identity_change_grace_period = period;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = AgentConfig::new("/tmp/state")
            .with_dns_min_ttl(60)
            .with_identity_change_grace_period(Duration::from_secs(10));

        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.dns_min_ttl, 60);
        assert_eq!(config.identity_change_grace_period, Duration::from_secs(10));
        assert_eq!(config.dns_max_ips_per_host, 50);
    }
}
