//! Pool sizing and the timeouts that bound every registry suspension point.

use std::time::Duration;

use warden_core::config::PoolSection;

/// Configuration shared by every per-principal pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept open while idle (default: 2).
    pub min_connections: u32,
    /// Hard cap on connections per principal (default: 10).
    pub max_connections: u32,
    /// Connections opened at a time when the pool grows (default: 2).
    /// Advisory: primitives that grow one connection at a time ignore it.
    pub growth_increment: u32,
    /// Idle connections above the minimum are closed after this (default: 60s).
    pub idle_timeout: Duration,
    /// Maximum wait for a free connection before `AcquireTimeout` (default: 60s).
    pub queue_timeout: Duration,
    /// Maximum time for opening a pool and probing its first connection (default: 10s).
    pub connect_timeout: Duration,
    /// Graceful drain window before a pool is force-closed (default: 10s).
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSection::default())
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            min_connections: section.min_connections,
            max_connections: section.max_connections,
            growth_increment: section.growth_increment,
            idle_timeout: Duration::from_secs(section.idle_timeout_secs),
            queue_timeout: Duration::from_millis(section.queue_timeout_ms),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            drain_timeout: Duration::from_secs(section.drain_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.growth_increment, 2);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.queue_timeout, Duration::from_millis(60_000));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn pool_config_from_section() {
        let section = PoolSection {
            max_connections: 3,
            queue_timeout_ms: 250,
            ..PoolSection::default()
        };
        let config = PoolConfig::from(&section);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.queue_timeout, Duration::from_millis(250));
    }
}
