//! Coalescing configuration.

use crate::error::{Error, Result};
use crate::key::KeyNamespace;
use std::time::Duration;

/// Lifetime of `lock:<key>`.
///
/// A lock whose owner died without unlocking disappears after this long.
/// Waiters never give up earlier than this, so it is part of the protocol and
/// deliberately not configurable.
pub const LOCK_TTL: Duration = Duration::from_secs(30);

/// Default page size for prefix/pattern evictions.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

/// Settings for `CoalesceCacheManager`.
#[derive(Clone, Debug)]
pub struct CoalesceConfig {
    pub namespace: KeyNamespace,
    pub scan_batch_size: usize,
    /// Floor for how long a waiter blocks: `max(ttl, min_wait)`.
    /// Must be at least [`LOCK_TTL`].
    pub min_wait: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        CoalesceConfig {
            namespace: KeyNamespace::default(),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            min_wait: LOCK_TTL,
        }
    }
}

impl CoalesceConfig {
    /// Defaults, overridden by the environment:
    ///
    /// - `COALESCE_SCAN_BATCH_SIZE`
    /// - `COALESCE_MIN_WAIT_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let scan_batch_size = std::env::var("COALESCE_SCAN_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.scan_batch_size);

        let min_wait = std::env::var("COALESCE_MIN_WAIT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.min_wait);

        CoalesceConfig {
            scan_batch_size,
            min_wait,
            ..defaults
        }
    }

    /// # Errors
    /// `Error::ConfigError` if the wait floor is below the lock TTL, the
    /// batch size is zero, or the namespace is incomplete.
    pub fn validate(&self) -> Result<()> {
        if self.min_wait < LOCK_TTL {
            return Err(Error::ConfigError(format!(
                "min_wait {:?} is below the lock TTL {:?}",
                self.min_wait, LOCK_TTL
            )));
        }
        if self.scan_batch_size == 0 {
            return Err(Error::ConfigError(
                "scan_batch_size must be at least 1".to_string(),
            ));
        }

        let ns = &self.namespace;
        if ns.cache_prefix.is_empty() || ns.lock_prefix.is_empty() {
            return Err(Error::ConfigError(
                "cache and lock prefixes cannot be empty".to_string(),
            ));
        }
        if ns.cache_prefix == ns.lock_prefix {
            return Err(Error::ConfigError(
                "cache and lock prefixes must differ".to_string(),
            ));
        }
        if ns.evict_topic.is_empty() || ns.result_topic.is_empty() || ns.evict_topic == ns.result_topic {
            return Err(Error::ConfigError(
                "eviction and result topics must be distinct and non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// How long a waiter blocks for a caller TTL.
    pub fn wait_bound(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(Duration::ZERO).max(self.min_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoalesceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_wait, LOCK_TTL);
        assert_eq!(config.scan_batch_size, 100);
    }

    #[test]
    fn test_wait_floor_cannot_drop_below_lock_ttl() {
        let config = CoalesceConfig {
            min_wait: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_shared_prefix_rejected() {
        let mut config = CoalesceConfig::default();
        config.namespace.lock_prefix = config.namespace.cache_prefix.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wait_bound() {
        let config = CoalesceConfig::default();
        assert_eq!(config.wait_bound(None), LOCK_TTL);
        assert_eq!(config.wait_bound(Some(Duration::from_secs(5))), LOCK_TTL);
        assert_eq!(
            config.wait_bound(Some(Duration::from_secs(120))),
            Duration::from_secs(120)
        );
    }
}
