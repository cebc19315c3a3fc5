//! Gateway configuration.
//!
//! [`GatewayConfig`] is the single set of named options the daemon is built
//! from; each component receives its own sub-config derived from it.

use std::path::PathBuf;
use std::time::Duration;

use agora_store::{CacheConfig, StatsConfig, StoreConfig};

use crate::pipeline::trends::DEFAULT_TAG_LIMIT;
use crate::relay::PoolConfig;
use crate::relay::outbox::DEFAULT_OUTBOX_MAX_RELAYS;
use crate::{Error, Result};

/// Every option of the gateway core.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream relays queried and subscribed to.
    pub upstream_relays: Vec<String>,
    /// This gateway's own relay address.
    pub local_relay: Option<String>,
    /// Pubkey that signs user records and whose relay list extends the write set.
    pub admin_pubkey: Option<String>,
    /// Pubkeys registered as local users at startup.
    pub local_users: Vec<String>,
    /// Event store database file.
    pub database_path: PathBuf,
    /// Relay directory and hashtag trends database file.
    pub ingest_database_path: PathBuf,
    /// Maximum hot-cache entries.
    pub cache_size: u64,
    pub positive_cache_ttl: Duration,
    pub negative_cache_ttl: Duration,
    /// Coalescing window length.
    pub batch_delay: Duration,
    /// Ids that close a batch early.
    pub batch_max_size: usize,
    /// Max wait per fetch.
    pub batch_timeout: Duration,
    /// Per-operation store timeout.
    pub query_timeout: Duration,
    /// Max pending recompute keys.
    pub stats_debounce_capacity: usize,
    pub outbox_max_relays: usize,
    /// `t` tags per event counted for trends.
    pub trend_tag_limit: usize,
    /// Prometheus port (0 disables).
    pub metrics_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            upstream_relays: Vec::new(),
            local_relay: None,
            admin_pubkey: None,
            local_users: Vec::new(),
            database_path: PathBuf::from("./data/agora.db"),
            ingest_database_path: PathBuf::from("./data/agora-ingest.db"),
            cache_size: cache.capacity,
            positive_cache_ttl: cache.positive_ttl,
            negative_cache_ttl: cache.negative_ttl,
            batch_delay: cache.batch_delay,
            batch_max_size: cache.batch_max_size,
            batch_timeout: cache.batch_timeout,
            query_timeout: Duration::from_secs(5),
            stats_debounce_capacity: StatsConfig::default().debounce_capacity,
            outbox_max_relays: DEFAULT_OUTBOX_MAX_RELAYS,
            trend_tag_limit: DEFAULT_TAG_LIMIT,
            metrics_port: 9091,
        }
    }
}

impl GatewayConfig {
    /// Reject option combinations the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(admin) = &self.admin_pubkey
            && agora_core::event::validate_hex(admin, 64, "admin_pubkey").is_err()
        {
            return Err(Error::Config(format!("admin pubkey must be 64 lowercase hex chars: {admin}")));
        }
        for user in &self.local_users {
            if agora_core::event::validate_hex(user, 64, "local_users").is_err() {
                return Err(Error::Config(format!("local user must be 64 lowercase hex chars: {user}")));
            }
        }
        if self.negative_cache_ttl > self.positive_cache_ttl {
            return Err(Error::Config(
                "negative cache TTL must not exceed the positive TTL".to_string(),
            ));
        }
        if self.batch_max_size == 0 {
            return Err(Error::Config("batch max size must be at least 1".to_string()));
        }
        if self.outbox_max_relays == 0 {
            return Err(Error::Config("outbox max relays must be at least 1".to_string()));
        }
        if self.stats_debounce_capacity == 0 {
            return Err(Error::Config("stats debounce capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database_path.clone(),
            query_timeout: self.query_timeout,
        }
    }

    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            debounce_capacity: self.stats_debounce_capacity,
            ..Default::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_size,
            positive_ttl: self.positive_cache_ttl,
            negative_ttl: self.negative_cache_ttl,
            batch_delay: self.batch_delay,
            batch_max_size: self.batch_max_size,
            batch_timeout: self.batch_timeout,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            upstream_relays: self.upstream_relays.clone(),
            local_relay: self.local_relay.clone(),
            admin_pubkey: self.admin_pubkey.clone(),
            outbox_max_relays: self.outbox_max_relays,
            relay_timeout: self.batch_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert!(config.negative_cache_ttl < config.positive_cache_ttl);
        assert_eq!(config.outbox_max_relays, 4);
        assert_eq!(config.trend_tag_limit, 5);
    }

    #[test]
    fn test_rejects_bad_options() {
        let config = GatewayConfig {
            admin_pubkey: Some("npub1xyz".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = GatewayConfig {
            negative_cache_ttl: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            batch_max_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            outbox_max_relays: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_sub_configs_follow_options() {
        let config = GatewayConfig {
            upstream_relays: vec!["wss://nos.lol".to_string()],
            cache_size: 42,
            batch_delay: Duration::from_millis(10),
            stats_debounce_capacity: 7,
            ..Default::default()
        };

        assert_eq!(config.cache_config().capacity, 42);
        assert_eq!(config.cache_config().batch_delay, Duration::from_millis(10));
        assert_eq!(config.stats_config().debounce_capacity, 7);
        assert_eq!(config.pool_config().upstream_relays, vec!["wss://nos.lol".to_string()]);
        assert_eq!(config.store_config().path, PathBuf::from("./data/agora.db"));
    }
}
