//! Grid-wide and per-structure configuration.

use std::collections::HashMap;

use crate::engine::BackupMode;
use crate::partition::MAX_BACKUP_COUNT;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// Settings of one named map (or list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapConfig {
    /// Number of backup replicas each partition of the structure gets.
    pub backup_count: usize,

    /// Whether map proxies keep a near cache of `get` results.
    pub near_cache_enabled: bool,

    /// Maximum number of entries kept by one near cache.
    pub near_cache_max_size: usize,

    /// Age in millisecs after which a near cache entry is refetched.
    /// Zero keeps entries until invalidated or evicted.
    pub near_cache_ttl_ms: u64,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            backup_count: 1,
            near_cache_enabled: false,
            near_cache_max_size: 10000,
            near_cache_ttl_ms: 60000,
        }
    }
}

/// Configuration of one grid member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Total number of partitions of the keyspace.
    pub partition_count: u32,

    /// Number of partition executor workers.
    pub worker_count: usize,

    /// How many times a partition invocation is re-routed after its target
    /// stopped owning the partition.
    pub invocation_retries: u32,

    /// First retry backoff in millisecs.
    pub retry_backoff_ms: u64,
    /// Cap of a single retry backoff in millisecs.
    pub retry_backoff_max_ms: u64,

    /// Whether primary responses wait for backup acks.
    pub backup_mode: BackupMode,

    /// Bound of the wait for backup acks in sync mode, in millisecs.
    pub backup_ack_timeout_ms: u64,

    /// Time given to in-flight invocations on shutdown, in millisecs.
    pub shutdown_grace_ms: u64,

    /// Default wait bound of proxy calls and fan-outs, in millisecs.
    pub proxy_call_timeout_ms: u64,

    /// Settings of structures with no entry in `maps`.
    pub default_map: MapConfig,

    /// Per-structure overrides, by name.
    pub maps: HashMap<String, MapConfig>,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            partition_count: 271,
            worker_count: 4,
            invocation_retries: 5,
            retry_backoff_ms: 10,
            retry_backoff_max_ms: 500,
            backup_mode: BackupMode::Async,
            backup_ack_timeout_ms: 1000,
            shutdown_grace_ms: 2000,
            proxy_call_timeout_ms: 5000,
            default_map: MapConfig::default(),
            maps: HashMap::new(),
        }
    }
}

impl GridConfig {
    /// Parses from an optional TOML string on top of the defaults, then
    /// validates.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, GridError> {
        let config = parsed_config!(config_str => GridConfig;
                                    partition_count, worker_count,
                                    invocation_retries, retry_backoff_ms,
                                    retry_backoff_max_ms, backup_mode,
                                    backup_ack_timeout_ms, shutdown_grace_ms,
                                    proxy_call_timeout_ms, default_map, maps)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges once at startup.
    pub fn validate(&self) -> Result<(), GridError> {
        if self.partition_count == 0 {
            return Err(GridError::Misuse(format!(
                "invalid partition_count {}",
                self.partition_count
            )));
        }
        if self.worker_count == 0 {
            return Err(GridError::Misuse(format!(
                "invalid worker_count {}",
                self.worker_count
            )));
        }
        if self.retry_backoff_ms == 0
            || self.retry_backoff_max_ms < self.retry_backoff_ms
        {
            return Err(GridError::Misuse(format!(
                "invalid retry backoff range {}..{} ms",
                self.retry_backoff_ms, self.retry_backoff_max_ms
            )));
        }
        if self.proxy_call_timeout_ms == 0 {
            return Err(GridError::Misuse(
                "invalid proxy_call_timeout_ms 0".into(),
            ));
        }
        for (name, map) in
            std::iter::once(("<default>", &self.default_map)).chain(
                self.maps.iter().map(|(name, map)| (name.as_str(), map)),
            )
        {
            if map.backup_count > MAX_BACKUP_COUNT {
                return Err(GridError::Misuse(format!(
                    "invalid backup_count {} of '{}'",
                    map.backup_count, name
                )));
            }
            if map.near_cache_enabled && map.near_cache_max_size == 0 {
                return Err(GridError::Misuse(format!(
                    "invalid near_cache_max_size 0 of '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Settings of the named structure.
    pub fn map_config(&self, name: &str) -> &MapConfig {
        self.maps.get(name).unwrap_or(&self.default_map)
    }

    /// Number of backups the partition table assigns: enough for the most
    /// demanding structure. Each structure then uses a prefix of the list.
    pub fn table_backup_count(&self) -> usize {
        self.maps
            .values()
            .map(|m| m.backup_count)
            .chain(std::iter::once(self.default_map.backup_count))
            .max()
            .unwrap_or(0)
    }
}
