//! Engine-wide configuration. See `spec.md` §6 for the authoritative
//! knob list and defaults; this module is the single source of truth
//! for those defaults in code.

use std::path::PathBuf;

/// Shard topology selection. The legacy three-tier topology
/// (`hot`/`warm`/`cold`) and the numbered topology (`shard_0..shard_N`)
/// may coexist during a migration; `primary_topology()` reports which
/// one the Operations Layer should treat as authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Legacy,
    Numbered,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_root: PathBuf,

    pub use_numbered_shards: bool,
    pub num_numbered_shards: u8,

    pub wal_sample_rate: u32,

    pub cache_write_through_on_put: bool,
    pub cache_sample_rate_put: u32,
    pub cache_sample_rate_get: u32,

    pub physics_sample_rate_put: u32,

    pub enable_intelligent_load_balancer: bool,
    pub deterministic_numbered_routing: bool,

    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    pub fsync_interval_ms: u64,
    pub wal_buffer_cap: usize,

    pub cache_capacity_limit: usize,
    pub cache_hawking_temperature: f64,

    /// Hot-key prefixes used by the `Adaptive` balancer strategy to
    /// decide affinity-worthy keys. Empty by default (spec.md §4.3
    /// mentions "known hot-prefix patterns" without specifying them).
    pub hot_prefixes: Vec<Vec<u8>>,

    /// How often the load balancer's background reviewer re-evaluates
    /// concurrency level and throughput against the target table.
    pub balancer_review_interval_ms: u64,
}

impl EngineConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.use_numbered_shards
            && !(1..=24).contains(&self.num_numbered_shards)
        {
            return Err(crate::error::WarpError::ConfigError(format!(
                "num_numbered_shards must be in 1..=24, got {}",
                self.num_numbered_shards
            )));
        }
        if self.wal_sample_rate == 0 {
            return Err(crate::error::WarpError::ConfigError(
                "wal_sample_rate must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cache_hawking_temperature) {
            return Err(crate::error::WarpError::ConfigError(
                "cache_hawking_temperature must be in 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn primary_topology(&self) -> Topology {
        if self.use_numbered_shards {
            Topology::Numbered
        } else {
            Topology::Legacy
        }
    }

    /// Load overrides from environment variables, falling back to
    /// `Default::default()` for anything unset. Mirrors the teacher's
    /// "read env, fall back to struct default" convention in `main.rs`.
    pub fn from_env(data_root: PathBuf) -> Self {
        let mut cfg = Self {
            data_root,
            ..Self::default()
        };
        if let Ok(v) = std::env::var("WARP_NUM_SHARDS") {
            if let Ok(n) = v.parse() {
                cfg.num_numbered_shards = n;
                cfg.use_numbered_shards = true;
            }
        }
        if let Ok(v) = std::env::var("WARP_FSYNC_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                cfg.fsync_interval_ms = n;
            }
        }
        cfg
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            use_numbered_shards: false,
            num_numbered_shards: 24,
            wal_sample_rate: 1,
            cache_write_through_on_put: true,
            cache_sample_rate_put: 8,
            cache_sample_rate_get: 4,
            physics_sample_rate_put: 16,
            enable_intelligent_load_balancer: false,
            deterministic_numbered_routing: true,
            flush_batch_size: 5_000,
            flush_interval_ms: 50,
            fsync_interval_ms: 100,
            wal_buffer_cap: 25_000,
            cache_capacity_limit: 100_000,
            cache_hawking_temperature: 0.1,
            hot_prefixes: Vec::new(),
            balancer_review_interval_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_shard_count() {
        let cfg = EngineConfig {
            use_numbered_shards: true,
            num_numbered_shards: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
