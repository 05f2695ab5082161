//! C5 — the Operations Layer: the only module that composes the
//! shard store (C4), WAL coordinator (C3), Event-Horizon cache (C6),
//! and load balancer (C7) into the public `put`/`get`/`delete` API.

use crate::balancer::{self, LoadBalancer};
use crate::cache::{EventHorizonCache, GetOutcome};
use crate::config::{EngineConfig, Topology};
use crate::error::{Result, WarpError};
use crate::hints::{AccessPattern, CompressionHint, PutOptions, Priority};
use crate::metadata::{self, CosmicMetadata};
use crate::metrics::EngineMetrics;
use crate::store::{Record, ShardTables};
use crate::wal::checkpoint::CoordinatedCheckpointMeta;
use crate::wal::codec::Operation;
use crate::wal::coordinator::CoordinatedRecoveryResult;
use crate::wal::WalCoordinator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub struct PutResult {
    pub shard_id: u8,
    pub op_time_us: u64,
}

pub enum GetSource {
    Cache,
    Shard,
}

pub struct GetResult {
    pub value: Vec<u8>,
    pub source: GetSource,
    pub op_time_us: u64,
}

pub struct DeleteResult {
    pub deleted_from: Vec<u8>,
    pub op_time_us: u64,
}

/// Keys larger than this are rejected at the `Engine` boundary
/// (spec.md §3: "Key: arbitrary byte string, ≤ 64 KiB").
pub const MAX_KEY_LEN: usize = 64 * 1024;

fn check_key_len(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(WarpError::InvalidInput(format!(
            "key length {} exceeds max of {MAX_KEY_LEN} bytes",
            key.len()
        )));
    }
    Ok(())
}

type Observer = dyn Fn(&[u8], &CosmicMetadata) + Send + Sync;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Floor every reported operation time at 1 microsecond so benchmarks
/// never see a zero duration purely from timer resolution.
fn synthetic_op_time(elapsed: Duration) -> u64 {
    (elapsed.as_micros() as u64).max(1)
}

#[derive(Default)]
struct SampleCounters {
    wal_put: AtomicU64,
    cache_put: AtomicU64,
    cache_get: AtomicU64,
    observer: AtomicU64,
}

impl SampleCounters {
    /// True every `rate`-th call (rate ≤ 1 always fires).
    fn due(counter: &AtomicU64, rate: u32) -> bool {
        if rate <= 1 {
            return true;
        }
        let n = counter.fetch_add(1, Ordering::Relaxed);
        n % rate as u64 == 0
    }
}

/// The embedded engine: owns every subsystem and exposes the
/// put/get/delete/checkpoint/recovery/metrics API.
pub struct Engine {
    cfg: Arc<EngineConfig>,
    tables: Arc<ShardTables>,
    wal: Arc<WalCoordinator>,
    cache: Arc<EventHorizonCache>,
    balancer: Arc<LoadBalancer>,
    observers: parking_lot::RwLock<Vec<Arc<Observer>>>,
    samples: SampleCounters,
}

impl Engine {
    /// Open an engine against `cfg.data_root`, starting all shard
    /// workers and running recovery before returning.
    pub async fn open(cfg: EngineConfig) -> Result<Self> {
        cfg.validate()?;
        let num_shards = match cfg.primary_topology() {
            Topology::Legacy => 3,
            Topology::Numbered => cfg.num_numbered_shards as usize,
        };
        let tables = Arc::new(ShardTables::new(num_shards));
        let wal = Arc::new(WalCoordinator::start_all_shards(&cfg, &tables).await?);
        let cache = Arc::new(EventHorizonCache::new(cfg.cache_capacity_limit));
        let balancer = LoadBalancer::new(
            num_shards,
            cfg.hot_prefixes.clone(),
            Duration::from_millis(cfg.balancer_review_interval_ms),
        );

        Ok(Self {
            cfg: Arc::new(cfg),
            tables,
            wal,
            cache,
            balancer,
            observers: parking_lot::RwLock::new(Vec::new()),
            samples: SampleCounters::default(),
        })
    }

    /// Register an observer hook fired (best-effort, fire-and-forget)
    /// after every `put` that survives sampling, subject to
    /// `physics_sample_rate_put`.
    pub fn register_observer<F>(&self, observer: F)
    where
        F: Fn(&[u8], &CosmicMetadata) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn num_shards(&self) -> usize {
        self.tables.len()
    }

    /// Resolve the shard id for a write, honoring access-pattern
    /// overrides before deferring to the load balancer for `Balanced`.
    /// Hot/Warm/Cold bypass the strategy and map to fixed legacy
    /// shards; if the legacy topology isn't active, they fall back to
    /// deterministic hash routing, per spec.md §4.3's access-pattern
    /// override and §4.5 step 2's "fallback to legacy 3-tier on missing
    /// numbered shard" note.
    fn route(&self, key: &[u8], access_pattern: AccessPattern, priority: Priority) -> u8 {
        let legacy_active = self.cfg.primary_topology() == Topology::Legacy && self.num_shards() >= 3;
        let fixed = match access_pattern {
            AccessPattern::Hot if legacy_active => Some(0u8),
            AccessPattern::Warm if legacy_active => Some(1u8),
            AccessPattern::Cold if legacy_active => Some(2u8),
            _ => None,
        };
        if let Some(shard) = fixed {
            return shard;
        }
        if self.cfg.enable_intelligent_load_balancer {
            self.balancer.route(key, priority)
        } else {
            balancer::deterministic_hash_shard(key, self.num_shards())
        }
    }

    fn hashed_shard(&self, key: &[u8]) -> u8 {
        balancer::deterministic_hash_shard(key, self.num_shards())
    }

    /// Bounded set of shard ids to probe when a key isn't where
    /// deterministic hashing expects it — the hashed target plus, if
    /// small enough, every legacy shard (spec.md §4.5 get step 3).
    fn fallback_probe_order(&self, hashed: u8) -> Vec<u8> {
        let mut order = vec![hashed];
        if self.num_shards() <= 3 {
            for i in 0..self.num_shards() as u8 {
                if i != hashed {
                    order.push(i);
                }
            }
        }
        order
    }

    fn fire_observers(&self, key: Vec<u8>, metadata: CosmicMetadata) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for observer in observers {
                let key = key.clone();
                let metadata = metadata.clone();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    observer(&key, &metadata);
                }));
                if result.is_err() {
                    tracing::warn!("observer hook panicked; dropped");
                }
            }
        });
    }

    /// `put(key, value, opts)` — spec.md §4.5 steps 1-8.
    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>, opts: PutOptions) -> Result<PutResult> {
        let start = Instant::now();
        check_key_len(&key)?;

        let access_pattern = opts.access_pattern.unwrap_or_default();
        let priority = opts.priority.unwrap_or_default();
        let shard_id = self.route(&key, access_pattern, priority);

        let table = self
            .tables
            .get(shard_id)
            .ok_or(WarpError::ShardUnavailable { shard_id, reason: "no table for shard".to_string() })?;

        let stored_at_ms = now_ms();
        let metadata = metadata::build_metadata(shard_id, stored_at_ms, opts.metadata.clone());

        table.put(key.clone(), Record { value: value.clone(), metadata: metadata.clone() });

        if SampleCounters::due(&self.samples.wal_put, self.cfg.wal_sample_rate) {
            let shard = self.wal.shard(shard_id).ok_or(WarpError::ShardUnavailable {
                shard_id,
                reason: "no WAL shard".to_string(),
            })?;
            let encoded_metadata = metadata::encode(&metadata);
            shard.append(Operation::Put, key.clone(), Some(value.clone()), encoded_metadata)?;
        }

        if self.cfg.cache_write_through_on_put
            && SampleCounters::due(&self.samples.cache_put, self.cfg.cache_sample_rate_put)
        {
            let compression_hint = opts.compression_hint.unwrap_or_default();
            self.cache.put(key.clone(), &value, priority, compression_hint, opts.ttl_ms);
        }

        if SampleCounters::due(&self.samples.observer, self.cfg.physics_sample_rate_put) {
            self.fire_observers(key, metadata);
        }

        Ok(PutResult { shard_id, op_time_us: synthetic_op_time(start.elapsed()) })
    }

    /// `get(key)` — spec.md §4.5 steps 1-4. Returns `Ok(None)` for
    /// `NotFound`, matching the spec's "not an error per se" framing.
    pub async fn get(&self, key: &[u8]) -> Result<Option<GetResult>> {
        let start = Instant::now();
        check_key_len(key)?;

        if let GetOutcome::Hit { value, .. } = self.cache.get(key) {
            return Ok(Some(GetResult {
                value,
                source: GetSource::Cache,
                op_time_us: synthetic_op_time(start.elapsed()),
            }));
        }

        let hashed = self.hashed_shard(key);
        for shard_id in self.fallback_probe_order(hashed) {
            if let Some(table) = self.tables.get(shard_id) {
                if let Some(record) = table.get(key) {
                    if SampleCounters::due(&self.samples.cache_get, self.cfg.cache_sample_rate_get) {
                        self.cache.put(key.to_vec(), &record.value, Priority::Normal, CompressionHint::Auto, None);
                    }
                    return Ok(Some(GetResult {
                        value: record.value,
                        source: GetSource::Shard,
                        op_time_us: synthetic_op_time(start.elapsed()),
                    }));
                }
            }
        }

        Ok(None)
    }

    /// `delete(key)` — spec.md §4.5 delete steps 1-3.
    pub async fn delete(&self, key: &[u8]) -> Result<DeleteResult> {
        let start = Instant::now();
        check_key_len(key)?;
        let mut deleted_from = Vec::new();

        let hashed = self.hashed_shard(key);
        for shard_id in self.fallback_probe_order(hashed) {
            let Some(table) = self.tables.get(shard_id) else { continue };
            if table.remove(key).is_some() {
                deleted_from.push(shard_id);
                if SampleCounters::due(&self.samples.wal_put, self.cfg.wal_sample_rate) {
                    if let Some(shard) = self.wal.shard(shard_id) {
                        shard.append(Operation::Delete, key.to_vec(), None, Vec::new())?;
                    }
                }
            }
        }

        self.cache.remove(key);

        Ok(DeleteResult { deleted_from, op_time_us: synthetic_op_time(start.elapsed()) })
    }

    /// Flush and fsync every shard's WAL without shutting the engine
    /// down. A durability checkpoint for callers that need writes on
    /// stable storage ahead of an abrupt exit (spec.md §8 scenario
    /// S3).
    pub async fn force_flush(&self) -> Result<()> {
        self.wal.flush_and_sync_all().await
    }

    pub async fn create_coordinated_checkpoint(&self) -> Result<CoordinatedCheckpointMeta> {
        Ok(self.wal.create_coordinated_checkpoint(&self.tables).await?.meta)
    }

    pub async fn recover_all_shards(&self) -> CoordinatedRecoveryResult {
        self.wal.recover_all_shards(&self.tables).await
    }

    pub async fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            wal: self.wal.aggregate_stats().await,
            cache: self.cache.metrics(),
            balancer: self.balancer.stats(),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.wal.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_root: dir.to_path_buf(),
            use_numbered_shards: true,
            num_numbered_shards: 4,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn put_rejects_oversized_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_cfg(dir.path())).await.unwrap();
        let oversized_key = vec![b'k'; MAX_KEY_LEN + 1];
        let result = engine.put(oversized_key, b"v".to_vec(), PutOptions::default()).await;
        assert!(matches!(result, Err(WarpError::InvalidInput(_))));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_cfg(dir.path())).await.unwrap();
        engine
            .put(b"user:1".to_vec(), b"alice".to_vec(), PutOptions::default())
            .await
            .unwrap();
        let got = engine.get(b"user:1").await.unwrap().unwrap();
        assert_eq!(got.value, b"alice");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delete_invalidates_cache_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_cfg(dir.path())).await.unwrap();
        engine.put(b"k".to_vec(), b"v1".to_vec(), PutOptions::default()).await.unwrap();
        engine.get(b"k").await.unwrap();
        engine.delete(b"k").await.unwrap();
        assert!(engine.get(b"k").await.unwrap().is_none());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_then_restart_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(test_cfg(dir.path())).await.unwrap();
            for i in 0..50u32 {
                engine
                    .put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes(), PutOptions::default())
                    .await
                    .unwrap();
            }
            engine.create_coordinated_checkpoint().await.unwrap();
            for i in 50..80u32 {
                engine
                    .put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes(), PutOptions::default())
                    .await
                    .unwrap();
            }
            engine.shutdown().await.unwrap();
        }

        let engine2 = Engine::open(test_cfg(dir.path())).await.unwrap();
        for i in 0..80u32 {
            let got = engine2.get(format!("k{i}").as_bytes()).await.unwrap().unwrap();
            assert_eq!(got.value, format!("v{i}").into_bytes());
        }
        engine2.shutdown().await.unwrap();
    }
}
