//! C3 — WAL Coordinator: lifecycle of all shard workers and
//! cross-shard operations. Does not sit on the write path.

use super::checkpoint::{self, CoordinatedCheckpointMeta, RecoverySummary};
use super::shard::{spawn_background_tasks, FlushPolicy, ShardStats, WalShard};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::store::ShardTables;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardHealth {
    Healthy,
    Degraded,
    Dead,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub per_shard: Vec<(u8, ShardHealth)>,
    pub overall_healthy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    pub per_shard: Vec<ShardStats>,
    pub total_ops: u64,
    pub total_flushes: u64,
}

/// Result of a coordinated checkpoint across all shards. Partial
/// failure is tolerated: `meta.failed_shards` lists which shards did
/// not complete.
pub struct CoordinatedCheckpointResult {
    pub meta: CoordinatedCheckpointMeta,
}

/// Result of a coordinated recovery across all shards.
#[derive(Debug, Clone, Default)]
pub struct CoordinatedRecoveryResult {
    pub per_shard: Vec<RecoverySummary>,
    pub degraded_shards: Vec<u8>,
}

/// Owns one `WalShard` per configured shard id — the explicit
/// `ShardHandle[N]` array called for in spec.md §9, replacing a
/// name-based process registry.
pub struct WalCoordinator {
    data_root: PathBuf,
    shards: Vec<Arc<WalShard>>,
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WalCoordinator {
    /// Start all configured shard workers and run their recovery,
    /// verifying each reaches `Accepting` before returning.
    pub async fn start_all_shards(cfg: &EngineConfig, tables: &ShardTables) -> Result<Self> {
        let num_shards = tables.len();
        let mut shards = Vec::with_capacity(num_shards);
        for shard_id in 0..num_shards as u8 {
            let policy = FlushPolicy::from_config(cfg);
            let shard = Arc::new(WalShard::open(&cfg.data_root, shard_id, policy)?);
            shards.push(shard);
        }

        let coordinator = Self {
            data_root: cfg.data_root.clone(),
            shards,
            background_tasks: Mutex::new(Vec::new()),
        };

        coordinator.recover_all_shards(tables).await;

        let mut handles = coordinator.background_tasks.lock();
        for shard in &coordinator.shards {
            let (flush, fsync) = spawn_background_tasks(shard.clone(), cfg.fsync_interval_ms);
            handles.push(flush);
            handles.push(fsync);
        }
        drop(handles);

        Ok(coordinator)
    }

    pub fn shard(&self, shard_id: u8) -> Option<&Arc<WalShard>> {
        self.shards.get(shard_id as usize)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub async fn aggregate_stats(&self) -> AggregateStats {
        let per_shard: Vec<ShardStats> = self.shards.iter().map(|s| s.stats()).collect();
        let total_ops = per_shard.iter().map(|s| s.total_ops).sum();
        let total_flushes = per_shard.iter().map(|s| s.total_flushes).sum();
        AggregateStats { per_shard, total_ops, total_flushes }
    }

    /// Request all shards to checkpoint in parallel; write a
    /// coordinator-level metadata record listing per-shard checkpoint
    /// ids. Tolerates partial failure.
    pub async fn create_coordinated_checkpoint(
        &self,
        tables: &ShardTables,
    ) -> Result<CoordinatedCheckpointResult> {
        let data_root = self.data_root.clone();
        let futures = self.shards.iter().map(|shard| {
            let data_root = data_root.clone();
            let shard = shard.clone();
            let table = tables.get(shard.shard_id).cloned();
            async move {
                match table {
                    Some(table) => {
                        let shard_for_blocking = shard.clone();
                        tokio::task::spawn_blocking(move || {
                            shard_for_blocking.create_checkpoint(&data_root, &table)
                        })
                        .await
                        .map_err(|e| {
                            crate::error::WarpError::IoError {
                                kind: crate::error::IoErrorKind::Write,
                                source: std::io::Error::other(e.to_string()),
                            }
                        })
                        .and_then(|r| r)
                    }
                    None => Err(crate::error::WarpError::ShardUnavailable {
                        shard_id: shard.shard_id,
                        reason: "no table for shard".to_string(),
                    }),
                }
            }
        });

        let results = futures::future::join_all(futures).await;

        let mut shard_checkpoints = Vec::new();
        let mut failed_shards = Vec::new();
        for (i, r) in results.into_iter().enumerate() {
            match r {
                Ok(meta) => shard_checkpoints.push(meta),
                Err(e) => {
                    tracing::warn!(shard_id = i, error = %e, "shard checkpoint failed");
                    failed_shards.push(i as u8);
                }
            }
        }

        let meta = CoordinatedCheckpointMeta {
            coordinated_checkpoint_id: checkpoint::new_coordinated_checkpoint_id(),
            created_at: checkpoint::now_ms(),
            shard_checkpoints,
            failed_shards,
        };
        checkpoint::write_coordinated_checkpoint_meta(&self.data_root, &meta)?;

        Ok(CoordinatedCheckpointResult { meta })
    }

    /// Run per-shard recovery in parallel. A shard's failure to
    /// recover does not block others.
    pub async fn recover_all_shards(&self, tables: &ShardTables) -> CoordinatedRecoveryResult {
        let data_root = self.data_root.clone();
        let futures = self.shards.iter().map(|shard| {
            let data_root = data_root.clone();
            let shard = shard.clone();
            let table = tables.get(shard.shard_id).cloned();
            async move {
                match table {
                    Some(table) => {
                        let shard_for_blocking = shard.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            shard_for_blocking.recover(&data_root, &table)
                        })
                        .await;
                        (shard.shard_id, result.ok().and_then(|r| r.ok()))
                    }
                    None => (shard.shard_id, None),
                }
            }
        });

        let results = futures::future::join_all(futures).await;
        let mut per_shard = Vec::new();
        let mut degraded_shards = Vec::new();
        for (shard_id, summary) in results {
            match summary {
                Some(s) => per_shard.push(s),
                None => degraded_shards.push(shard_id),
            }
        }
        CoordinatedRecoveryResult { per_shard, degraded_shards }
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut per_shard = Vec::new();
        let mut overall_healthy = true;
        for shard in &self.shards {
            let health = if shard.is_degraded() {
                overall_healthy = false;
                ShardHealth::Degraded
            } else {
                ShardHealth::Healthy
            };
            per_shard.push((shard.shard_id, health));
        }
        HealthReport { per_shard, overall_healthy }
    }

    /// Run an operation with a timeout, mapping an exceeded budget to
    /// `WarpError::TimeoutError` per spec.md §5.
    pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| crate::error::WarpError::TimeoutError(duration))
    }

    /// Force every shard to flush its buffer and fsync, without
    /// entering `ShuttingDown` or stopping background tasks. Lets a
    /// caller establish a durability point mid-lifetime (spec.md §8
    /// scenario S3: crash after fsync must not lose the write).
    pub async fn flush_and_sync_all(&self) -> Result<()> {
        for shard in &self.shards {
            let shard = shard.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                shard.force_flush()?;
                shard.fsync()?;
                Ok(())
            })
            .await
            .map_err(|e| crate::error::WarpError::IoError {
                kind: crate::error::IoErrorKind::Write,
                source: std::io::Error::other(e.to_string()),
            })??;
        }
        Ok(())
    }

    /// Signal `ShuttingDown` to each shard; each drains its buffer,
    /// fsyncs, and exits.
    pub async fn shutdown(&self) -> Result<()> {
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
        for shard in &self.shards {
            shard.shutdown().await?;
        }
        Ok(())
    }
}
