//! C8 — Checkpoint & Recovery: snapshot encoding, sidecar metadata, and
//! the filesystem layout under `<data_root>/wal/checkpoints/<shard>/`.

use crate::error::{IoErrorKind, Result, WarpError};
use crate::store::{Key, Record, ShardTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// How many checkpoints to retain per shard before pruning the oldest.
pub const RETENTION_PER_SHARD: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub shard_id: u8,
    pub checkpoint_id: String,
    pub sequence_number: u64,
    pub created_at: u64,
}

/// Result of replaying a shard's WAL against a (possibly absent)
/// checkpoint.
#[derive(Debug, Clone, Default)]
pub struct RecoverySummary {
    pub shard_id: u8,
    pub checkpoint_used: bool,
    pub entries_replayed: u64,
    pub corrupt_tail_bytes_truncated: u64,
    pub final_sequence: u64,
}

/// Coordinator-level record listing the per-shard checkpoints taken in
/// one coordinated pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatedCheckpointMeta {
    pub coordinated_checkpoint_id: String,
    pub created_at: u64,
    pub shard_checkpoints: Vec<CheckpointMetadata>,
    pub failed_shards: Vec<u8>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn random_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

pub fn new_checkpoint_id() -> String {
    format!("checkpoint_{}_{}", now_ms(), random_suffix())
}

pub fn new_coordinated_checkpoint_id() -> String {
    format!("coordinated_checkpoint_{}_{}", now_ms(), random_suffix())
}

pub fn wal_root(data_root: &Path) -> PathBuf {
    data_root.join("wal")
}

pub fn wal_file_path(data_root: &Path, shard_id: u8) -> PathBuf {
    wal_root(data_root).join(format!("cosmic_{shard_id}.wal"))
}

pub fn checkpoints_dir(data_root: &Path, shard_id: u8) -> PathBuf {
    wal_root(data_root).join("checkpoints").join(shard_id.to_string())
}

pub fn checkpoint_dir(data_root: &Path, shard_id: u8, checkpoint_id: &str) -> PathBuf {
    checkpoints_dir(data_root, shard_id).join(checkpoint_id)
}

pub fn coordinated_checkpoints_dir(data_root: &Path) -> PathBuf {
    wal_root(data_root).join("coordinated_checkpoints")
}

fn io_err(kind: IoErrorKind) -> impl Fn(std::io::Error) -> WarpError {
    move |e| WarpError::io(kind, e)
}

/// Write a shard's table snapshot and sidecar metadata to disk,
/// returning the metadata written.
pub fn write_checkpoint(
    data_root: &Path,
    shard_id: u8,
    sequence_number: u64,
    table: &ShardTable,
) -> Result<CheckpointMetadata> {
    let checkpoint_id = new_checkpoint_id();
    let dir = checkpoint_dir(data_root, shard_id, &checkpoint_id);
    std::fs::create_dir_all(&dir).map_err(io_err(IoErrorKind::Open))?;

    let snapshot = table.snapshot();
    let encoded: Vec<u8> = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
    std::fs::write(dir.join("table.snap"), encoded).map_err(io_err(IoErrorKind::Write))?;

    let metadata = CheckpointMetadata {
        shard_id,
        checkpoint_id,
        sequence_number,
        created_at: now_ms(),
    };
    let metadata_json = serde_json::to_vec_pretty(&metadata)?;
    std::fs::write(dir.join("metadata.json"), metadata_json).map_err(io_err(IoErrorKind::Write))?;

    prune_old_checkpoints(data_root, shard_id)?;

    Ok(metadata)
}

/// Find the most recent checkpoint for a shard by `created_at`, if any.
pub fn latest_checkpoint(data_root: &Path, shard_id: u8) -> Result<Option<CheckpointMetadata>> {
    let dir = checkpoints_dir(data_root, shard_id);
    if !dir.exists() {
        return Ok(None);
    }
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(io_err(IoErrorKind::Read))? {
        let entry = entry.map_err(io_err(IoErrorKind::Read))?;
        let meta_path = entry.path().join("metadata.json");
        if let Ok(bytes) = std::fs::read(&meta_path) {
            if let Ok(meta) = serde_json::from_slice::<CheckpointMetadata>(&bytes) {
                candidates.push(meta);
            }
        }
    }
    candidates.sort_by_key(|m| m.created_at);
    Ok(candidates.into_iter().next_back())
}

/// Load a checkpoint's table snapshot into `(key, record)` pairs.
pub fn load_snapshot(
    data_root: &Path,
    shard_id: u8,
    checkpoint_id: &str,
) -> Result<Vec<(Key, Record)>> {
    let path = checkpoint_dir(data_root, shard_id, checkpoint_id).join("table.snap");
    let bytes = std::fs::read(&path).map_err(io_err(IoErrorKind::Read))?;
    let (snapshot, _): (Vec<(Key, Record)>, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
    Ok(snapshot)
}

/// Keep only the `RETENTION_PER_SHARD` most recent checkpoints for a
/// shard; delete the rest.
pub fn prune_old_checkpoints(data_root: &Path, shard_id: u8) -> Result<()> {
    let dir = checkpoints_dir(data_root, shard_id);
    if !dir.exists() {
        return Ok(());
    }
    let mut candidates: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(io_err(IoErrorKind::Read))? {
        let entry = entry.map_err(io_err(IoErrorKind::Read))?;
        let meta_path = entry.path().join("metadata.json");
        if let Ok(bytes) = std::fs::read(&meta_path) {
            if let Ok(meta) = serde_json::from_slice::<CheckpointMetadata>(&bytes) {
                candidates.push((meta.created_at, entry.path()));
            }
        }
    }
    candidates.sort_by_key(|(created_at, _)| *created_at);
    if candidates.len() > RETENTION_PER_SHARD {
        let to_remove = candidates.len() - RETENTION_PER_SHARD;
        for (_, path) in candidates.into_iter().take(to_remove) {
            let _ = std::fs::remove_dir_all(path);
        }
    }
    Ok(())
}

pub fn write_coordinated_checkpoint_meta(
    data_root: &Path,
    meta: &CoordinatedCheckpointMeta,
) -> Result<PathBuf> {
    let dir = coordinated_checkpoints_dir(data_root);
    std::fs::create_dir_all(&dir).map_err(io_err(IoErrorKind::Open))?;
    let path = dir.join(format!("{}_metadata.json", meta.coordinated_checkpoint_id));
    std::fs::write(&path, serde_json::to_vec_pretty(meta)?).map_err(io_err(IoErrorKind::Write))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CosmicMetadata;

    #[test]
    fn checkpoint_round_trips_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardTable::new();
        table.put(
            b"k".to_vec(),
            Record { value: b"v".to_vec(), metadata: CosmicMetadata::new() },
        );

        let meta = write_checkpoint(dir.path(), 0, 42, &table).unwrap();
        assert_eq!(meta.sequence_number, 42);

        let latest = latest_checkpoint(dir.path(), 0).unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, meta.checkpoint_id);

        let snapshot = load_snapshot(dir.path(), 0, &latest.checkpoint_id).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, b"k");
    }

    #[test]
    fn retention_keeps_only_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardTable::new();
        for i in 0..5 {
            write_checkpoint(dir.path(), 0, i, &table).unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(checkpoints_dir(dir.path(), 0))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), RETENTION_PER_SHARD);
    }
}
