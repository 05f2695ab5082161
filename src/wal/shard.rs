//! C2 — WAL Shard: the core hard problem. Each shard owns a dedicated
//! append-only log file, an atomic sequence counter, an in-memory
//! write buffer, and a background fsync task, so that no single writer
//! serializes the whole engine.

use super::checkpoint::{self, CheckpointMetadata, RecoverySummary};
use super::codec::{self, Operation, WalEntry};
use crate::error::{IoErrorKind, Result, WarpError};
use crate::store::ShardTable;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Shard worker state machine (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Accepting,
    Flushing,
    Checkpointing,
    Recovering,
    ShuttingDown,
}

impl ShardState {
    fn to_byte(self) -> u8 {
        match self {
            ShardState::Accepting => 0,
            ShardState::Flushing => 1,
            ShardState::Checkpointing => 2,
            ShardState::Recovering => 3,
            ShardState::ShuttingDown => 4,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0 => ShardState::Accepting,
            1 => ShardState::Flushing,
            2 => ShardState::Checkpointing,
            4 => ShardState::ShuttingDown,
            _ => ShardState::Recovering,
        }
    }
}

/// Hard flush triggers from spec.md §4.1.
pub struct FlushPolicy {
    pub batch_size: usize,
    pub mid_point_size: usize,
    pub flush_interval: Duration,
    pub mid_point_interval: Duration,
    pub hard_cap: usize,
}

impl FlushPolicy {
    pub fn from_config(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            batch_size: cfg.flush_batch_size,
            mid_point_size: cfg.flush_batch_size / 2,
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            mid_point_interval: Duration::from_millis(cfg.flush_interval_ms / 2),
            hard_cap: cfg.wal_buffer_cap,
        }
    }

    fn should_flush(&self, buffer_len: usize, since_last_flush: Duration) -> bool {
        buffer_len >= self.hard_cap
            || buffer_len >= self.batch_size
            || since_last_flush >= self.flush_interval
            || (buffer_len >= self.mid_point_size && since_last_flush >= self.mid_point_interval)
    }
}

#[derive(Debug, Default)]
struct ShardStatsInner {
    total_ops: AtomicU64,
    total_flushes: AtomicU64,
    total_flush_micros: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ShardStats {
    pub shard_id: u8,
    pub sequence: u64,
    pub buffer_len: usize,
    pub file_size: u64,
    pub total_ops: u64,
    pub total_flushes: u64,
    pub avg_flush_ms: f64,
    pub degraded: bool,
}

struct ProducerBuffer {
    entries: VecDeque<WalEntry>,
    oldest_at: Option<Instant>,
}

pub struct WalShard {
    pub shard_id: u8,
    path: PathBuf,
    sequence: AtomicU64,
    buffer: Mutex<ProducerBuffer>,
    file: Mutex<BufWriter<File>>,
    state: AtomicU8,
    degraded: AtomicBool,
    last_flush_at: Mutex<Instant>,
    stats: ShardStatsInner,
    policy: FlushPolicy,
}

fn io_err(kind: IoErrorKind) -> impl Fn(std::io::Error) -> WarpError {
    move |e| WarpError::io(kind, e)
}

impl WalShard {
    /// Open (creating if absent) the shard's log file. Starts in
    /// `Recovering` — callers must call `recover()` before `append()`.
    pub fn open(
        data_root: &std::path::Path,
        shard_id: u8,
        policy: FlushPolicy,
    ) -> Result<Self> {
        let wal_dir = checkpoint::wal_root(data_root);
        std::fs::create_dir_all(&wal_dir).map_err(io_err(IoErrorKind::Open))?;
        let path = checkpoint::wal_file_path(data_root, shard_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(io_err(IoErrorKind::Open))?;

        Ok(Self {
            shard_id,
            path,
            sequence: AtomicU64::new(0),
            buffer: Mutex::new(ProducerBuffer { entries: VecDeque::new(), oldest_at: None }),
            file: Mutex::new(BufWriter::new(file)),
            state: AtomicU8::new(ShardState::Recovering.to_byte()),
            degraded: AtomicBool::new(false),
            last_flush_at: Mutex::new(Instant::now()),
            stats: ShardStatsInner::default(),
            policy,
        })
    }

    pub fn state(&self) -> ShardState {
        ShardState::from_byte(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ShardState) {
        self.state.store(s.to_byte(), Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn mark_degraded(&self, reason: &str) {
        tracing::warn!(shard_id = self.shard_id, reason, "shard marked degraded");
        self.degraded.store(true, Ordering::Release);
    }

    /// Fast-path sequence allocation: a single atomic fetch-add, no
    /// lock, no message to any worker.
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append an operation to the shard's buffer. Returns the freshly
    /// allocated sequence number without waiting for disk I/O, unless
    /// the hard cap forces a synchronous flush first. Sequence
    /// allocation and the buffer push share one critical section, so
    /// concurrent producers land in sequence order.
    pub fn append(
        &self,
        operation: Operation,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        metadata: Vec<u8>,
    ) -> Result<u64> {
        if self.is_degraded() {
            return Err(WarpError::ShardUnavailable {
                shard_id: self.shard_id,
                reason: "shard is degraded after a prior I/O failure".to_string(),
            });
        }
        match self.state() {
            ShardState::ShuttingDown => {
                return Err(WarpError::ShardUnavailable {
                    shard_id: self.shard_id,
                    reason: "shard is shutting down".to_string(),
                })
            }
            ShardState::Recovering => {
                return Err(WarpError::ShardUnavailable {
                    shard_id: self.shard_id,
                    reason: "shard is still recovering".to_string(),
                })
            }
            _ => {}
        }

        // The sequence must be allocated inside the same critical section
        // that pushes the entry onto the buffer. Otherwise a thread that
        // grabs a low sequence can be preempted during `WalEntry::new`
        // (gzip + MD5) while a later-sequenced thread slips its entry in
        // first, and the buffer ends up out of sequence order. §5
        // requires arrival order in the file to equal sequence order.
        let (sequence, hit_hard_cap) = {
            let mut buf = self.buffer.lock();
            let sequence = self.next_sequence();
            let timestamp_us = now_micros();
            let entry = WalEntry::new(sequence, timestamp_us, operation, key, value, metadata);
            if buf.entries.is_empty() {
                buf.oldest_at = Some(Instant::now());
            }
            buf.entries.push_back(entry);
            self.stats.total_ops.fetch_add(1, Ordering::Relaxed);
            (sequence, buf.entries.len() >= self.policy.hard_cap)
        };

        if hit_hard_cap {
            self.force_flush()?;
        }

        Ok(sequence)
    }

    /// True if the flush-trigger task should flush right now.
    pub fn should_flush(&self) -> bool {
        let buf = self.buffer.lock();
        if buf.entries.is_empty() {
            return false;
        }
        let since = buf.oldest_at.map(|t| t.elapsed()).unwrap_or_default();
        self.policy.should_flush(buf.entries.len(), since)
    }

    /// Encode all buffered entries into one batch and write it with a
    /// single `write` syscall. Does not fsync.
    pub fn force_flush(&self) -> Result<()> {
        if self.is_degraded() {
            return Err(WarpError::ShardUnavailable {
                shard_id: self.shard_id,
                reason: "shard is degraded after a prior I/O failure".to_string(),
            });
        }
        self.set_state(ShardState::Flushing);
        let start = Instant::now();

        let entries: Vec<WalEntry> = {
            let mut buf = self.buffer.lock();
            if buf.entries.is_empty() {
                self.set_state(ShardState::Accepting);
                return Ok(());
            }
            buf.oldest_at = None;
            buf.entries.drain(..).collect()
        };

        let batch: BytesMut = codec::encode_batch(&entries, now_micros());
        let write_result = {
            let mut file = self.file.lock();
            file.write_all(&batch).and_then(|_| file.flush())
        };

        if let Err(e) = write_result {
            self.mark_degraded("flush write failed");
            self.set_state(ShardState::Accepting);
            return Err(WarpError::io(IoErrorKind::Write, e));
        }

        self.stats.total_flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_flush_micros
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        *self.last_flush_at.lock() = Instant::now();

        self.set_state(ShardState::Accepting);
        Ok(())
    }

    /// Ask the OS to persist the file's bytes to stable storage. Does
    /// not imply a buffer flush — callers that need both call
    /// `force_flush()` then `fsync()`.
    pub fn fsync(&self) -> Result<()> {
        let file = self.file.lock();
        file.get_ref()
            .sync_all()
            .map_err(io_err(IoErrorKind::Fsync))
    }

    pub fn stats(&self) -> ShardStats {
        let total_flushes = self.stats.total_flushes.load(Ordering::Relaxed);
        let total_flush_micros = self.stats.total_flush_micros.load(Ordering::Relaxed);
        let avg_flush_ms = if total_flushes == 0 {
            0.0
        } else {
            (total_flush_micros as f64 / total_flushes as f64) / 1000.0
        };
        let file_size = self
            .file
            .lock()
            .get_ref()
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0);

        ShardStats {
            shard_id: self.shard_id,
            sequence: self.sequence.load(Ordering::SeqCst),
            buffer_len: self.buffer.lock().entries.len(),
            file_size,
            total_ops: self.stats.total_ops.load(Ordering::Relaxed),
            total_flushes,
            avg_flush_ms,
            degraded: self.is_degraded(),
        }
    }

    /// Snapshot the shard's table and write a checkpoint, flushing the
    /// buffer first (spec.md §4.8 step 1).
    pub fn create_checkpoint(
        &self,
        data_root: &std::path::Path,
        table: &ShardTable,
    ) -> Result<CheckpointMetadata> {
        self.set_state(ShardState::Checkpointing);
        let result = (|| {
            self.force_flush()?;
            let sequence = self.sequence.load(Ordering::SeqCst);
            checkpoint::write_checkpoint(data_root, self.shard_id, sequence, table)
        })();
        self.set_state(ShardState::Accepting);
        result
    }

    /// Recovery per spec.md §4.8: restore the latest checkpoint if
    /// any, then replay WAL entries with sequence greater than the
    /// checkpoint's, applying Put/Delete to `table` in order. A
    /// corrupt tail is truncated at the first failed checksum.
    pub fn recover(&self, data_root: &std::path::Path, table: &ShardTable) -> Result<RecoverySummary> {
        self.set_state(ShardState::Recovering);
        let result = self.recover_inner(data_root, table);
        self.set_state(ShardState::Accepting);
        result
    }

    fn recover_inner(
        &self,
        data_root: &std::path::Path,
        table: &ShardTable,
    ) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary { shard_id: self.shard_id, ..Default::default() };

        if !self.path.exists() {
            self.sequence.store(0, Ordering::SeqCst);
            summary.final_sequence = 0;
            return Ok(summary);
        }

        let checkpoint_seq = match checkpoint::latest_checkpoint(data_root, self.shard_id)? {
            Some(meta) => {
                let snapshot = checkpoint::load_snapshot(data_root, self.shard_id, &meta.checkpoint_id)?;
                table.restore(snapshot);
                summary.checkpoint_used = true;
                meta.sequence_number
            }
            None => {
                table.clear();
                0
            }
        };

        let bytes = std::fs::read(&self.path).map_err(io_err(IoErrorKind::Read))?;
        let decode_result = codec::decode_all_batches(&bytes);

        // Last-write-wins during replay depends on sequence order, not
        // file order. `append` buffers entries in sequence order, but
        // sort here too in case a batch ever lands out of order.
        let mut entries: Vec<&WalEntry> = decode_result.entries.iter().collect();
        entries.sort_by_key(|e| e.sequence);

        let mut last_sequence = checkpoint_seq;
        for entry in entries {
            if entry.sequence <= checkpoint_seq {
                continue;
            }
            apply_entry(table, entry)?;
            summary.entries_replayed += 1;
            last_sequence = last_sequence.max(entry.sequence);
        }

        if decode_result.truncated {
            summary.corrupt_tail_bytes_truncated = (bytes.len() - decode_result.valid_len) as u64;
            truncate_to(&self.path, decode_result.valid_len)?;
        }

        let next_sequence = last_sequence.max(checkpoint_seq);
        self.sequence.store(next_sequence, Ordering::SeqCst);
        summary.final_sequence = next_sequence;

        Ok(summary)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.set_state(ShardState::ShuttingDown);
        self.force_flush()?;
        self.fsync()?;
        Ok(())
    }
}

fn apply_entry(table: &ShardTable, entry: &WalEntry) -> Result<()> {
    match entry.operation {
        Operation::Put => {
            let value = entry.plaintext_value()?.unwrap_or_default();
            let metadata = crate::metadata::decode(&entry.metadata)?;
            table.put(entry.key.clone(), crate::store::Record { value, metadata });
        }
        Operation::Delete => {
            table.remove(&entry.key);
        }
        Operation::Get | Operation::QuantumGet => {}
    }
    Ok(())
}

fn truncate_to(path: &std::path::Path, len: usize) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(io_err(IoErrorKind::Open))?;
    file.set_len(len as u64).map_err(io_err(IoErrorKind::Write))?;
    Ok(())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Spawn the per-shard flush-trigger and fsync background tasks.
/// Returns their join handles so the coordinator can abort them on
/// shutdown.
pub fn spawn_background_tasks(
    shard: Arc<WalShard>,
    fsync_interval_ms: u64,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let flush_shard = shard.clone();
    let flush_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        loop {
            ticker.tick().await;
            if flush_shard.state() == ShardState::ShuttingDown {
                return;
            }
            if flush_shard.should_flush() {
                if let Err(e) = flush_shard.force_flush() {
                    tracing::error!(shard_id = flush_shard.shard_id, error = %e, "flush failed");
                }
            }
        }
    });

    let fsync_shard = shard;
    let fsync_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(fsync_interval_ms.max(1)));
        loop {
            ticker.tick().await;
            if fsync_shard.state() == ShardState::ShuttingDown {
                return;
            }
            let shard = fsync_shard.clone();
            let result = tokio::task::spawn_blocking(move || shard.fsync()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(shard_id = fsync_shard.shard_id, error = %e, "fsync failed, retrying next interval"),
                Err(e) => tracing::warn!(shard_id = fsync_shard.shard_id, error = %e, "fsync task panicked"),
            }
        }
    });

    (flush_task, fsync_task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn test_shard(dir: &std::path::Path, shard_id: u8) -> WalShard {
        let cfg = EngineConfig::default();
        WalShard::open(dir, shard_id, FlushPolicy::from_config(&cfg)).unwrap()
    }

    #[test]
    fn sequence_increases_monotonically_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path(), 0);
        shard.set_state(ShardState::Accepting);
        let mut last = 0u64;
        for i in 0..100 {
            let seq = shard
                .append(Operation::Put, format!("k{i}").into_bytes(), Some(b"v".to_vec()), vec![])
                .unwrap();
            assert_eq!(seq, last + 1);
            last = seq;
        }
    }

    #[test]
    fn concurrent_appends_buffer_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Arc::new(test_shard(dir.path(), 0));
        shard.set_state(ShardState::Accepting);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let shard = Arc::clone(&shard);
                std::thread::spawn(move || {
                    shard
                        .append(Operation::Put, format!("k{i}").into_bytes(), Some(b"v".to_vec()), vec![])
                        .unwrap()
                })
            })
            .collect();
        let sequences: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Every thread's returned sequence must match the position its
        // entry actually landed at in the buffer: arrival order in the
        // queue equals sequence order, with no gaps or duplicates.
        let buffered: Vec<u64> = shard.buffer.lock().entries.iter().map(|e| e.sequence).collect();
        let mut expected: Vec<u64> = sequences.clone();
        expected.sort_unstable();
        assert_eq!(expected, (1..=16).collect::<Vec<u64>>());
        assert_eq!(buffered, expected);
    }

    #[test]
    fn force_flush_persists_and_clears_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path(), 0);
        shard.set_state(ShardState::Accepting);
        shard.append(Operation::Put, b"k".to_vec(), Some(b"v".to_vec()), vec![]).unwrap();
        assert_eq!(shard.stats().buffer_len, 1);
        shard.force_flush().unwrap();
        assert_eq!(shard.stats().buffer_len, 0);
        assert!(shard.stats().file_size > 0);
    }

    #[test]
    fn recovery_replays_flushed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardTable::new();
        {
            let shard = test_shard(dir.path(), 0);
            shard.set_state(ShardState::Accepting);
            for i in 0..10 {
                shard
                    .append(
                        Operation::Put,
                        format!("k{i}").into_bytes(),
                        Some(format!("v{i}").into_bytes()),
                        vec![],
                    )
                    .unwrap();
            }
            shard.force_flush().unwrap();
        }

        let shard2 = test_shard(dir.path(), 0);
        let summary = shard2.recover(dir.path(), &table).unwrap();
        assert_eq!(summary.entries_replayed, 10);
        assert_eq!(table.len(), 10);
        assert_eq!(table.get(b"k5").unwrap().value, b"v5");
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardTable::new();
        {
            let shard = test_shard(dir.path(), 0);
            shard.set_state(ShardState::Accepting);
            shard.append(Operation::Put, b"k".to_vec(), Some(b"v".to_vec()), vec![]).unwrap();
            shard.force_flush().unwrap();
        }
        let shard2 = test_shard(dir.path(), 0);
        let s1 = shard2.recover(dir.path(), &table).unwrap();
        let snap1 = table.snapshot();
        let s2 = shard2.recover(dir.path(), &table).unwrap();
        let snap2 = table.snapshot();
        assert_eq!(s1.entries_replayed, s2.entries_replayed);
        assert_eq!(snap1, snap2);
    }

    #[test]
    fn checkpoint_subsumes_prior_entries() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardTable::new();
        let checkpoint_seq;
        {
            let shard = test_shard(dir.path(), 0);
            shard.set_state(ShardState::Accepting);
            for i in 0..5 {
                shard
                    .append(Operation::Put, format!("k{i}").into_bytes(), Some(b"v".to_vec()), vec![])
                    .unwrap();
            }
            let meta = shard.create_checkpoint(dir.path(), &checkpoint_source_table()).unwrap();
            checkpoint_seq = meta.sequence_number;
            for i in 5..8 {
                shard
                    .append(Operation::Put, format!("k{i}").into_bytes(), Some(b"v".to_vec()), vec![])
                    .unwrap();
            }
            shard.force_flush().unwrap();
        }
        assert_eq!(checkpoint_seq, 5);

        let shard2 = test_shard(dir.path(), 0);
        let summary = shard2.recover(dir.path(), &table).unwrap();
        assert!(summary.checkpoint_used);
        assert_eq!(summary.entries_replayed, 3);
        assert_eq!(table.len(), 8);
    }

    fn checkpoint_source_table() -> ShardTable {
        let t = ShardTable::new();
        for i in 0..5 {
            t.put(
                format!("k{i}").into_bytes(),
                crate::store::Record { value: b"v".to_vec(), metadata: crate::metadata::CosmicMetadata::new() },
            );
        }
        t
    }
}
