//! C4 — the Spacetime Shard Store: one concurrent hash map per shard,
//! the primary source of truth for reads.
//!
//! Reads never coordinate with the WAL. The only writer is the
//! Operations Layer (`crate::engine::Engine`); background tasks
//! (checkpointing, eviction review) only ever read.

use crate::metadata::CosmicMetadata;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// A single stored record: value plus its cosmic metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    pub metadata: CosmicMetadata,
}

/// One shard's in-memory table. `DashMap` gives us per-bucket locking
/// so concurrent readers never block each other and a writer only
/// blocks readers of the same bucket — the "intra-bucket lock only"
/// suspension point called out in the concurrency model.
#[derive(Default)]
pub struct ShardTable {
    inner: DashMap<Key, Record>,
}

impl ShardTable {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.inner.get(key).map(|r| r.clone())
    }

    pub fn put(&self, key: Key, record: Record) {
        self.inner.insert(key, record);
    }

    pub fn remove(&self, key: &[u8]) -> Option<Record> {
        self.inner.remove(key).map(|(_, r)| r)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Consistent per-entry snapshot for checkpointing. Not a globally
    /// atomic snapshot (per spec.md §4.6) — pairs with the sequence
    /// number read immediately before/after this call to bound replay.
    pub fn snapshot(&self) -> Vec<(Key, Record)> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Replace the table's contents wholesale, used by checkpoint
    /// restore during recovery.
    pub fn restore(&self, entries: Vec<(Key, Record)>) {
        self.inner.clear();
        for (k, v) in entries {
            self.inner.insert(k, v);
        }
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

/// The full set of shard tables, indexed by shard id. Built once at
/// engine startup and shared via `Arc` with the WAL coordinator and
/// load balancer — see the design notes on replacing process-dictionary
/// state with an explicit, index-addressed array.
pub struct ShardTables {
    tables: Vec<Arc<ShardTable>>,
}

impl ShardTables {
    pub fn new(num_shards: usize) -> Self {
        Self {
            tables: (0..num_shards).map(|_| Arc::new(ShardTable::new())).collect(),
        }
    }

    pub fn get(&self, shard_id: u8) -> Option<&Arc<ShardTable>> {
        self.tables.get(shard_id as usize)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Arc<ShardTable>)> {
        self.tables.iter().enumerate().map(|(i, t)| (i as u8, t))
    }
}
