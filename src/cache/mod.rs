//! C6 — the Event-Horizon Cache: a multi-tier read-through/write-through
//! cache sitting in front of the primary store. Each tier is an
//! independent `dashmap::DashMap`, so a single-key `put`/`get` never
//! takes an explicit lock; only eviction passes iterate a tier's
//! shards at a time, hottest to coldest, matching the store's own
//! cross-tier lock ordering.

use crate::hints::{CompressionHint, Priority};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Key = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L0Accretion,
    L1Horizon,
    L2Photon,
    L3Deep,
    L4Singularity,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::L0Accretion,
        Level::L1Horizon,
        Level::L2Photon,
        Level::L3Deep,
        Level::L4Singularity,
    ];

    fn index(self) -> usize {
        match self {
            Level::L0Accretion => 0,
            Level::L1Horizon => 1,
            Level::L2Photon => 2,
            Level::L3Deep => 3,
            Level::L4Singularity => 4,
        }
    }

    /// Relative access cost, used only for metrics reporting.
    pub fn access_cost(self) -> f64 {
        match self {
            Level::L0Accretion => 1.2,
            Level::L1Horizon => 1.0,
            Level::L2Photon => 1.5,
            Level::L3Deep => 3.0,
            Level::L4Singularity => 10.0,
        }
    }

    /// Whether entries admitted at this level are compressed on write.
    fn is_compressed(self) -> bool {
        matches!(self, Level::L2Photon | Level::L3Deep | Level::L4Singularity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionIntensity {
    Mild,
    Normal,
    Aggressive,
    Emergency,
}

impl EvictionIntensity {
    fn fraction(self) -> f64 {
        match self {
            EvictionIntensity::Mild => 0.05,
            EvictionIntensity::Normal => 0.10,
            EvictionIntensity::Aggressive => 0.20,
            EvictionIntensity::Emergency => 0.30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapacityState {
    Safe,
    ApproachingLimit,
    LimitReached,
}

struct CacheEntry {
    bytes: Vec<u8>,
    original_size: u64,
    compressed_size: u64,
    level: Level,
    stored_at_ms: u64,
    access_count: AtomicU64,
    last_accessed_ms: AtomicU64,
    priority_protection_flag: bool,
    /// Absolute expiry from the caller's `ttl_ms`, if any. Checked
    /// lazily on `get`; an expired entry is evicted on the spot and
    /// treated as a miss rather than swept by a background task.
    expires_at_ms: Option<u64>,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|exp| now_ms >= exp)
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            original_size: self.original_size,
            compressed_size: self.compressed_size,
            level: self.level,
            stored_at_ms: self.stored_at_ms,
            access_count: AtomicU64::new(self.access_count.load(Ordering::Relaxed)),
            last_accessed_ms: AtomicU64::new(self.last_accessed_ms.load(Ordering::Relaxed)),
            priority_protection_flag: self.priority_protection_flag,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Outcome of a `put` into the cache.
#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    pub level: Level,
    pub compression_ratio: f64,
    pub op_time_us: u64,
}

/// Outcome of a `get`.
pub enum GetOutcome {
    Hit { value: Vec<u8>, level: Level, op_time_us: u64 },
    Miss,
}

#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub intensity_name: &'static str,
    pub evicted_per_level: Vec<(u8, usize)>,
    pub total_evicted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    pub size: usize,
    pub capacity_limit: usize,
    pub per_level_count: Vec<(u8, usize)>,
    pub hits: u64,
    pub misses: u64,
    pub evictions_triggered: u64,
}

struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions_triggered: AtomicU64,
}

impl Default for TierStats {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions_triggered: AtomicU64::new(0),
        }
    }
}

/// A read-through/write-through cache with 5 tiers of increasing
/// compression and access cost (spec.md §4.4's "Event-Horizon" table).
pub struct EventHorizonCache {
    tiers: [DashMap<Key, CacheEntry>; 5],
    capacity_limit: usize,
    promotion_threshold: u64,
    stats: TierStats,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
    crate::wal::codec::compress(crate::wal::codec::Compression::Gzip, data)
}

fn gzip_decompress(data: &[u8]) -> crate::error::Result<Vec<u8>> {
    crate::wal::codec::decompress(crate::wal::codec::Compression::Gzip, data)
}

impl EventHorizonCache {
    pub fn new(capacity_limit: usize) -> Self {
        Self {
            tiers: [
                DashMap::new(),
                DashMap::new(),
                DashMap::new(),
                DashMap::new(),
                DashMap::new(),
            ],
            capacity_limit,
            promotion_threshold: 4,
            stats: TierStats::default(),
        }
    }

    fn tier(&self, level: Level) -> &DashMap<Key, CacheEntry> {
        &self.tiers[level.index()]
    }

    fn total_len(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }

    fn capacity_state(&self) -> CapacityState {
        if self.capacity_limit == 0 {
            return CapacityState::Safe;
        }
        let ratio = self.total_len() as f64 / self.capacity_limit as f64;
        if ratio >= 1.0 {
            CapacityState::LimitReached
        } else if ratio >= 0.9 {
            CapacityState::ApproachingLimit
        } else {
            CapacityState::Safe
        }
    }

    /// Choose the admission level for a put from `(priority, serialized_size)`
    /// per spec.md §4.4's admission table.
    fn admission_level(priority: Priority, size: usize) -> Level {
        const KIB: usize = 1024;
        match priority {
            Priority::Critical if size < 10 * KIB => Level::L1Horizon,
            Priority::Critical if size < 50 * KIB => Level::L1Horizon,
            Priority::Normal | Priority::High if size < 100 * KIB => Level::L2Photon,
            Priority::Low | Priority::Background => Level::L3Deep,
            _ => Level::L2Photon,
        }
    }

    /// Insert `value` under `key`, running an eviction pass first if the
    /// cache is at or approaching capacity.
    pub fn put(
        &self,
        key: Key,
        value: &[u8],
        priority: Priority,
        compression_hint: CompressionHint,
        ttl_ms: Option<u64>,
    ) -> PutOutcome {
        let start = std::time::Instant::now();
        let stored_at_ms = now_ms();
        let expires_at_ms = ttl_ms.map(|ttl| stored_at_ms.saturating_add(ttl));

        match self.capacity_state() {
            CapacityState::ApproachingLimit => {
                self.emit_eviction(EvictionIntensity::Mild);
            }
            CapacityState::LimitReached => {
                self.emit_eviction(EvictionIntensity::Emergency);
            }
            CapacityState::Safe => {}
        }

        self.remove(&key);

        let level = Self::admission_level(priority, value.len());
        let compress = match compression_hint {
            CompressionHint::ForceCompressed => true,
            CompressionHint::ForceUncompressed => false,
            CompressionHint::Auto => level.is_compressed(),
        };

        let original_size = value.len() as u64;
        let bytes = if compress { gzip_compress(value) } else { value.to_vec() };
        let compressed_size = bytes.len() as u64;

        let entry = CacheEntry {
            bytes,
            original_size,
            compressed_size,
            level,
            stored_at_ms,
            access_count: AtomicU64::new(0),
            last_accessed_ms: AtomicU64::new(stored_at_ms),
            priority_protection_flag: priority == Priority::Critical,
            expires_at_ms,
        };
        self.tier(level).insert(key, entry);

        let compression_ratio = if compressed_size == 0 {
            1.0
        } else {
            original_size as f64 / compressed_size as f64
        };

        PutOutcome {
            level,
            compression_ratio,
            op_time_us: start.elapsed().as_micros() as u64,
        }
    }

    /// Look up `key` across all tiers, decompressing on hit and
    /// bumping the entry's access bookkeeping.
    pub fn get(&self, key: &[u8]) -> GetOutcome {
        let start = std::time::Instant::now();
        let now = now_ms();
        for level in Level::ALL {
            if let Some(entry) = self.tier(level).get(key) {
                if entry.is_expired(now) {
                    drop(entry);
                    self.tier(level).remove(key);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return GetOutcome::Miss;
                }
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                entry.last_accessed_ms.store(now_ms(), Ordering::Relaxed);
                let value = if level.is_compressed() {
                    match gzip_decompress(&entry.bytes) {
                        Ok(v) => v,
                        Err(_) => continue,
                    }
                } else {
                    entry.bytes.clone()
                };
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return GetOutcome::Hit { value, level, op_time_us: start.elapsed().as_micros() as u64 };
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        GetOutcome::Miss
    }

    /// Remove `key` from whichever tier holds it, if any. A key is
    /// present in at most one level at a time (spec.md §4.4 invariant).
    pub fn remove(&self, key: &[u8]) -> bool {
        for level in Level::ALL {
            if self.tier(level).remove(key).is_some() {
                return true;
            }
        }
        false
    }

    /// Run one "Hawking radiation" eviction pass across every tier,
    /// discarding a fraction of each tier's entries proportional to
    /// `intensity`, ranked ascending by `(access_count, last_accessed_ms)`.
    /// Entries flagged `priority_protection_flag` are skipped unless
    /// `intensity` is `Emergency`.
    pub fn emit_eviction(&self, intensity: EvictionIntensity) -> EvictionReport {
        self.stats.evictions_triggered.fetch_add(1, Ordering::Relaxed);
        let fraction = intensity.fraction();
        let mut evicted_per_level = Vec::new();
        let mut total_evicted = 0usize;

        for level in Level::ALL {
            let tier = self.tier(level);
            let len = tier.len();
            if len == 0 {
                evicted_per_level.push((level.index() as u8, 0));
                continue;
            }
            let target = ((len as f64) * fraction).round() as usize;
            let target = target.clamp(1, 100).min(len);

            let mut candidates: Vec<(Key, u64, u64, bool)> = tier
                .iter()
                .map(|e| {
                    (
                        e.key().clone(),
                        e.value().access_count.load(Ordering::Relaxed),
                        e.value().last_accessed_ms.load(Ordering::Relaxed),
                        e.value().priority_protection_flag,
                    )
                })
                .collect();

            if intensity != EvictionIntensity::Emergency {
                candidates.retain(|(_, _, _, protected)| !protected);
            }
            candidates.sort_by_key(|(_, access_count, last_accessed, _)| (*access_count, *last_accessed));

            let to_evict = candidates.len().min(target);
            for (key, _, _, _) in candidates.into_iter().take(to_evict) {
                tier.remove(&key);
            }
            evicted_per_level.push((level.index() as u8, to_evict));
            total_evicted += to_evict;
        }

        EvictionReport {
            intensity_name: match intensity {
                EvictionIntensity::Mild => "mild",
                EvictionIntensity::Normal => "normal",
                EvictionIntensity::Aggressive => "aggressive",
                EvictionIntensity::Emergency => "emergency",
            },
            evicted_per_level,
            total_evicted,
        }
    }

    /// Promote an entry to the next-hotter level if its access count
    /// exceeds the promotion threshold and it sits in L2 or colder.
    /// Permitted but not required for correctness (spec.md §4.4).
    pub fn maybe_promote(&self, key: &[u8]) {
        for level in [Level::L2Photon, Level::L3Deep, Level::L4Singularity] {
            let tier = self.tier(level);
            let should_promote = match tier.get(key) {
                Some(e) => e.access_count.load(Ordering::Relaxed) > self.promotion_threshold,
                None => false,
            };
            if !should_promote {
                continue;
            }
            if let Some((_, entry)) = tier.remove(key) {
                let next = match level {
                    Level::L2Photon => Level::L1Horizon,
                    Level::L3Deep => Level::L2Photon,
                    Level::L4Singularity => Level::L3Deep,
                    _ => level,
                };
                let mut promoted = entry;
                promoted.level = next;
                self.tier(next).insert(key.to_vec(), promoted);
            }
            return;
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            size: self.total_len(),
            capacity_limit: self.capacity_limit,
            per_level_count: Level::ALL.iter().map(|l| (l.index() as u8, self.tier(*l).len())).collect(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions_triggered: self.stats.evictions_triggered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trips_with_decompression() {
        let cache = EventHorizonCache::new(1000);
        let value = vec![b'x'; 200 * 1024];
        let outcome = cache.put(b"k".to_vec(), &value, Priority::Normal, CompressionHint::Auto, None);
        assert_eq!(outcome.level, Level::L2Photon);
        match cache.get(b"k") {
            GetOutcome::Hit { value: got, level, .. } => {
                assert_eq!(got, value);
                assert_eq!(level, Level::L2Photon);
            }
            GetOutcome::Miss => panic!("expected hit"),
        }
    }

    #[test]
    fn critical_small_value_goes_to_l1_uncompressed() {
        let cache = EventHorizonCache::new(1000);
        let outcome = cache.put(b"k".to_vec(), b"small", Priority::Critical, CompressionHint::Auto, None);
        assert_eq!(outcome.level, Level::L1Horizon);
        assert_eq!(outcome.compression_ratio, 1.0);
    }

    #[test]
    fn key_present_in_at_most_one_level() {
        let cache = EventHorizonCache::new(1000);
        cache.put(b"k".to_vec(), b"v1", Priority::Critical, CompressionHint::Auto, None);
        cache.put(b"k".to_vec(), b"v2", Priority::Low, CompressionHint::Auto, None);
        let count = Level::ALL.iter().filter(|l| cache.tier(**l).contains_key(b"k".as_slice())).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn eviction_respects_priority_protection_except_emergency() {
        let cache = EventHorizonCache::new(1000);
        for i in 0..20 {
            cache.put(format!("k{i}").into_bytes(), b"v", Priority::Critical, CompressionHint::Auto, None);
        }
        let report = cache.emit_eviction(EvictionIntensity::Normal);
        assert_eq!(report.total_evicted, 0);

        let report = cache.emit_eviction(EvictionIntensity::Emergency);
        assert!(report.total_evicted > 0);
    }

    #[test]
    fn expired_entry_is_treated_as_a_miss() {
        let cache = EventHorizonCache::new(1000);
        cache.put(b"k".to_vec(), b"v", Priority::Normal, CompressionHint::Auto, Some(0));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(cache.get(b"k"), GetOutcome::Miss));
    }

    #[test]
    fn eviction_fraction_scales_with_intensity() {
        let cache = EventHorizonCache::new(1000);
        for i in 0..100 {
            cache.put(format!("k{i}").into_bytes(), b"v", Priority::Normal, CompressionHint::Auto, None);
        }
        let report = cache.emit_eviction(EvictionIntensity::Aggressive);
        assert!(report.total_evicted >= 18 && report.total_evicted <= 22);
    }

    #[test]
    fn capacity_state_triggers_mild_then_emergency_eviction() {
        let cache = EventHorizonCache::new(10);
        for i in 0..12 {
            cache.put(format!("k{i}").into_bytes(), b"v", Priority::Normal, CompressionHint::Auto, None);
        }
        assert!(cache.total_len() < 12);
    }
}
