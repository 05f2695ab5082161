//! C7 — Intelligent Load Balancer: chooses a shard for each operation
//! and adapts routing strategy to observed concurrency.
//!
//! Shard selection itself is lock-free on the hot path: the current
//! strategy is read from a `parking_lot::RwLock` (cheap — `Strategy`
//! is `Copy`) and per-shard load lives in a plain `Vec<AtomicU64>`
//! indexed directly, with no further coordination. This is the
//! "process-local caching of the current routing table" the spec
//! calls for.

use crate::hints::Priority;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Concurrency buckets from spec.md §4.3.
pub const CONCURRENCY_BUCKETS: [u32; 9] = [1, 2, 4, 6, 8, 12, 16, 20, 24];

/// Illustrative throughput targets (ops/sec) per concurrency bucket,
/// used only to decide when to trigger rebalancing — never as a
/// correctness criterion (spec.md §4.3).
const THROUGHPUT_TARGETS: [(u32, f64); 9] = [
    (1, 20_000.0),
    (2, 38_000.0),
    (4, 70_000.0),
    (6, 95_000.0),
    (8, 115_000.0),
    (12, 150_000.0),
    (16, 180_000.0),
    (20, 205_000.0),
    (24, 225_000.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Hash,
    RoundRobin,
    LeastLoaded,
    LeastLoadedWithAffinity,
    Adaptive,
}

/// Round a raw concurrency sample down to the nearest defined bucket.
pub fn bucket_level(sample: u32) -> u32 {
    CONCURRENCY_BUCKETS
        .iter()
        .rev()
        .find(|&&b| b <= sample.max(1))
        .copied()
        .unwrap_or(1)
}

fn throughput_target(level: u32) -> f64 {
    THROUGHPUT_TARGETS
        .iter()
        .find(|(l, _)| *l == level)
        .map(|(_, t)| *t)
        .unwrap_or(20_000.0)
}

/// Map a bucketed concurrency level to the strategy the adaptation
/// rule in spec.md §4.3 prescribes. Buckets strictly between the `≤ 2`
/// and `== 16` cases (i.e. 12) fall in a gap the spec leaves
/// unspecified; this implementation extends `RoundRobin` down to
/// cover them, since it is the strategy described for "even spread at
/// sweet-spot concurrency" bridging `Adaptive` and the high-contention
/// `LeastLoaded` regime (see DESIGN.md).
fn strategy_for_level(level: u32) -> Strategy {
    if level <= 2 {
        Strategy::Hash
    } else if level <= 8 {
        Strategy::Adaptive
    } else if level <= 16 {
        Strategy::RoundRobin
    } else {
        Strategy::LeastLoaded
    }
}

struct RoutingState {
    strategy: Strategy,
    last_rebalance: Option<Instant>,
}

pub struct LoadBalancer {
    num_shards: usize,
    state: RwLock<RoutingState>,
    per_shard_load: Vec<AtomicU64>,
    hot_prefixes: Vec<Vec<u8>>,
    review_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BalancerStats {
    pub strategy: Strategy,
    pub per_shard_load: Vec<u64>,
}

impl LoadBalancer {
    pub fn new(num_shards: usize, hot_prefixes: Vec<Vec<u8>>, review_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            num_shards,
            state: RwLock::new(RoutingState {
                strategy: Strategy::Hash,
                last_rebalance: None,
            }),
            per_shard_load: (0..num_shards).map(|_| AtomicU64::new(0)).collect(),
            hot_prefixes,
            review_interval,
        })
    }

    pub fn current_strategy(&self) -> Strategy {
        self.state.read().strategy
    }

    fn hash_shard(&self, key: &[u8]) -> u8 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.num_shards as u64) as u8
    }

    fn least_loaded_shard(&self) -> u8 {
        self.per_shard_load
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| load.load(Ordering::Relaxed))
            .map(|(i, _)| i as u8)
            .unwrap_or(0)
    }

    fn round_robin_shard(&self) -> u8 {
        // "Next shard with minimum tracked load" per spec.md §4.3 —
        // round-robin here means cycling toward even spread rather
        // than a literal incrementing cursor, which the minimum-load
        // pick already achieves at this concurrency band.
        self.least_loaded_shard()
    }

    fn is_hot_prefix(&self, key: &[u8]) -> bool {
        self.hot_prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Route a key under `AccessPattern::Balanced`, applying the
    /// current strategy. Priority is advisory and currently only
    /// affects `Adaptive`'s affinity preference for critical keys.
    pub fn route(&self, key: &[u8], _priority: Priority) -> u8 {
        if self.num_shards == 0 {
            return 0;
        }
        let strategy = self.current_strategy();
        let shard = match strategy {
            Strategy::Hash => self.hash_shard(key),
            Strategy::RoundRobin => self.round_robin_shard(),
            Strategy::LeastLoaded => self.least_loaded_shard(),
            Strategy::LeastLoadedWithAffinity => {
                let preferred = self.hash_shard(key);
                let preferred_load = self.per_shard_load[preferred as usize].load(Ordering::Relaxed);
                let min_load = self
                    .per_shard_load
                    .iter()
                    .map(|l| l.load(Ordering::Relaxed))
                    .min()
                    .unwrap_or(0);
                if (preferred_load as f64) <= (min_load as f64) * 1.2 {
                    preferred
                } else {
                    self.least_loaded_shard()
                }
            }
            Strategy::Adaptive => {
                if self.is_hot_prefix(key) {
                    self.hash_shard(key)
                } else {
                    self.least_loaded_shard()
                }
            }
        };
        self.record_route(shard);
        shard
    }

    /// Increment the routed-to shard's load counter, resetting every
    /// 1,000 ops per shard so recent pressure outweighs history.
    pub fn record_route(&self, shard_id: u8) {
        let counter = &self.per_shard_load[shard_id as usize];
        let new_val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if new_val >= 1_000 {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Idempotent strategy switch + load-counter reset, rate-limited
    /// to at most once per 30 seconds.
    pub fn rebalance(&self, new_strategy: Strategy) -> bool {
        let mut state = self.state.write();
        if let Some(last) = state.last_rebalance {
            if last.elapsed() < Duration::from_secs(30) {
                return false;
            }
        }
        state.strategy = new_strategy;
        state.last_rebalance = Some(Instant::now());
        drop(state);
        for counter in &self.per_shard_load {
            counter.store(0, Ordering::Relaxed);
        }
        true
    }

    /// Step up strategy aggressiveness without resetting counters or
    /// respecting the rebalance rate limit — used when throughput
    /// dips below the 0.8x target band but hasn't yet crossed 0.7x.
    fn step_up_strategy(&self, new_strategy: Strategy) {
        self.state.write().strategy = new_strategy;
    }

    /// Feed one concurrency/throughput observation into the adaptation
    /// rule from spec.md §4.3.
    pub fn observe(&self, concurrency_sample: u32, measured_ops_per_sec: f64) {
        let level = bucket_level(concurrency_sample);
        let target_strategy = strategy_for_level(level);
        let target_throughput = throughput_target(level);

        if measured_ops_per_sec < 0.7 * target_throughput {
            self.rebalance(Strategy::LeastLoaded);
        } else if measured_ops_per_sec < 0.8 * target_throughput {
            self.step_up_strategy(Strategy::LeastLoaded);
        } else {
            self.step_up_strategy(target_strategy);
        }
    }

    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            strategy: self.current_strategy(),
            per_shard_load: self.per_shard_load.iter().map(|l| l.load(Ordering::Relaxed)).collect(),
        }
    }

    pub fn review_interval(&self) -> Duration {
        self.review_interval
    }
}

/// Deterministic hash routing used by the Operations Layer's `get`
/// path (spec.md §4.5 step 2), independent of the balancer's current
/// strategy, to preserve single-probe reads.
pub fn deterministic_hash_shard(key: &[u8], num_shards: usize) -> u8 {
    if num_shards == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_shards as u64) as u8
}

/// Spawn the background "reviewer" task that periodically samples
/// throughput and applies the adaptation rule. Callers supply a
/// sampler closure returning `(concurrency_sample, ops_per_sec)`.
pub fn spawn_reviewer<F>(balancer: Arc<LoadBalancer>, mut sampler: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> (u32, f64) + Send + 'static,
{
    let interval = balancer.review_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let (concurrency, throughput) = sampler();
            balancer.observe(concurrency, throughput);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_level_rounds_down_to_nearest_defined_bucket() {
        assert_eq!(bucket_level(1), 1);
        assert_eq!(bucket_level(3), 2);
        assert_eq!(bucket_level(10), 8);
        assert_eq!(bucket_level(15), 12);
        assert_eq!(bucket_level(16), 16);
        assert_eq!(bucket_level(100), 24);
    }

    #[test]
    fn routing_is_deterministic_for_fixed_key_and_shard_count() {
        let a = deterministic_hash_shard(b"user:1", 8);
        let b = deterministic_hash_shard(b"user:1", 8);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_routing_spreads_load_within_bound() {
        let num_shards = 8usize;
        let mut counts = vec![0u64; num_shards];
        let n = 200_000;
        for i in 0..n {
            let key = format!("key-{i}");
            let shard = deterministic_hash_shard(key.as_bytes(), num_shards);
            counts[shard as usize] += 1;
        }
        let expected = n as f64 / num_shards as f64;
        for c in counts {
            let delta = (c as f64 - expected).abs() / expected;
            assert!(delta < 0.1, "shard skew {delta} too high");
        }
    }

    #[test]
    fn rebalance_is_rate_limited() {
        let lb = LoadBalancer::new(4, vec![], Duration::from_millis(100));
        assert!(lb.rebalance(Strategy::LeastLoaded));
        assert!(!lb.rebalance(Strategy::Hash));
    }

    #[test]
    fn low_throughput_triggers_immediate_rebalance() {
        let lb = LoadBalancer::new(4, vec![], Duration::from_millis(100));
        lb.observe(1, 1.0);
        assert_eq!(lb.current_strategy(), Strategy::LeastLoaded);
    }
}
