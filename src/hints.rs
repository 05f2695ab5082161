//! Advisory routing and priority hints passed by callers into `put`/`get`.
//!
//! These are opaque to the storage and WAL layers; only the load
//! balancer (`crate::balancer`) and the cache's admission policy
//! (`crate::cache`) interpret them.

use serde::{Deserialize, Serialize};

/// Caller-supplied access-pattern hint. `Hot`/`Warm`/`Cold` bypass the
/// routing strategy entirely and map to fixed (legacy) shards;
/// `Balanced` defers to the configured strategy, modulated by
/// `Priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessPattern {
    Hot,
    Warm,
    Cold,
    #[default]
    Balanced,
}

/// Priority used by `AccessPattern::Balanced` routing and by the
/// cache's admission policy to choose an initial tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

/// Compression preference a caller may pass to the cache on `put`.
/// Advisory only — the admission policy may override it based on size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionHint {
    #[default]
    Auto,
    ForceCompressed,
    ForceUncompressed,
}

/// Per-call options accepted by `Engine::put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub access_pattern: Option<AccessPattern>,
    pub priority: Option<Priority>,
    pub metadata: Option<crate::metadata::CosmicMetadata>,
    pub ttl_ms: Option<u64>,
    pub compression_hint: Option<CompressionHint>,
}
