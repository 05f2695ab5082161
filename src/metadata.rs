//! The "cosmic metadata" map attached to every stored record.
//!
//! The core engine requires only `shard_id` and `stored_at_ms`; any
//! further fields (gravitational mass, quantum entanglement potential,
//! and the rest of the physics-intelligence narrative this engine's
//! host application layers on top) are opaque to WarpEngine and pass
//! through untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An opaque metadata value. The engine never branches on the variant;
/// it exists only so callers can attach typed scalars without forcing
/// everything through `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

/// A `BTreeMap` (rather than `HashMap`) so that serialized metadata is
/// byte-identical across runs for the same logical content — this
/// keeps WAL entry checksums reproducible in tests.
pub type CosmicMetadata = BTreeMap<String, MetadataValue>;

pub const SHARD_ID_KEY: &str = "shard_id";
pub const STORED_AT_MS_KEY: &str = "stored_at_ms";

/// Build the minimal metadata map the Operations Layer attaches to
/// every record, merging in any caller-supplied fields.
pub fn build_metadata(
    shard_id: u8,
    stored_at_ms: u64,
    caller_supplied: Option<CosmicMetadata>,
) -> CosmicMetadata {
    let mut map = caller_supplied.unwrap_or_default();
    map.insert(SHARD_ID_KEY.to_string(), MetadataValue::I64(shard_id as i64));
    map.insert(
        STORED_AT_MS_KEY.to_string(),
        MetadataValue::I64(stored_at_ms as i64),
    );
    map
}

pub fn encode(metadata: &CosmicMetadata) -> Vec<u8> {
    // A BTreeMap<String, MetadataValue> of plain scalars never fails
    // to serialize.
    serde_json::to_vec(metadata).expect("metadata is always serializable")
}

pub fn decode(bytes: &[u8]) -> crate::error::Result<CosmicMetadata> {
    if bytes.is_empty() {
        return Ok(CosmicMetadata::new());
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut custom = CosmicMetadata::new();
        custom.insert("gravitational_mass".to_string(), MetadataValue::F64(42.0));
        let built = build_metadata(3, 1_000, Some(custom));
        let bytes = encode(&built);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, built);
        assert_eq!(decoded.get(SHARD_ID_KEY), Some(&MetadataValue::I64(3)));
    }

    #[test]
    fn empty_bytes_decode_to_empty_map() {
        assert_eq!(decode(&[]).unwrap(), CosmicMetadata::new());
    }
}
