//! C1 — WAL Entry Codec: binary encode/decode of log records with
//! checksum and optional compression.
//!
//! `shard_id` is not present on the wire: the WAL file at
//! `<data_root>/wal/cosmic_<shard_id>.wal` already pins every entry in
//! it to one shard, so repeating the id per-entry would be redundant.
//! Likewise `version` is not carried on the wire — it is a constant of
//! the codec itself, surfaced only in the non-authoritative JSON view.

use crate::error::{Result, WarpError};
use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use serde::Serialize;

pub const CODEC_VERSION: &str = "1";

/// Threshold above which a value is compressed before being written.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
    Get,
    Delete,
    QuantumGet,
}

impl Operation {
    fn to_byte(self) -> u8 {
        match self {
            Operation::Put => 0,
            Operation::Get => 1,
            Operation::Delete => 2,
            Operation::QuantumGet => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Operation::Put),
            1 => Ok(Operation::Get),
            2 => Ok(Operation::Delete),
            3 => Ok(Operation::QuantumGet),
            other => Err(WarpError::Corrupt(format!("unknown operation byte {other}"))),
        }
    }

    /// Only Put/Delete are durably logged per spec.md §2.
    pub fn is_durable(self) -> bool {
        matches!(self, Operation::Put | Operation::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Lz4,
}

impl Compression {
    fn to_byte(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Lz4 => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Lz4),
            other => Err(WarpError::Corrupt(format!("unknown compression byte {other}"))),
        }
    }
}

/// One WAL record as defined in spec.md §3.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub operation: Operation,
    pub key: Vec<u8>,
    /// Absent for `Delete`. Stored post-compression when `compression`
    /// is not `None`.
    pub value: Option<Vec<u8>>,
    pub metadata: Vec<u8>,
    pub compression: Compression,
    pub checksum: u128,
}

impl WalEntry {
    /// Build an entry from plaintext fields, compressing the value and
    /// computing the checksum as specified.
    pub fn new(
        sequence: u64,
        timestamp_us: u64,
        operation: Operation,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        metadata: Vec<u8>,
    ) -> Self {
        let (compression, stored_value) = match value {
            None => (Compression::None, None),
            Some(v) if v.len() >= COMPRESSION_THRESHOLD_BYTES => {
                (Compression::Gzip, Some(compress(Compression::Gzip, &v)))
            }
            Some(v) => (Compression::None, Some(v)),
        };
        let checksum = compute_checksum(&key, stored_value.as_deref(), &metadata);
        Self {
            sequence,
            timestamp_us,
            operation,
            key,
            value: stored_value,
            metadata,
            compression,
            checksum,
        }
    }

    /// Decompress and return the plaintext value, if any.
    pub fn plaintext_value(&self) -> Result<Option<Vec<u8>>> {
        match &self.value {
            None => Ok(None),
            Some(v) => Ok(Some(decompress(self.compression, v)?)),
        }
    }

    fn verify_checksum(&self) -> bool {
        compute_checksum(&self.key, self.value.as_deref(), &self.metadata) == self.checksum
    }
}

fn compute_checksum(key: &[u8], value: Option<&[u8]>, metadata: &[u8]) -> u128 {
    let mut hasher = Md5::new();
    hasher.update(key);
    if let Some(v) = value {
        hasher.update(v);
    }
    hasher.update(metadata);
    let digest = hasher.finalize();
    u128::from_be_bytes(digest.into())
}

pub fn compress(kind: Compression, data: &[u8]) -> Vec<u8> {
    match kind {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            use flate2::write::GzEncoder;
            use flate2::Compression as GzLevel;
            use std::io::Write;
            let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
            enc.write_all(data).expect("writing to an in-memory encoder cannot fail");
            enc.finish().expect("finishing an in-memory encoder cannot fail")
        }
        Compression::Lz4 => lz4_flex::compress_prepend_size(data),
    }
}

pub fn decompress(kind: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::read::GzDecoder;
            use std::io::Read;
            let mut dec = GzDecoder::new(data);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)
                .map_err(|e| WarpError::Corrupt(format!("gzip decode failed: {e}")))?;
            Ok(out)
        }
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| WarpError::Corrupt(format!("lz4 decode failed: {e}"))),
    }
}

/// Encode a single entry per the ENTRY layout in spec.md §4.1.
pub fn encode_entry(entry: &WalEntry, out: &mut BytesMut) {
    out.put_u64(entry.sequence);
    out.put_u64(entry.timestamp_us);
    out.put_u8(entry.operation.to_byte());
    out.put_u8(entry.compression.to_byte());

    out.put_u32(entry.key.len() as u32);
    out.put_slice(&entry.key);

    match &entry.value {
        Some(v) => {
            out.put_u32(v.len() as u32);
            out.put_slice(v);
        }
        None => out.put_u32(0),
    }

    out.put_u32(entry.metadata.len() as u32);
    out.put_slice(&entry.metadata);

    out.put_u128(entry.checksum);
}

/// Decode one entry from the front of `buf`, advancing it past the
/// consumed bytes. Returns `Err(Corrupt)` on a length or checksum
/// mismatch, or if `buf` doesn't contain a full entry (treated as a
/// truncated tail by the caller).
pub fn decode_entry(buf: &mut impl Buf) -> Result<WalEntry> {
    const FIXED_PREFIX: usize = 8 + 8 + 1 + 1 + 4;
    if buf.remaining() < FIXED_PREFIX {
        return Err(WarpError::Corrupt("truncated entry header".to_string()));
    }
    let sequence = buf.get_u64();
    let timestamp_us = buf.get_u64();
    let operation = Operation::from_byte(buf.get_u8())?;
    let compression = Compression::from_byte(buf.get_u8())?;

    let klen = buf.get_u32() as usize;
    if buf.remaining() < klen + 4 {
        return Err(WarpError::Corrupt("truncated key".to_string()));
    }
    let mut key = vec![0u8; klen];
    buf.copy_to_slice(&mut key);

    let vlen = buf.get_u32() as usize;
    if buf.remaining() < vlen + 4 {
        return Err(WarpError::Corrupt("truncated value".to_string()));
    }
    let value = if vlen == 0 && operation == Operation::Delete {
        None
    } else {
        let mut v = vec![0u8; vlen];
        buf.copy_to_slice(&mut v);
        Some(v)
    };

    let mlen = buf.get_u32() as usize;
    if buf.remaining() < mlen + 16 {
        return Err(WarpError::Corrupt("truncated metadata".to_string()));
    }
    let mut metadata = vec![0u8; mlen];
    buf.copy_to_slice(&mut metadata);

    let checksum = buf.get_u128();

    let entry = WalEntry {
        sequence,
        timestamp_us,
        operation,
        key,
        value,
        metadata,
        compression,
        checksum,
    };

    if !entry.verify_checksum() {
        return Err(WarpError::Corrupt(format!(
            "checksum mismatch at sequence {}",
            entry.sequence
        )));
    }

    Ok(entry)
}

/// Encode a full batch: `<count:u32><flush_ts:u64>` followed by each
/// entry in order.
pub fn encode_batch(entries: &[WalEntry], flush_timestamp_us: u64) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32(entries.len() as u32);
    out.put_u64(flush_timestamp_us);
    for e in entries {
        encode_entry(e, &mut out);
    }
    out
}

/// Decode every complete entry in `buf`. Stops and reports the byte
/// offset of the first undecodable entry (corrupt checksum or
/// truncated tail) rather than erroring the whole scan, so callers can
/// truncate a damaged WAL file at exactly that point.
pub struct BatchDecodeResult {
    pub entries: Vec<WalEntry>,
    /// Byte length of the valid, consumed prefix of the input.
    pub valid_len: usize,
    /// Set if decoding stopped early due to corruption or truncation.
    pub truncated: bool,
}

pub fn decode_all_batches(data: &[u8]) -> BatchDecodeResult {
    let mut entries = Vec::new();
    let total_len = data.len();
    let mut pos: usize = 0;

    loop {
        if pos + 12 > total_len {
            return BatchDecodeResult { entries, valid_len: pos, truncated: pos < total_len };
        }

        let mut header = &data[pos..pos + 12];
        let count = header.get_u32();
        let _flush_ts = header.get_u64();

        let mut cursor = &data[pos + 12..];
        let start_remaining = cursor.remaining();
        let mut batch_entries = Vec::with_capacity(count as usize);
        let mut ok = true;
        for _ in 0..count {
            match decode_entry(&mut cursor) {
                Ok(e) => batch_entries.push(e),
                Err(_) => {
                    ok = false;
                    break;
                }
            }
        }

        if !ok {
            return BatchDecodeResult { entries, valid_len: pos, truncated: true };
        }

        let consumed_entries = start_remaining - cursor.remaining();
        entries.extend(batch_entries);
        pos += 12 + consumed_entries;

        if pos >= total_len {
            return BatchDecodeResult { entries, valid_len: pos, truncated: false };
        }
    }
}

/// Non-authoritative JSON rendering of a WAL entry for human inspection.
#[derive(Debug, Serialize)]
pub struct WalEntryView<'a> {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub operation: &'static str,
    pub key_hex: String,
    pub has_value: bool,
    pub compression: &'static str,
    pub checksum: String,
    pub version: &'a str,
}

pub fn to_json_view(entry: &WalEntry) -> String {
    let view = WalEntryView {
        sequence: entry.sequence,
        timestamp_us: entry.timestamp_us,
        operation: match entry.operation {
            Operation::Put => "put",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::QuantumGet => "quantum_get",
        },
        key_hex: hex_encode(&entry.key),
        has_value: entry.value.is_some(),
        compression: match entry.compression {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
        },
        checksum: format!("{:032x}", entry.checksum),
        version: CODEC_VERSION,
    };
    serde_json::to_string(&view).unwrap_or_default()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(seq: u64, op: Operation, value: Option<Vec<u8>>) -> WalEntry {
        WalEntry::new(seq, 123, op, b"key".to_vec(), value, b"{}".to_vec())
    }

    #[test]
    fn round_trip_small_put() {
        let entry = sample_entry(1, Operation::Put, Some(b"value".to_vec()));
        let mut buf = BytesMut::new();
        encode_entry(&entry, &mut buf);
        let decoded = decode_entry(&mut buf).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.plaintext_value().unwrap().unwrap(), b"value");
    }

    #[test]
    fn round_trip_delete_has_no_value() {
        let entry = sample_entry(2, Operation::Delete, None);
        let mut buf = BytesMut::new();
        encode_entry(&entry, &mut buf);
        let decoded = decode_entry(&mut buf).unwrap();
        assert_eq!(decoded.value, None);
    }

    #[test]
    fn large_value_is_compressed() {
        let big = vec![b'x'; 4096];
        let entry = sample_entry(3, Operation::Put, Some(big.clone()));
        assert_eq!(entry.compression, Compression::Gzip);
        assert!(entry.value.as_ref().unwrap().len() < big.len());
        assert_eq!(entry.plaintext_value().unwrap().unwrap(), big);
    }

    #[test]
    fn bit_flip_in_checksum_is_detected_as_corrupt() {
        let entry = sample_entry(4, Operation::Put, Some(b"value".to_vec()));
        let mut buf = BytesMut::new();
        encode_entry(&entry, &mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let result = decode_entry(&mut buf);
        assert!(matches!(result, Err(WarpError::Corrupt(_))));
    }

    #[test]
    fn bit_flip_in_key_is_detected_as_corrupt() {
        let entry = sample_entry(5, Operation::Put, Some(b"value".to_vec()));
        let mut buf = BytesMut::new();
        encode_entry(&entry, &mut buf);
        // key bytes start right after the 18-byte fixed header
        buf[18] ^= 0x01;
        let result = decode_entry(&mut buf);
        assert!(matches!(result, Err(WarpError::Corrupt(_))));
    }

    #[test]
    fn batch_round_trip() {
        let entries = vec![
            sample_entry(1, Operation::Put, Some(b"a".to_vec())),
            sample_entry(2, Operation::Put, Some(b"b".to_vec())),
            sample_entry(3, Operation::Delete, None),
        ];
        let batch = encode_batch(&entries, 999);
        let result = decode_all_batches(&batch);
        assert!(!result.truncated);
        assert_eq!(result.entries, entries);
    }

    #[test]
    fn truncated_tail_is_reported_and_excluded() {
        let entries = vec![
            sample_entry(1, Operation::Put, Some(b"a".to_vec())),
            sample_entry(2, Operation::Put, Some(b"b".to_vec())),
        ];
        let mut batch = encode_batch(&entries, 999);
        batch.truncate(batch.len() - 3);
        let result = decode_all_batches(&batch);
        assert!(result.truncated);
        assert_eq!(result.entries.len(), 1);
    }
}
