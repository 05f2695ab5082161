use thiserror::Error;

/// Crate-wide error taxonomy for WarpEngine.
///
/// Hot-path operations surface `ShardUnavailable`, `BufferFull`, and
/// `InvalidInput` synchronously; everything else that originates from
/// the filesystem collapses into `IoError` and marks the owning shard
/// degraded.
#[derive(Error, Debug)]
pub enum WarpError {
    #[error("shard {shard_id} is unavailable: {reason}")]
    ShardUnavailable { shard_id: u8, reason: String },

    #[error("WAL buffer full on shard {shard_id} ({len}/{cap} entries)")]
    BufferFull { shard_id: u8, len: usize, cap: usize },

    #[error("I/O error during {kind}: {source}")]
    IoError {
        kind: IoErrorKind,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt WAL entry: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("coordinator operation timed out after {0:?}")]
    TimeoutError(std::time::Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Which disk operation an `IoError` originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    Write,
    Fsync,
    Open,
    Read,
}

impl std::fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IoErrorKind::Write => "write",
            IoErrorKind::Fsync => "fsync",
            IoErrorKind::Open => "open",
            IoErrorKind::Read => "read",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, WarpError>;

impl WarpError {
    pub fn io(kind: IoErrorKind, source: std::io::Error) -> Self {
        WarpError::IoError { kind, source }
    }
}

impl From<bincode::error::EncodeError> for WarpError {
    fn from(e: bincode::error::EncodeError) -> Self {
        WarpError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for WarpError {
    fn from(e: bincode::error::DecodeError) -> Self {
        WarpError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for WarpError {
    fn from(e: serde_json::Error) -> Self {
        WarpError::Serialization(e.to_string())
    }
}
