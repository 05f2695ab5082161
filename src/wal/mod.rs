//! The write-ahead log subsystem: wire codec (C1), per-shard worker
//! (C2), cross-shard coordinator (C3), and checkpoint/recovery (C8).

pub mod checkpoint;
pub mod codec;
pub mod coordinator;
pub mod shard;

pub use coordinator::WalCoordinator;
pub use shard::WalShard;
