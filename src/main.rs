// # WarpEngine Demo
//
// Minimal entry point exercising the embedded engine end-to-end:
// opens a data directory, runs a put/get/delete smoke cycle, prints a
// metrics summary, and exits with the code matching the error category
// that stopped it (see spec.md §6).

use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use warp_engine::{AccessPattern, Engine, EngineConfig, PutOptions, WarpError};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "warp-engine-demo exited with error");
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(e: &WarpError) -> ExitCode {
    match e {
        WarpError::ConfigError(_) => ExitCode::from(2),
        WarpError::IoError { .. } => ExitCode::from(4),
        _ => ExitCode::from(3),
    }
}

async fn run() -> warp_engine::Result<()> {
    let data_root = std::env::var("WARP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));

    info!(data_root = %data_root.display(), "opening WarpEngine");

    let cfg = EngineConfig::from_env(data_root);
    cfg.validate()?;

    let engine = Engine::open(cfg).await?;

    let put_result = engine
        .put(b"user:1".to_vec(), b"alice".to_vec(), PutOptions::default())
        .await?;
    info!(shard_id = put_result.shard_id, op_time_us = put_result.op_time_us, "put ok");

    let get_result = engine.get(b"user:1").await?;
    match get_result {
        Some(r) => info!(value = %String::from_utf8_lossy(&r.value), op_time_us = r.op_time_us, "get ok"),
        None => info!("get returned NotFound unexpectedly"),
    }

    let hot_put = engine
        .put(
            b"session:warm".to_vec(),
            b"token".to_vec(),
            PutOptions { access_pattern: Some(AccessPattern::Warm), ..PutOptions::default() },
        )
        .await?;
    info!(shard_id = hot_put.shard_id, "warm-tier put ok");

    let delete_result = engine.delete(b"user:1").await?;
    info!(deleted_from = ?delete_result.deleted_from, "delete ok");

    let checkpoint = engine.create_coordinated_checkpoint().await?;
    info!(
        checkpoint_id = %checkpoint.coordinated_checkpoint_id,
        shards = checkpoint.shard_checkpoints.len(),
        "coordinated checkpoint complete"
    );

    let metrics = engine.metrics().await;
    info!(
        total_ops = metrics.wal.total_ops,
        total_flushes = metrics.wal.total_flushes,
        cache_size = metrics.cache.size,
        cache_hits = metrics.cache.hits,
        cache_misses = metrics.cache.misses,
        strategy = ?metrics.balancer.strategy,
        "engine metrics"
    );

    engine.shutdown().await?;
    Ok(())
}
