//! Projector Runtime
//!
//! Consumes the JSONL order event log and maintains the `order_views` table:
//! - Opens and migrates the SQLite database
//! - Spawns one worker per partition
//! - Logs per-partition lag and counters every 30s
//! - Optional full rebuild at startup (`--rebuild`, gated by ORDERVIEW_ENV/ALLOW_REBUILD)
//!
//! Usage:
//!   cargo run --release --bin projector_runtime [-- --rebuild]
//!
//! Environment variables: see `ProjectorConfig::from_env`

use dotenv::dotenv;
use log::{error, info, warn};
use orderview::store::open_database;
use orderview::stream::JsonlEventLog;
use orderview::{ProjectionRuntime, ProjectorConfig};
use std::sync::Arc;
use std::time::Duration;

const LAG_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let rebuild_requested = std::env::args().any(|arg| arg == "--rebuild");

    info!("🚀 Order View Projector");

    let config = ProjectorConfig::from_env();
    config.validate()?;

    info!("📊 Configuration:");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Stream dir: {}", config.stream_dir);
    info!("   ├─ Partitions: {}", config.partitions);
    info!("   ├─ Fetch batch: {}", config.fetch_batch_size);
    info!(
        "   ├─ Stash bounds: {}/key, {}/partition, {}s",
        config.stash_max_per_key, config.stash_max_total, config.stash_max_age_secs
    );
    info!(
        "   └─ Environment: {} (rebuild {})",
        config.environment,
        if config.rebuild_gate().permits() { "allowed" } else { "disabled" }
    );

    info!("🔧 Initializing database...");
    let conn = open_database(&config.db_path, &config.schema_dir)?;
    info!("✅ Database initialized");

    let log = Arc::new(JsonlEventLog::new(&config.stream_dir, config.partitions));
    let runtime = ProjectionRuntime::start(log, conn, &config);

    if rebuild_requested {
        match runtime.rebuild_controller().rebuild().await {
            Ok(report) => info!(
                "✅ Rebuild complete: {} partitions rewound, {} stash entries dropped",
                report.partitions.len(),
                report.stash_entries_removed
            ),
            Err(e) => error!("❌ Rebuild failed: {}", e),
        }
    }

    let mut lag_interval = tokio::time::interval(LAG_LOG_INTERVAL);
    lag_interval.tick().await;

    loop {
        tokio::select! {
            _ = lag_interval.tick() => {
                match runtime.per_partition_lag().await {
                    Ok(lag) => {
                        for (partition, l) in &lag {
                            info!(
                                "📈 Partition {}: acknowledged {}/{} (behind {})",
                                partition, l.acknowledged, l.latest, l.behind()
                            );
                        }
                    }
                    Err(e) => warn!("⚠️  Lag query failed: {}", e),
                }
                let m = runtime.metrics();
                info!(
                    "📊 applied={} duplicates={} out_of_order={} gaps={} conflicts={} dead_lettered={} stash_drained={} storage_retries={}",
                    m.applied, m.duplicates, m.out_of_order, m.gaps,
                    m.conflicts, m.dead_lettered, m.stash_drained, m.storage_retries
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("❌ Failed to listen for CTRL+C: {}", e);
                }
                info!("🛑 Received CTRL+C, shutting down gracefully...");
                break;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
