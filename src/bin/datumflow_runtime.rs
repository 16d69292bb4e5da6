//! datumflow runtime: background rollup workers
//!
//! Opens the datum database, then runs the aggregation worker, the
//! accounting worker and the lease reaper until CTRL+C. Ingest happens
//! elsewhere (any process holding a `DatumStore` on the same file).
//!
//! Usage:
//!   cargo run --release --bin datumflow_runtime
//!
//! Environment variables:
//!   DATUMFLOW_DB_PATH - SQLite database path (default: data/datumflow.db)
//!   ENABLE_WORKERS - Master switch (default: true)
//!   STALE_POLL_INTERVAL_MS - Worker poll interval (default: 1000)
//!   CLAIM_LEASE_SECS - Claim lease length (default: 300)
//!   RUST_LOG - Log filter (default: info)

use datumflow::worker::{run_lease_reaper, run_stale_worker, StaleProcessor};
use datumflow::{AccountingEngine, AggregationEngine, DatumStore, EngineConfig, StaticZones, StoreOptions};
use dotenv::dotenv;
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 datumflow runtime v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    if !config.workers_enabled {
        info!("⚠️  Workers are DISABLED (set ENABLE_WORKERS=true to activate)");
        return Ok(());
    }

    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Poll interval: {}ms", config.stale_poll_interval_ms);
    info!("   ├─ Batch size: {}", config.stale_batch_size);
    info!("   ├─ Claim lease: {}s", config.claim_lease_secs);
    info!("   ├─ Default zone offset: {} min", config.default_tz_offset_minutes);
    info!("   └─ Cyclic aggregates: {}", config.cyclic_aggregates);

    // Each worker gets its own connection so claims are independent transactions
    let open = || {
        DatumStore::open(
            &config.db_path,
            StoreOptions {
                max_properties: config.max_stream_properties,
                ..StoreOptions::default()
            },
        )
        .map(Arc::new)
    };
    let zones = Arc::new(StaticZones::new(config.default_offset()?));

    let aggregation: Arc<dyn StaleProcessor> =
        Arc::new(AggregationEngine::from_config(open()?, zones, &config));
    let accounting: Arc<dyn StaleProcessor> =
        Arc::new(AccountingEngine::from_config(open()?, &config));
    info!("✅ Database initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for processor in [aggregation.clone(), accounting.clone()] {
        handles.push(tokio::spawn(run_stale_worker(
            processor,
            config.stale_poll_interval_ms,
            config.stale_batch_size,
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(run_lease_reaper(
        vec![aggregation, accounting],
        config.lease_reaper_interval_ms,
        shutdown_rx,
    )));
    info!("✅ Workers running, press CTRL+C to shut down");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    shutdown_tx.send(true)?;
    for handle in handles {
        if let Err(e) = handle.await {
            error!("❌ Worker task panicked: {}", e);
        }
    }

    info!("✅ datumflow runtime stopped");
    Ok(())
}
