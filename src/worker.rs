//! Background workers that drain the staleness queues
//!
//! Each worker polls its levels on an interval, processes up to a batch of
//! buckets per level and stops when the shutdown flag flips. Any number of
//! workers (in this or other processes sharing the database) may run at once.

use crate::audit::{AccountingEngine, AUDIT_LEVELS};
use crate::error::Result;
use crate::rollup::AggregationEngine;
use crate::store::types::{AggregateLevel, StaleDatum};
use crate::store::StaleQueue;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// A queue consumer the worker loop can drive
#[async_trait]
pub trait StaleProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Levels to drain, finest first
    fn levels(&self) -> Vec<AggregateLevel>;

    /// Claim and process one bucket; `Ok(None)` when nothing is claimable
    async fn process_next(&self, level: AggregateLevel) -> Result<Option<StaleDatum>>;

    /// Return expired leases to the queue
    async fn reap_expired_leases(&self) -> Result<usize>;
}

#[async_trait]
impl StaleProcessor for AggregationEngine {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn levels(&self) -> Vec<AggregateLevel> {
        AggregationEngine::levels(self)
    }

    async fn process_next(&self, level: AggregateLevel) -> Result<Option<StaleDatum>> {
        AggregationEngine::process_next(self, level)
    }

    async fn reap_expired_leases(&self) -> Result<usize> {
        self.store().reap_expired_leases(StaleQueue::Aggregate)
    }
}

#[async_trait]
impl StaleProcessor for AccountingEngine {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn levels(&self) -> Vec<AggregateLevel> {
        AUDIT_LEVELS.to_vec()
    }

    async fn process_next(&self, level: AggregateLevel) -> Result<Option<StaleDatum>> {
        AccountingEngine::process_next(self, level)
    }

    async fn reap_expired_leases(&self) -> Result<usize> {
        self.store().reap_expired_leases(StaleQueue::Audit)
    }
}

/// One pass over every level, at most `batch_size` buckets per level
///
/// A failing bucket keeps its lease (the reaper will release it) and the
/// pass moves on to the next level.
pub async fn run_stale_pass(processor: &dyn StaleProcessor, batch_size: usize) -> usize {
    let mut processed = 0;
    for level in processor.levels() {
        for _ in 0..batch_size {
            match processor.process_next(level).await {
                Ok(Some(_)) => processed += 1,
                Ok(None) => break,
                Err(e) => {
                    log::error!(
                        "❌ {} worker failed on level {}: {}",
                        processor.name(),
                        level.as_str(),
                        e
                    );
                    break;
                }
            }
        }
    }
    processed
}

/// Poll the queue until `shutdown` becomes true
pub async fn run_stale_worker(
    processor: Arc<dyn StaleProcessor>,
    poll_interval_ms: u64,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(
        "⏰ Starting {} worker (poll: {}ms, batch: {})",
        processor.name(),
        poll_interval_ms,
        batch_size
    );

    let mut timer = interval(Duration::from_millis(poll_interval_ms.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let processed = run_stale_pass(processor.as_ref(), batch_size).await;
                if processed > 0 {
                    log::info!("📊 {} worker processed {} buckets", processor.name(), processed);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("🛑 {} worker stopped", processor.name());
}

/// Periodically release leases whose holders died
pub async fn run_lease_reaper(
    processors: Vec<Arc<dyn StaleProcessor>>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("🧹 Starting lease reaper (interval: {}ms)", interval_ms);
    let mut timer = interval(Duration::from_millis(interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = timer.tick() => {
                for processor in &processors {
                    match processor.reap_expired_leases().await {
                        Ok(0) => {}
                        Ok(n) => log::warn!("⚠️  Reaped {} expired {} leases", n, processor.name()),
                        Err(e) => log::error!("❌ Lease reaper failed for {}: {}", processor.name(), e),
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
