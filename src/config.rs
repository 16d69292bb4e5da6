//! Engine configuration from environment variables

use crate::error::{DatumError, Result};
use chrono::FixedOffset;
use std::env;
use std::time::Duration;

/// Configuration for the datum store and its background workers
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Ceiling on distinct property names per stream (all types combined)
    pub max_stream_properties: usize,

    /// How often an idle worker polls its stale queue, in milliseconds
    pub stale_poll_interval_ms: u64,

    /// Maximum buckets a worker processes per level before yielding
    pub stale_batch_size: usize,

    /// Claim lease length in seconds; expired leases are reaped back to stale
    pub claim_lease_secs: u64,

    /// Lease reaper interval in milliseconds
    pub lease_reaper_interval_ms: u64,

    /// Default stream time zone offset (minutes east of UTC)
    pub default_tz_offset_minutes: i32,

    /// Maintain hour-of-day / day-of-week aggregate levels
    pub cyclic_aggregates: bool,

    /// Master enable flag for the rollup workers
    pub workers_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/datumflow.db".to_string(),
            max_stream_properties: 256,
            stale_poll_interval_ms: 1_000,
            stale_batch_size: 500,
            claim_lease_secs: 300,
            lease_reaper_interval_ms: 30_000,
            default_tz_offset_minutes: 0,
            cyclic_aggregates: true,
            workers_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATUMFLOW_DB_PATH` (default: data/datumflow.db)
    /// - `MAX_STREAM_PROPERTIES` (default: 256)
    /// - `STALE_POLL_INTERVAL_MS` (default: 1000)
    /// - `STALE_BATCH_SIZE` (default: 500)
    /// - `CLAIM_LEASE_SECS` (default: 300)
    /// - `LEASE_REAPER_INTERVAL_MS` (default: 30000)
    /// - `DEFAULT_TZ_OFFSET_MINUTES` (default: 0)
    /// - `ENABLE_CYCLIC_AGGREGATES` (default: true)
    /// - `ENABLE_WORKERS` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env::var("DATUMFLOW_DB_PATH").unwrap_or(defaults.db_path),

            max_stream_properties: parse_env("MAX_STREAM_PROPERTIES")
                .unwrap_or(defaults.max_stream_properties),

            stale_poll_interval_ms: parse_env("STALE_POLL_INTERVAL_MS")
                .unwrap_or(defaults.stale_poll_interval_ms),

            stale_batch_size: parse_env("STALE_BATCH_SIZE").unwrap_or(defaults.stale_batch_size),

            claim_lease_secs: parse_env("CLAIM_LEASE_SECS").unwrap_or(defaults.claim_lease_secs),

            lease_reaper_interval_ms: parse_env("LEASE_REAPER_INTERVAL_MS")
                .unwrap_or(defaults.lease_reaper_interval_ms),

            default_tz_offset_minutes: parse_env("DEFAULT_TZ_OFFSET_MINUTES")
                .unwrap_or(defaults.default_tz_offset_minutes),

            cyclic_aggregates: parse_env("ENABLE_CYCLIC_AGGREGATES")
                .unwrap_or(defaults.cyclic_aggregates),

            workers_enabled: parse_env("ENABLE_WORKERS").unwrap_or(defaults.workers_enabled),
        }
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    /// Default zone as a fixed offset; rejects offsets beyond +/-24h.
    pub fn default_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.default_tz_offset_minutes * 60).ok_or_else(|| {
            DatumError::Config(format!(
                "DEFAULT_TZ_OFFSET_MINUTES out of range: {}",
                self.default_tz_offset_minutes
            ))
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&str; 5] = [
        "DATUMFLOW_DB_PATH",
        "MAX_STREAM_PROPERTIES",
        "CLAIM_LEASE_SECS",
        "DEFAULT_TZ_OFFSET_MINUTES",
        "ENABLE_CYCLIC_AGGREGATES",
    ];

    // Defaults and overrides share one test so parallel tests never race on env vars
    #[test]
    fn test_default_and_custom_config() {
        for key in KEYS {
            env::remove_var(key);
        }

        let config = EngineConfig::from_env();
        assert_eq!(config.db_path, "data/datumflow.db");
        assert_eq!(config.max_stream_properties, 256);
        assert_eq!(config.stale_poll_interval_ms, 1_000);
        assert_eq!(config.claim_lease(), Duration::from_secs(300));
        assert!(config.cyclic_aggregates);
        assert_eq!(config.default_offset().unwrap().local_minus_utc(), 0);

        env::set_var("DATUMFLOW_DB_PATH", "/tmp/datumflow-test.db");
        env::set_var("MAX_STREAM_PROPERTIES", "16");
        env::set_var("CLAIM_LEASE_SECS", "45");
        env::set_var("DEFAULT_TZ_OFFSET_MINUTES", "720");
        env::set_var("ENABLE_CYCLIC_AGGREGATES", "false");

        let config = EngineConfig::from_env();
        assert_eq!(config.db_path, "/tmp/datumflow-test.db");
        assert_eq!(config.max_stream_properties, 16);
        assert_eq!(config.claim_lease(), Duration::from_secs(45));
        assert_eq!(config.default_offset().unwrap().local_minus_utc(), 12 * 3600);
        assert!(!config.cyclic_aggregates);

        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_offset_out_of_range() {
        let config = EngineConfig {
            default_tz_offset_minutes: 25 * 60,
            ..EngineConfig::default()
        };
        assert!(matches!(config.default_offset(), Err(DatumError::Config(_))));
    }
}
