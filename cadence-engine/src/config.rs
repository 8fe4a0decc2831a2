//! Engine Configuration
//!
//! Configuration is loaded from environment variables with sensible
//! defaults for a single-instance deployment.

use std::time::Duration;

use cadence_core::ConfigError;

/// Default periodic sweep interval (15 minutes).
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;
/// Default activity lookback for enumerating organizations in a sweep.
const DEFAULT_ACTIVE_ORG_LOOKBACK_SECS: u64 = 86_400;
/// Default lookback for lazily seeding a first watermark (7 days).
const DEFAULT_WATERMARK_SEED_LOOKBACK_SECS: u64 = 7 * 86_400;
/// Default freshness threshold separating stable from recent windows.
const DEFAULT_FRESHNESS_WINDOW_DAYS: i64 = 7;
/// Default cache TTL for windows entirely older than the freshness threshold.
const DEFAULT_STABLE_TTL_SECS: u64 = 1_800;
/// Default cache TTL for raw-backed or recent windows.
const DEFAULT_RECENT_TTL_SECS: u64 = 300;
/// Default backfill batch size.
const DEFAULT_BACKFILL_BATCH_SIZE: usize = 100;
/// Default bound on the write-triggered recompute queue.
const DEFAULT_TRIGGER_QUEUE_CAPACITY: usize = 256;

/// Configuration for the aggregation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the periodic sweep runs.
    pub sweep_interval: Duration,

    /// Only organizations with an event inside this lookback are swept.
    pub active_org_lookback: Duration,

    /// How far back a lazily-created watermark starts.
    pub watermark_seed_lookback: Duration,

    /// Day-level queries whose whole window is older than this read rollups;
    /// anything touching the threshold reads the raw event log.
    pub freshness_window_days: i64,

    /// Cache TTL for windows entirely older than the freshness threshold.
    pub stable_ttl: Duration,

    /// Cache TTL for raw-backed or recent windows.
    pub recent_ttl: Duration,

    /// Maximum entity-days processed per backfill batch.
    pub backfill_batch_size: usize,

    /// Capacity of the write-triggered recompute queue. A full queue drops
    /// requests; the periodic sweep is the backstop.
    pub trigger_queue_capacity: usize,

    /// When false, every query reads the raw event log.
    pub rollups_enabled: bool,

    /// When true, each query also executes the non-chosen read path and
    /// logs a divergence report without affecting the result.
    pub shadow_reads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            active_org_lookback: Duration::from_secs(DEFAULT_ACTIVE_ORG_LOOKBACK_SECS),
            watermark_seed_lookback: Duration::from_secs(DEFAULT_WATERMARK_SEED_LOOKBACK_SECS),
            freshness_window_days: DEFAULT_FRESHNESS_WINDOW_DAYS,
            stable_ttl: Duration::from_secs(DEFAULT_STABLE_TTL_SECS),
            recent_ttl: Duration::from_secs(DEFAULT_RECENT_TTL_SECS),
            backfill_batch_size: DEFAULT_BACKFILL_BATCH_SIZE,
            trigger_queue_capacity: DEFAULT_TRIGGER_QUEUE_CAPACITY,
            rollups_enabled: true,
            shadow_reads: false,
        }
    }
}

impl EngineConfig {
    /// Create EngineConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CADENCE_SWEEP_INTERVAL_SECS`: Periodic sweep interval (default: 900)
    /// - `CADENCE_FRESHNESS_WINDOW_DAYS`: Rollup freshness threshold (default: 7)
    /// - `CADENCE_STABLE_TTL_SECS`: Cache TTL for stable windows (default: 1800)
    /// - `CADENCE_RECENT_TTL_SECS`: Cache TTL for recent windows (default: 300)
    /// - `CADENCE_BACKFILL_BATCH_SIZE`: Entity-days per backfill batch (default: 100)
    /// - `CADENCE_TRIGGER_QUEUE_CAPACITY`: Trigger queue bound (default: 256)
    /// - `CADENCE_ROLLUPS_ENABLED`: "true" or "false" (default: true)
    /// - `CADENCE_SHADOW_READS`: "true" or "false" (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let sweep_interval = Duration::from_secs(
            std::env::var("CADENCE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let freshness_window_days = std::env::var("CADENCE_FRESHNESS_WINDOW_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_FRESHNESS_WINDOW_DAYS);

        let stable_ttl = Duration::from_secs(
            std::env::var("CADENCE_STABLE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STABLE_TTL_SECS),
        );

        let recent_ttl = Duration::from_secs(
            std::env::var("CADENCE_RECENT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RECENT_TTL_SECS),
        );

        let backfill_batch_size = std::env::var("CADENCE_BACKFILL_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BACKFILL_BATCH_SIZE);

        let trigger_queue_capacity = std::env::var("CADENCE_TRIGGER_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TRIGGER_QUEUE_CAPACITY);

        let rollups_enabled = std::env::var("CADENCE_ROLLUPS_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        let shadow_reads = std::env::var("CADENCE_SHADOW_READS")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            sweep_interval,
            freshness_window_days,
            stable_ttl,
            recent_ttl,
            backfill_batch_size,
            trigger_queue_capacity,
            rollups_enabled,
            shadow_reads,
            ..defaults
        }
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_secs(2),
            stable_ttl: Duration::from_secs(60),
            recent_ttl: Duration::from_secs(5),
            backfill_batch_size: 10,
            trigger_queue_capacity: 16,
            ..Self::default()
        }
    }

    /// Validate that the configuration is internally usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.backfill_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backfill_batch_size".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.trigger_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "trigger_queue_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.freshness_window_days < 0 {
            return Err(ConfigError::InvalidValue {
                field: "freshness_window_days".to_string(),
                value: self.freshness_window_days.to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}
