//! Watermark Sweep Scheduler
//!
//! Drives recomputation three ways:
//!
//! - **Periodic**: a single timer task finds every entity-day touched since
//!   each organization's watermark and recomputes it, then advances the
//!   watermark to the maximum event timestamp actually processed.
//! - **Backfill**: operator-invoked recomputation over an explicit date
//!   range, independent of the watermark.
//! - **Triggered**: write paths enqueue single entity-days onto a bounded
//!   queue consumed by a dedicated worker, shrinking freshness lag below
//!   the sweep interval.
//!
//! The scheduler is an explicitly constructed service owned by the process
//! lifecycle; `start` and `stop` are idempotent. There is no cross-instance
//! lease: running two engine instances is safe (recomputation is
//! idempotent) but wasteful, and watermark advancement becomes
//! last-writer-wins. Single-instance deployment is assumed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadence_core::{
    day_window, EngineResult, OrganizationId, QueryError, Timestamp, UserId, Watermark,
};
use cadence_storage::{BucketStore, EventSource};
use chrono::{NaiveDate, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::aggregator::BucketAggregator;
use crate::config::EngineConfig;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweep and trigger activity.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Total periodic sweep passes started.
    pub sweep_cycles: AtomicU64,

    /// Total failed organization passes or enumeration failures.
    pub sweep_errors: AtomicU64,

    /// Total entity-days recomputed by sweeps and backfills.
    pub entity_days_recomputed: AtomicU64,

    /// Total recomputes completed by the trigger worker.
    pub triggered_recomputes: AtomicU64,

    /// Total trigger worker failures.
    pub trigger_errors: AtomicU64,

    /// Total trigger requests dropped (queue full or scheduler stopped).
    pub triggers_dropped: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
            entity_days_recomputed: self.entity_days_recomputed.load(Ordering::Relaxed),
            triggered_recomputes: self.triggered_recomputes.load(Ordering::Relaxed),
            trigger_errors: self.trigger_errors.load(Ordering::Relaxed),
            triggers_dropped: self.triggers_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
    pub entity_days_recomputed: u64,
    pub triggered_recomputes: u64,
    pub trigger_errors: u64,
    pub triggers_dropped: u64,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// One entity-day enqueued by a write path.
#[derive(Debug, Clone, Copy)]
struct RecomputeRequest {
    organization_id: OrganizationId,
    user_id: UserId,
    day: NaiveDate,
}

/// Handles owned by a running scheduler.
struct SweepRuntime {
    shutdown_tx: watch::Sender<bool>,
    trigger_tx: mpsc::Sender<RecomputeRequest>,
    sweep_handle: JoinHandle<()>,
    worker_handle: JoinHandle<()>,
}

/// Periodic, backfill, and triggered recomputation drivers.
pub struct SweepScheduler<S> {
    store: Arc<S>,
    aggregator: Arc<BucketAggregator<S>>,
    config: EngineConfig,
    metrics: Arc<SweepMetrics>,
    runtime: RwLock<Option<SweepRuntime>>,
}

impl<S> SweepScheduler<S>
where
    S: EventSource + BucketStore + 'static,
{
    pub fn new(store: Arc<S>, aggregator: Arc<BucketAggregator<S>>, config: EngineConfig) -> Self {
        Self {
            store,
            aggregator,
            config,
            metrics: Arc::new(SweepMetrics::new()),
            runtime: RwLock::new(None),
        }
    }

    pub fn metrics(&self) -> SweepSnapshot {
        self.metrics.snapshot()
    }

    /// Whether the periodic sweep and trigger worker are running.
    pub async fn is_running(&self) -> bool {
        self.runtime.read().await.is_some()
    }

    /// Start the periodic sweep task and the trigger worker. Idempotent.
    pub async fn start(&self) {
        let mut runtime = self.runtime.write().await;
        if runtime.is_some() {
            tracing::debug!("Sweep scheduler already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(self.config.trigger_queue_capacity.max(1));

        let sweep_handle = tokio::spawn(sweep_loop(
            self.store.clone(),
            self.aggregator.clone(),
            self.config.clone(),
            self.metrics.clone(),
            shutdown_rx,
        ));
        let worker_handle = tokio::spawn(trigger_worker(
            self.aggregator.clone(),
            self.metrics.clone(),
            trigger_rx,
        ));

        *runtime = Some(SweepRuntime {
            shutdown_tx,
            trigger_tx,
            sweep_handle,
            worker_handle,
        });
        tracing::info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            queue_capacity = self.config.trigger_queue_capacity,
            "Sweep scheduler started"
        );
    }

    /// Stop both background tasks, draining queued trigger requests first.
    /// Idempotent.
    pub async fn stop(&self) {
        let taken = self.runtime.write().await.take();
        let Some(runtime) = taken else {
            tracing::debug!("Sweep scheduler not running");
            return;
        };
        let SweepRuntime {
            shutdown_tx,
            trigger_tx,
            sweep_handle,
            worker_handle,
        } = runtime;

        // Closing the queue lets the worker drain what was already accepted.
        drop(trigger_tx);
        if let Err(error) = worker_handle.await {
            tracing::error!(%error, "Trigger worker panicked");
        }

        let _ = shutdown_tx.send(true);
        if let Err(error) = sweep_handle.await {
            tracing::error!(%error, "Sweep task panicked");
        }
        tracing::info!("Sweep scheduler stopped");
    }

    /// Enqueue one entity-day for recomputation, outside the watermark
    /// bookkeeping. Fire-and-forget: failures and drops are logged, never
    /// surfaced, because the originating write already succeeded.
    pub async fn trigger_recompute(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        activity_at: Timestamp,
    ) {
        let request = RecomputeRequest {
            organization_id,
            user_id,
            day: activity_at.date_naive(),
        };
        let runtime = self.runtime.read().await;
        match runtime.as_ref() {
            Some(runtime) => match runtime.trigger_tx.try_send(request) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        organization_id = %organization_id,
                        user_id = %user_id,
                        "Trigger queue full, dropping recompute request"
                    );
                    self.metrics.triggers_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(
                        organization_id = %organization_id,
                        "Trigger queue closed, dropping recompute request"
                    );
                    self.metrics.triggers_dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            None => {
                tracing::warn!(
                    organization_id = %organization_id,
                    "Sweep scheduler not running; periodic sweep will pick up the change"
                );
                self.metrics.triggers_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run one sweep pass inline, outside the timer.
    pub async fn sweep_now(&self) {
        sweep_pass(
            self.store.as_ref(),
            self.aggregator.as_ref(),
            &self.config,
            &self.metrics,
        )
        .await;
    }

    /// Recompute every entity-day with activity in `[from, to]`, then set
    /// the watermark to the end of `to` unconditionally.
    ///
    /// The unconditional watermark write is the operator override that
    /// distinguishes backfill from the self-healing periodic path; it may
    /// move the watermark backwards on purpose. Failures propagate and are
    /// not retried; the operator re-invokes for the remaining range.
    pub async fn backfill(
        &self,
        organization_id: OrganizationId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<u64> {
        if from > to {
            return Err(QueryError::InvalidWindow { from, to }.into());
        }
        let entity_days = self
            .store
            .activity_in_range(organization_id, from, to)
            .await?;
        let total = entity_days.len();
        let mut processed = 0u64;
        for batch in entity_days.chunks(self.config.backfill_batch_size.max(1)) {
            for entity_day in batch {
                self.aggregator
                    .recompute(organization_id, entity_day.user_id, entity_day.day)
                    .await?;
                processed += 1;
                self.metrics
                    .entity_days_recomputed
                    .fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(
                organization_id = %organization_id,
                processed,
                total,
                "Backfill batch completed"
            );
        }

        let (_, range_end) = day_window(to);
        self.store
            .put_watermark(Watermark::new(organization_id, range_end))
            .await?;
        tracing::info!(
            organization_id = %organization_id,
            processed,
            from = %from,
            to = %to,
            "Backfill completed"
        );
        Ok(processed)
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

async fn sweep_loop<S>(
    store: Arc<S>,
    aggregator: Arc<BucketAggregator<S>>,
    config: EngineConfig,
    metrics: Arc<SweepMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: EventSource + BucketStore,
{
    let mut ticker = interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Sweep task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                sweep_pass(store.as_ref(), aggregator.as_ref(), &config, &metrics).await;
            }
        }
    }
}

async fn trigger_worker<S>(
    aggregator: Arc<BucketAggregator<S>>,
    metrics: Arc<SweepMetrics>,
    mut requests: mpsc::Receiver<RecomputeRequest>,
) where
    S: EventSource + BucketStore,
{
    while let Some(request) = requests.recv().await {
        match aggregator
            .recompute(request.organization_id, request.user_id, request.day)
            .await
        {
            Ok(()) => {
                metrics
                    .triggered_recomputes
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                // The next periodic sweep retries this entity-day because
                // the watermark has not moved past it.
                tracing::error!(
                    %error,
                    organization_id = %request.organization_id,
                    user_id = %request.user_id,
                    day = %request.day,
                    "Triggered recompute failed"
                );
                metrics.trigger_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    tracing::debug!("Trigger worker drained");
}

/// One periodic pass over every recently-active organization.
async fn sweep_pass<S>(
    store: &S,
    aggregator: &BucketAggregator<S>,
    config: &EngineConfig,
    metrics: &SweepMetrics,
) where
    S: EventSource + BucketStore,
{
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now();
    let since = cutoff(now, config.active_org_lookback);

    let organizations = match store.active_organizations(since).await {
        Ok(organizations) => organizations,
        Err(error) => {
            tracing::error!(%error, "Failed to enumerate active organizations");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    for organization_id in organizations {
        if let Err(error) =
            sweep_organization(store, aggregator, config, metrics, organization_id, now).await
        {
            // The watermark was not advanced, so the next pass naturally
            // retries the same window.
            tracing::error!(
                %error,
                organization_id = %organization_id,
                "Organization sweep failed; watermark not advanced"
            );
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn sweep_organization<S>(
    store: &S,
    aggregator: &BucketAggregator<S>,
    config: &EngineConfig,
    metrics: &SweepMetrics,
    organization_id: OrganizationId,
    now: Timestamp,
) -> EngineResult<()>
where
    S: EventSource + BucketStore,
{
    let watermark = match store.watermark(organization_id).await? {
        Some(watermark) => watermark,
        None => {
            let seeded = Watermark::seeded(
                organization_id,
                now,
                chrono::Duration::from_std(config.watermark_seed_lookback)
                    .unwrap_or_else(|_| chrono::Duration::days(7)),
            );
            store.put_watermark(seeded).await?;
            tracing::info!(
                organization_id = %organization_id,
                last_processed_at = %seeded.last_processed_at,
                "Seeded watermark for new organization"
            );
            seeded
        }
    };

    let slice = store
        .activity_since(organization_id, watermark.last_processed_at)
        .await?;
    for entity_day in &slice.entity_days {
        aggregator
            .recompute(organization_id, entity_day.user_id, entity_day.day)
            .await?;
        metrics
            .entity_days_recomputed
            .fetch_add(1, Ordering::Relaxed);
    }

    // Advance to the maximum event timestamp actually processed, never to
    // wall-clock, so late-written events are not skipped. Wall-clock is the
    // fallback only when the pass saw no events at all.
    let advanced = watermark.advanced_to(slice.max_occurred_at.unwrap_or(now));
    if advanced.last_processed_at > watermark.last_processed_at {
        store.put_watermark(advanced).await?;
    }

    if !slice.entity_days.is_empty() {
        tracing::debug!(
            organization_id = %organization_id,
            entity_days = slice.entity_days.len(),
            last_processed_at = %advanced.last_processed_at,
            "Organization sweep completed"
        );
    }
    Ok(())
}

fn cutoff(now: Timestamp, lookback: std::time::Duration) -> Timestamp {
    chrono::Duration::from_std(lookback)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = SweepMetrics::new();
        metrics.sweep_cycles.store(4, Ordering::Relaxed);
        metrics.entity_days_recomputed.store(12, Ordering::Relaxed);
        metrics.triggers_dropped.store(1, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweep_cycles, 4);
        assert_eq!(snapshot.entity_days_recomputed, 12);
        assert_eq!(snapshot.triggers_dropped, 1);
        assert_eq!(snapshot.sweep_errors, 0);
    }

    #[test]
    fn test_cutoff_subtracts_lookback() {
        let now = Utc::now();
        let since = cutoff(now, std::time::Duration::from_secs(3_600));
        assert_eq!(now - since, Duration::hours(1));
    }

    #[test]
    fn test_cutoff_saturates_on_overflow() {
        let now = Utc::now();
        let since = cutoff(now, std::time::Duration::from_secs(u64::MAX));
        assert!(since < now);
    }
}
