//! Cadence Engine - Incremental Analytics Aggregation
//!
//! Keeps precomputed daily rollups (pulse, recognition, compliance)
//! consistent with a continuously-written event log, while serving
//! analytics queries from either the rollups or the raw log depending on
//! freshness requirements.
//!
//! Control flow:
//!
//! - writes -> [`AnalyticsEngine::trigger_recompute`] (queued, async) ->
//!   [`BucketAggregator`] -> bucket store
//! - timer -> [`SweepScheduler`] -> [`BucketAggregator`] -> bucket store,
//!   advancing the per-organization watermark
//! - reads -> [`QueryRouter`] (cache, else rollups or raw events) -> cache
//!   fill
//!
//! Consistency contract: after a successful write, the corresponding bucket
//! should reflect it within one trigger round-trip; the periodic sweep
//! bounds total staleness to the sweep interval even if the trigger is
//! lost. Recomputation is idempotent, so duplicated work is safe.

pub mod aggregator;
pub mod cache;
pub mod compliance;
pub mod config;
pub mod query;
pub mod scheduler;

use std::sync::Arc;

use cadence_core::{EngineResult, OrganizationId, Timestamp, UserId};
use cadence_storage::{BucketStore, EventSource};
use chrono::NaiveDate;

pub use aggregator::BucketAggregator;
pub use cache::{QueryCache, QueryKey, QueryMethod};
pub use compliance::{
    checkin_metrics, fold_compliance, on_time_percentage, resolve_week, review_metrics,
    ComplianceInput, ComplianceMetrics,
};
pub use config::EngineConfig;
pub use query::{
    PulseMetrics, PulsePoint, QueryOptions, QueryRouter, ShoutoutMetrics, ShoutoutPoint,
};
pub use scheduler::{SweepMetrics, SweepScheduler, SweepSnapshot};

/// The assembled engine: aggregator, scheduler, and query router over one
/// store handle.
///
/// Explicitly constructed and owned by the process's startup/shutdown
/// lifecycle; there is no global instance.
pub struct AnalyticsEngine<S> {
    aggregator: Arc<BucketAggregator<S>>,
    scheduler: SweepScheduler<S>,
    router: QueryRouter<S>,
}

impl<S> AnalyticsEngine<S>
where
    S: EventSource + BucketStore + 'static,
{
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let aggregator = Arc::new(BucketAggregator::new(store.clone()));
        let scheduler = SweepScheduler::new(store.clone(), aggregator.clone(), config.clone());
        let router = QueryRouter::new(store, config);
        Self {
            aggregator,
            scheduler,
            router,
        }
    }

    /// Recompute one entity-day synchronously.
    pub async fn recompute(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        day: NaiveDate,
    ) -> EngineResult<()> {
        self.aggregator.recompute(organization_id, user_id, day).await
    }

    /// Enqueue one entity-day for asynchronous recomputation. Fire-and-forget.
    pub async fn trigger_recompute(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        activity_at: Timestamp,
    ) {
        self.scheduler
            .trigger_recompute(organization_id, user_id, activity_at)
            .await;
    }

    /// Start the periodic sweep and trigger worker. Idempotent.
    pub async fn start_periodic_sweep(&self) {
        self.scheduler.start().await;
    }

    /// Stop the background tasks, draining queued triggers. Idempotent.
    pub async fn stop_periodic_sweep(&self) {
        self.scheduler.stop().await;
    }

    /// Run one sweep pass inline, outside the timer.
    pub async fn sweep_now(&self) {
        self.scheduler.sweep_now().await;
    }

    /// Operator-invoked recomputation over an explicit date range.
    pub async fn backfill_historical_data(
        &self,
        organization_id: OrganizationId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<u64> {
        self.scheduler.backfill(organization_id, from, to).await
    }

    pub async fn pulse_metrics(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<PulseMetrics> {
        self.router.pulse_metrics(organization_id, options).await
    }

    pub async fn shoutout_metrics(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<ShoutoutMetrics> {
        self.router.shoutout_metrics(organization_id, options).await
    }

    pub async fn checkin_compliance_metrics(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<ComplianceMetrics> {
        self.router.checkin_compliance(organization_id, options).await
    }

    pub async fn review_compliance_metrics(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<ComplianceMetrics> {
        self.router.review_compliance(organization_id, options).await
    }

    /// Invalidate cached analytics after a write that could change this
    /// organization's answers (check-in, shoutout, vacation change).
    /// Returns the number of entries dropped.
    pub async fn note_write(&self, organization_id: OrganizationId) -> usize {
        self.router.invalidate_organization(organization_id).await
    }

    /// Whether the background tasks are running.
    pub async fn is_running(&self) -> bool {
        self.scheduler.is_running().await
    }

    pub fn sweep_metrics(&self) -> SweepSnapshot {
        self.scheduler.metrics()
    }
}
