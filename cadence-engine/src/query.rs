//! Query Router
//!
//! Decides, per analytics request, whether to read the precomputed rollups
//! or the raw event log, and memoizes results with a TTL keyed by query
//! shape.
//!
//! Read-path decision, in order: a coarse period (week and up) always reads
//! rollups; a day-level query reads rollups only when the whole window is
//! older than the freshness threshold, because rollups for recent days may
//! not yet reflect triggered recomputes still in flight; without a period
//! the raw log is used. A feature flag forces the raw path everywhere, and
//! a second flag enables shadow reads: the non-chosen path is also executed
//! and a divergence report logged (counts only) without affecting the
//! served result.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadence_core::{
    day_window, period_start, ComplianceCounts, EngineResult, Event, EventKind, MetricScope,
    OrganizationId, Period, QueryError,
};
use cadence_storage::{BucketStore, EventSource};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregator::{
    fold_pulse, fold_recognition, resolve_compliance_inputs, PulseTotals, RecognitionTotals,
};
use crate::cache::{QueryCache, QueryKey, QueryMethod};
use crate::compliance::{self, fold_compliance, ComplianceMetrics};
use crate::config::EngineConfig;

/// Trailing window applied when a query carries no dates.
const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Options accepted by every analytics query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub scope: MetricScope,
    pub period: Option<Period>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl QueryOptions {
    pub fn organization() -> Self {
        Self {
            scope: MetricScope::Organization,
            period: None,
            from: None,
            to: None,
        }
    }

    pub fn user(user_id: cadence_core::UserId) -> Self {
        Self {
            scope: MetricScope::User(user_id),
            ..Self::organization()
        }
    }

    pub fn team(team_id: cadence_core::TeamId) -> Self {
        Self {
            scope: MetricScope::Team(team_id),
            ..Self::organization()
        }
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn with_window(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }
}

/// One period of pulse activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsePoint {
    pub period_start: NaiveDate,
    pub checkin_count: i64,
    pub mood_sum: i64,
}

/// Pulse (mood) metrics over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseMetrics {
    pub checkin_count: i64,
    pub mood_sum: i64,
    pub average_mood: Option<f64>,
    pub series: Vec<PulsePoint>,
}

/// One period of recognition activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoutoutPoint {
    pub period_start: NaiveDate,
    pub received_public: i64,
    pub received_private: i64,
    pub given_public: i64,
    pub given_private: i64,
}

/// Recognition metrics over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoutoutMetrics {
    pub received_public: i64,
    pub received_private: i64,
    pub given_public: i64,
    pub given_private: i64,
    pub series: Vec<ShoutoutPoint>,
}

/// Routes analytics queries between rollups and the raw event log.
pub struct QueryRouter<S> {
    store: Arc<S>,
    cache: QueryCache,
    config: EngineConfig,
}

impl<S> QueryRouter<S>
where
    S: EventSource + BucketStore,
{
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            cache: QueryCache::new(),
            config,
        }
    }

    /// Drop every cached answer for an organization. Called after any write
    /// that could change its analytics.
    pub async fn invalidate_organization(&self, organization_id: OrganizationId) -> usize {
        let removed = self.cache.invalidate_organization(organization_id).await;
        if removed > 0 {
            debug!(
                organization_id = %organization_id,
                removed,
                "Invalidated cached analytics"
            );
        }
        removed
    }

    pub async fn pulse_metrics(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<PulseMetrics> {
        let (from, to) = self.resolved_window(options)?;
        let key = QueryKey::new(organization_id, QueryMethod::PulseMetrics, options);
        if let Some(cached) = self.cache_lookup::<PulseMetrics>(&key).await {
            return Ok(cached);
        }

        let period = options.period.unwrap_or(Period::Day);
        let use_rollups = self.uses_rollups(options.period, to);
        let result = if use_rollups {
            self.pulse_from_rollups(organization_id, &options.scope, period, from, to)
                .await?
        } else {
            self.pulse_from_raw(organization_id, &options.scope, period, from, to)
                .await?
        };

        if self.config.shadow_reads {
            let shadow = if use_rollups {
                self.pulse_from_raw(organization_id, &options.scope, period, from, to)
                    .await
            } else {
                self.pulse_from_rollups(organization_id, &options.scope, period, from, to)
                    .await
            };
            match shadow {
                Ok(shadow) => {
                    if shadow.checkin_count != result.checkin_count
                        || shadow.series.len() != result.series.len()
                    {
                        warn!(
                            organization_id = %organization_id,
                            used_rollups = use_rollups,
                            served_count = result.checkin_count,
                            shadow_count = shadow.checkin_count,
                            served_points = result.series.len(),
                            shadow_points = shadow.series.len(),
                            "Shadow read divergence for pulse metrics"
                        );
                    }
                }
                Err(error) => warn!(%error, "Shadow read failed for pulse metrics"),
            }
        }

        self.cache_store(key, &result, to).await;
        Ok(result)
    }

    pub async fn shoutout_metrics(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<ShoutoutMetrics> {
        let (from, to) = self.resolved_window(options)?;
        let key = QueryKey::new(organization_id, QueryMethod::ShoutoutMetrics, options);
        if let Some(cached) = self.cache_lookup::<ShoutoutMetrics>(&key).await {
            return Ok(cached);
        }

        let period = options.period.unwrap_or(Period::Day);
        let use_rollups = self.uses_rollups(options.period, to);
        let result = if use_rollups {
            self.shoutouts_from_rollups(organization_id, &options.scope, period, from, to)
                .await?
        } else {
            self.shoutouts_from_raw(organization_id, &options.scope, period, from, to)
                .await?
        };

        if self.config.shadow_reads {
            let shadow = if use_rollups {
                self.shoutouts_from_raw(organization_id, &options.scope, period, from, to)
                    .await
            } else {
                self.shoutouts_from_rollups(organization_id, &options.scope, period, from, to)
                    .await
            };
            match shadow {
                Ok(shadow) => {
                    let served = result.received_public
                        + result.received_private
                        + result.given_public
                        + result.given_private;
                    let other = shadow.received_public
                        + shadow.received_private
                        + shadow.given_public
                        + shadow.given_private;
                    if served != other {
                        warn!(
                            organization_id = %organization_id,
                            used_rollups = use_rollups,
                            served_total = served,
                            shadow_total = other,
                            "Shadow read divergence for shoutout metrics"
                        );
                    }
                }
                Err(error) => warn!(%error, "Shadow read failed for shoutout metrics"),
            }
        }

        self.cache_store(key, &result, to).await;
        Ok(result)
    }

    pub async fn checkin_compliance(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<ComplianceMetrics> {
        let (from, to) = self.resolved_window(options)?;
        let key = QueryKey::new(organization_id, QueryMethod::CheckinCompliance, options);
        if let Some(cached) = self.cache_lookup::<ComplianceMetrics>(&key).await {
            return Ok(cached);
        }

        let counts = self
            .compliance_counts(organization_id, &options.scope, options.period, from, to)
            .await?;
        let result = compliance::checkin_metrics(&counts);
        self.cache_store(key, &result, to).await;
        Ok(result)
    }

    pub async fn review_compliance(
        &self,
        organization_id: OrganizationId,
        options: &QueryOptions,
    ) -> EngineResult<ComplianceMetrics> {
        let (from, to) = self.resolved_window(options)?;
        let key = QueryKey::new(organization_id, QueryMethod::ReviewCompliance, options);
        if let Some(cached) = self.cache_lookup::<ComplianceMetrics>(&key).await {
            return Ok(cached);
        }

        let counts = self
            .compliance_counts(organization_id, &options.scope, options.period, from, to)
            .await?;
        let result = compliance::review_metrics(&counts);
        self.cache_store(key, &result, to).await;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    async fn pulse_from_rollups(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        period: Period,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<PulseMetrics> {
        let buckets = self
            .store
            .pulse_buckets(organization_id, scope, from, to)
            .await?;
        let mut groups: BTreeMap<NaiveDate, PulseTotals> = BTreeMap::new();
        for bucket in &buckets {
            let totals = groups
                .entry(period_start(bucket.bucket_date, period))
                .or_default();
            totals.checkin_count += bucket.checkin_count;
            totals.mood_sum += bucket.mood_sum;
        }
        Ok(build_pulse_metrics(groups))
    }

    async fn pulse_from_raw(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        period: Period,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<PulseMetrics> {
        let (window_start, _) = day_window(from);
        let (_, window_end) = day_window(to);
        let events = self
            .store
            .events_for(
                organization_id,
                scope,
                window_start,
                window_end,
                &[EventKind::CheckinSubmitted],
            )
            .await?;
        let mut groups: BTreeMap<NaiveDate, PulseTotals> = BTreeMap::new();
        for (start, group) in group_by_period(&events, period) {
            groups.insert(start, fold_pulse(group));
        }
        Ok(build_pulse_metrics(groups))
    }

    async fn shoutouts_from_rollups(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        period: Period,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<ShoutoutMetrics> {
        let buckets = self
            .store
            .recognition_buckets(organization_id, scope, from, to)
            .await?;
        let mut groups: BTreeMap<NaiveDate, RecognitionTotals> = BTreeMap::new();
        for bucket in &buckets {
            let totals = groups
                .entry(period_start(bucket.bucket_date, period))
                .or_default();
            totals.received_public += bucket.received_public;
            totals.received_private += bucket.received_private;
            totals.given_public += bucket.given_public;
            totals.given_private += bucket.given_private;
        }
        Ok(build_shoutout_metrics(groups))
    }

    async fn shoutouts_from_raw(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        period: Period,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<ShoutoutMetrics> {
        let (window_start, _) = day_window(from);
        let (_, window_end) = day_window(to);
        let events = self
            .store
            .events_for(
                organization_id,
                scope,
                window_start,
                window_end,
                &[EventKind::ShoutoutGiven, EventKind::ShoutoutReceived],
            )
            .await?;
        let mut groups: BTreeMap<NaiveDate, RecognitionTotals> = BTreeMap::new();
        for (start, group) in group_by_period(&events, period) {
            groups.insert(start, fold_recognition(group));
        }
        Ok(build_shoutout_metrics(groups))
    }

    async fn compliance_counts(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        period: Option<Period>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<ComplianceCounts> {
        let use_rollups = self.uses_rollups(period, to);
        let counts = if use_rollups {
            self.compliance_from_rollups(organization_id, scope, from, to)
                .await?
        } else {
            self.compliance_from_raw(organization_id, scope, from, to)
                .await?
        };

        if self.config.shadow_reads {
            let shadow = if use_rollups {
                self.compliance_from_raw(organization_id, scope, from, to)
                    .await
            } else {
                self.compliance_from_rollups(organization_id, scope, from, to)
                    .await
            };
            match shadow {
                Ok(shadow) => {
                    if (shadow.checkin_due, shadow.checkin_on_time, shadow.review_due)
                        != (counts.checkin_due, counts.checkin_on_time, counts.review_due)
                    {
                        warn!(
                            organization_id = %organization_id,
                            used_rollups = use_rollups,
                            served_due = counts.checkin_due,
                            shadow_due = shadow.checkin_due,
                            served_on_time = counts.checkin_on_time,
                            shadow_on_time = shadow.checkin_on_time,
                            "Shadow read divergence for compliance counts"
                        );
                    }
                }
                Err(error) => warn!(%error, "Shadow read failed for compliance counts"),
            }
        }

        Ok(counts)
    }

    async fn compliance_from_rollups(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<ComplianceCounts> {
        let buckets = self
            .store
            .compliance_buckets(organization_id, scope, from, to)
            .await?;
        let mut counts = ComplianceCounts::default();
        for bucket in &buckets {
            counts.merge(&bucket.counts);
        }
        Ok(counts)
    }

    async fn compliance_from_raw(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> EngineResult<ComplianceCounts> {
        let (window_start, _) = day_window(from);
        let (_, window_end) = day_window(to);
        let events = self
            .store
            .events_for(
                organization_id,
                scope,
                window_start,
                window_end,
                &[EventKind::CheckinSubmitted],
            )
            .await?;
        let inputs =
            resolve_compliance_inputs(self.store.as_ref(), organization_id, &events).await?;
        Ok(fold_compliance(&inputs))
    }

    // ------------------------------------------------------------------
    // Decision procedure
    // ------------------------------------------------------------------

    fn resolved_window(&self, options: &QueryOptions) -> EngineResult<(NaiveDate, NaiveDate)> {
        let today = Utc::now().date_naive();
        let (from, to) = match (options.from, options.to) {
            (Some(from), Some(to)) => (from, to),
            (Some(from), None) => (from, today),
            (None, Some(to)) => (to - Duration::days(DEFAULT_WINDOW_DAYS - 1), to),
            (None, None) => (today - Duration::days(DEFAULT_WINDOW_DAYS - 1), today),
        };
        if from > to {
            return Err(QueryError::InvalidWindow { from, to }.into());
        }
        Ok((from, to))
    }

    fn uses_rollups(&self, period: Option<Period>, window_to: NaiveDate) -> bool {
        if !self.config.rollups_enabled {
            return false;
        }
        match period {
            Some(period) if period.is_coarse() => true,
            Some(_) => self.window_is_stable(window_to),
            None => false,
        }
    }

    /// A window is stable when it ends before the freshness threshold;
    /// anything touching the threshold may still have recomputes in flight.
    fn window_is_stable(&self, window_to: NaiveDate) -> bool {
        let today = Utc::now().date_naive();
        window_to < today - Duration::days(self.config.freshness_window_days)
    }

    fn ttl_for(&self, window_to: NaiveDate) -> std::time::Duration {
        if self.window_is_stable(window_to) {
            self.config.stable_ttl
        } else {
            self.config.recent_ttl
        }
    }

    async fn cache_lookup<T: serde::de::DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let value = self.cache.get(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(error) => {
                // Cache trouble is never fatal; recompute directly.
                warn!(
                    %error,
                    method = key.method.as_str(),
                    "Dropping undecodable cache entry"
                );
                None
            }
        }
    }

    async fn cache_store<T: Serialize>(&self, key: QueryKey, value: &T, window_to: NaiveDate) {
        let ttl = self.ttl_for(window_to);
        match serde_json::to_value(value) {
            Ok(json) => self.cache.put(key, json, ttl).await,
            Err(error) => warn!(%error, "Failed to serialize query result for cache"),
        }
    }
}

fn group_by_period(events: &[Event], period: Period) -> BTreeMap<NaiveDate, Vec<&Event>> {
    let mut groups: BTreeMap<NaiveDate, Vec<&Event>> = BTreeMap::new();
    for event in events {
        groups
            .entry(period_start(event.bucket_date(), period))
            .or_default()
            .push(event);
    }
    groups
}

fn build_pulse_metrics(groups: BTreeMap<NaiveDate, PulseTotals>) -> PulseMetrics {
    let series: Vec<PulsePoint> = groups
        .into_iter()
        .filter(|(_, totals)| totals.checkin_count > 0)
        .map(|(start, totals)| PulsePoint {
            period_start: start,
            checkin_count: totals.checkin_count,
            mood_sum: totals.mood_sum,
        })
        .collect();
    let checkin_count: i64 = series.iter().map(|p| p.checkin_count).sum();
    let mood_sum: i64 = series.iter().map(|p| p.mood_sum).sum();
    let average_mood = if checkin_count > 0 {
        Some(mood_sum as f64 / checkin_count as f64)
    } else {
        None
    };
    PulseMetrics {
        checkin_count,
        mood_sum,
        average_mood,
        series,
    }
}

fn build_shoutout_metrics(groups: BTreeMap<NaiveDate, RecognitionTotals>) -> ShoutoutMetrics {
    let series: Vec<ShoutoutPoint> = groups
        .into_iter()
        .filter(|(_, totals)| !totals.is_empty())
        .map(|(start, totals)| ShoutoutPoint {
            period_start: start,
            received_public: totals.received_public,
            received_private: totals.received_private,
            given_public: totals.given_public,
            given_private: totals.given_private,
        })
        .collect();
    ShoutoutMetrics {
        received_public: series.iter().map(|p| p.received_public).sum(),
        received_private: series.iter().map(|p| p.received_private).sum(),
        given_public: series.iter().map(|p| p.given_public).sum(),
        given_private: series.iter().map(|p| p.given_private).sum(),
        series,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_storage::MemoryStore;

    fn router() -> QueryRouter<MemoryStore> {
        QueryRouter::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    fn router_with(config: EngineConfig) -> QueryRouter<MemoryStore> {
        QueryRouter::new(Arc::new(MemoryStore::new()), config)
    }

    #[test]
    fn test_uses_rollups_decision_table() {
        let router = router();
        let today = Utc::now().date_naive();
        let stale = today - Duration::days(30);
        let recent = today - Duration::days(2);

        // Coarse periods always use rollups, even for recent windows.
        assert!(router.uses_rollups(Some(Period::Month), recent));
        assert!(router.uses_rollups(Some(Period::Week), today));

        // Day-level queries use rollups only for stable windows.
        assert!(router.uses_rollups(Some(Period::Day), stale));
        assert!(!router.uses_rollups(Some(Period::Day), recent));
        assert!(!router.uses_rollups(Some(Period::Day), today));

        // No period information defaults to raw.
        assert!(!router.uses_rollups(None, stale));
    }

    #[test]
    fn test_rollups_flag_forces_raw() {
        let router = router_with(EngineConfig {
            rollups_enabled: false,
            ..EngineConfig::default()
        });
        let stale = Utc::now().date_naive() - Duration::days(30);
        assert!(!router.uses_rollups(Some(Period::Month), stale));
        assert!(!router.uses_rollups(Some(Period::Day), stale));
    }

    #[test]
    fn test_ttl_tracks_window_age() {
        let router = router();
        let today = Utc::now().date_naive();
        assert_eq!(
            router.ttl_for(today - Duration::days(30)),
            router.config.stable_ttl
        );
        assert_eq!(router.ttl_for(today), router.config.recent_ttl);
        // The freshness boundary itself is still "recent".
        assert_eq!(
            router.ttl_for(today - Duration::days(7)),
            router.config.recent_ttl
        );
    }

    #[test]
    fn test_resolved_window_defaults_and_validation() {
        let router = router();
        let today = Utc::now().date_naive();

        let (from, to) = router
            .resolved_window(&QueryOptions::organization())
            .expect("window resolves");
        assert_eq!(to, today);
        assert_eq!((to - from).num_days(), DEFAULT_WINDOW_DAYS - 1);

        let inverted = QueryOptions::organization()
            .with_window(today, today - Duration::days(1));
        let err = router
            .resolved_window(&inverted)
            .expect_err("inverted window rejected");
        assert!(matches!(
            err,
            cadence_core::EngineError::Query(QueryError::InvalidWindow { .. })
        ));
    }
}
