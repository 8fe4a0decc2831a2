//! Collaborator seams for the aggregation engine.
//!
//! Both traits abstract over a queryable relational store. The engine never
//! mutates events; bucket rows and watermarks are fully owned by the
//! aggregation side.

use async_trait::async_trait;
use cadence_core::{
    BucketSet, ComplianceBucket, Event, EventKind, MetricScope, OrganizationId, PulseBucket,
    RecognitionBucket, StoreError, Timestamp, UserId, Watermark,
};
use chrono::NaiveDate;

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One (user, day) pair touched by at least one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityDay {
    pub user_id: UserId,
    pub day: NaiveDate,
}

/// Activity snapshot for a sweep pass.
///
/// `max_occurred_at` is taken from the same query as `entity_days` so the
/// watermark advance can never outrun what was actually enumerated.
#[derive(Debug, Clone, Default)]
pub struct ActivitySlice {
    pub entity_days: Vec<EntityDay>,
    pub max_occurred_at: Option<Timestamp>,
}

/// Read access to the append-only domain event log.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events for an organization within `[from, to]` (inclusive), filtered
    /// by scope and kind. An empty `kinds` slice matches every kind.
    async fn events_for(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: Timestamp,
        to: Timestamp,
        kinds: &[EventKind],
    ) -> StoreResult<Vec<Event>>;

    /// Whether the user has declared vacation for the ISO week starting at
    /// `week_start` (Monday).
    async fn is_on_vacation(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        week_start: NaiveDate,
    ) -> StoreResult<bool>;

    /// Organizations with at least one event at or after `since`.
    async fn active_organizations(&self, since: Timestamp) -> StoreResult<Vec<OrganizationId>>;

    /// Distinct entity-days touched by events at or after `since`, together
    /// with the maximum event timestamp observed.
    async fn activity_since(
        &self,
        organization_id: OrganizationId,
        since: Timestamp,
    ) -> StoreResult<ActivitySlice>;

    /// Distinct entity-days with activity on days within `[from, to]`.
    async fn activity_in_range(
        &self,
        organization_id: OrganizationId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<EntityDay>>;
}

/// Ownership of the three rollup families and the per-organization watermark.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Replace all three family rows for one entity-day in a single call.
    ///
    /// A `None` family drops any existing row (absence means "no activity").
    /// Implementations should make the three writes atomic; the in-memory
    /// store holds one write lock, a relational store should use one
    /// transaction.
    async fn replace_entity_day(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        day: NaiveDate,
        buckets: BucketSet,
    ) -> StoreResult<()>;

    /// Pulse rows for a scope within `[from, to]` (inclusive bucket dates).
    async fn pulse_buckets(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<PulseBucket>>;

    /// Recognition rows for a scope within `[from, to]`.
    async fn recognition_buckets(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<RecognitionBucket>>;

    /// Compliance rows for a scope within `[from, to]`.
    async fn compliance_buckets(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<ComplianceBucket>>;

    /// The organization's watermark, if one has been created.
    async fn watermark(&self, organization_id: OrganizationId) -> StoreResult<Option<Watermark>>;

    /// Upsert the organization's watermark.
    async fn put_watermark(&self, watermark: Watermark) -> StoreResult<()>;
}
