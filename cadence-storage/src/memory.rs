//! In-memory store for tests and embedded use.
//!
//! Uses tokio::sync::RwLock for safe async access. The three bucket
//! families live behind a single lock so `replace_entity_day` is atomic
//! within the process.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cadence_core::{
    week_start, BucketSet, ComplianceBucket, Event, EventKind, MetricScope, OrganizationId,
    PulseBucket, RecognitionBucket, Timestamp, UserId, Watermark,
};
use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::traits::{ActivitySlice, BucketStore, EntityDay, EventSource, StoreResult};

type BucketKey = (OrganizationId, UserId, NaiveDate);

#[derive(Debug, Default)]
struct BucketTables {
    pulse: HashMap<BucketKey, PulseBucket>,
    recognition: HashMap<BucketKey, RecognitionBucket>,
    compliance: HashMap<BucketKey, ComplianceBucket>,
}

/// Read counters, exposed for cache behavior tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub event_reads: u64,
    pub bucket_reads: u64,
}

/// In-memory implementation of both storage seams.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
    /// Declared vacation weeks, keyed by normalized week start.
    vacations: RwLock<HashSet<(OrganizationId, UserId, NaiveDate)>>,
    buckets: RwLock<BucketTables>,
    watermarks: RwLock<HashMap<OrganizationId, Watermark>>,
    event_reads: AtomicU64,
    bucket_reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the log.
    pub async fn record_event(&self, event: Event) {
        self.events.write().await.push(event);
    }

    /// Declare or clear vacation for the ISO week containing `week`.
    pub async fn set_vacation(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        week: NaiveDate,
        on_vacation: bool,
    ) {
        let key = (organization_id, user_id, week_start(week));
        let mut vacations = self.vacations.write().await;
        if on_vacation {
            vacations.insert(key);
        } else {
            vacations.remove(&key);
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            event_reads: self.event_reads.load(Ordering::Relaxed),
            bucket_reads: self.bucket_reads.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventSource for MemoryStore {
    async fn events_for(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: Timestamp,
        to: Timestamp,
        kinds: &[EventKind],
    ) -> StoreResult<Vec<Event>> {
        self.event_reads.fetch_add(1, Ordering::Relaxed);
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| {
                e.organization_id == organization_id
                    && e.occurred_at >= from
                    && e.occurred_at <= to
                    && (kinds.is_empty() || kinds.contains(&e.kind))
                    && scope.matches(e.user_id, e.team_id)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.occurred_at);
        Ok(matched)
    }

    async fn is_on_vacation(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        week: NaiveDate,
    ) -> StoreResult<bool> {
        let vacations = self.vacations.read().await;
        Ok(vacations.contains(&(organization_id, user_id, week_start(week))))
    }

    async fn active_organizations(&self, since: Timestamp) -> StoreResult<Vec<OrganizationId>> {
        self.event_reads.fetch_add(1, Ordering::Relaxed);
        let events = self.events.read().await;
        let orgs: BTreeSet<OrganizationId> = events
            .iter()
            .filter(|e| e.occurred_at >= since)
            .map(|e| e.organization_id)
            .collect();
        Ok(orgs.into_iter().collect())
    }

    async fn activity_since(
        &self,
        organization_id: OrganizationId,
        since: Timestamp,
    ) -> StoreResult<ActivitySlice> {
        self.event_reads.fetch_add(1, Ordering::Relaxed);
        let events = self.events.read().await;
        let mut entity_days = BTreeSet::new();
        let mut max_occurred_at: Option<Timestamp> = None;
        for event in events.iter() {
            if event.organization_id != organization_id || event.occurred_at < since {
                continue;
            }
            entity_days.insert(EntityDay {
                user_id: event.user_id,
                day: event.bucket_date(),
            });
            max_occurred_at = Some(match max_occurred_at {
                Some(current) => current.max(event.occurred_at),
                None => event.occurred_at,
            });
        }
        Ok(ActivitySlice {
            entity_days: entity_days.into_iter().collect(),
            max_occurred_at,
        })
    }

    async fn activity_in_range(
        &self,
        organization_id: OrganizationId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<EntityDay>> {
        self.event_reads.fetch_add(1, Ordering::Relaxed);
        let events = self.events.read().await;
        let entity_days: BTreeSet<EntityDay> = events
            .iter()
            .filter(|e| {
                e.organization_id == organization_id
                    && e.bucket_date() >= from
                    && e.bucket_date() <= to
            })
            .map(|e| EntityDay {
                user_id: e.user_id,
                day: e.bucket_date(),
            })
            .collect();
        Ok(entity_days.into_iter().collect())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn replace_entity_day(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        day: NaiveDate,
        buckets: BucketSet,
    ) -> StoreResult<()> {
        let key = (organization_id, user_id, day);
        let mut tables = self.buckets.write().await;
        tables.pulse.remove(&key);
        tables.recognition.remove(&key);
        tables.compliance.remove(&key);
        if let Some(pulse) = buckets.pulse {
            tables.pulse.insert(key, pulse);
        }
        if let Some(recognition) = buckets.recognition {
            tables.recognition.insert(key, recognition);
        }
        if let Some(compliance) = buckets.compliance {
            tables.compliance.insert(key, compliance);
        }
        Ok(())
    }

    async fn pulse_buckets(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<PulseBucket>> {
        self.bucket_reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.buckets.read().await;
        let mut rows: Vec<PulseBucket> = tables
            .pulse
            .values()
            .filter(|b| {
                b.organization_id == organization_id
                    && b.bucket_date >= from
                    && b.bucket_date <= to
                    && scope.matches(b.user_id, b.team_id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.bucket_date, b.user_id));
        Ok(rows)
    }

    async fn recognition_buckets(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<RecognitionBucket>> {
        self.bucket_reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.buckets.read().await;
        let mut rows: Vec<RecognitionBucket> = tables
            .recognition
            .values()
            .filter(|b| {
                b.organization_id == organization_id
                    && b.bucket_date >= from
                    && b.bucket_date <= to
                    && scope.matches(b.user_id, b.team_id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.bucket_date, b.user_id));
        Ok(rows)
    }

    async fn compliance_buckets(
        &self,
        organization_id: OrganizationId,
        scope: &MetricScope,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<ComplianceBucket>> {
        self.bucket_reads.fetch_add(1, Ordering::Relaxed);
        let tables = self.buckets.read().await;
        let mut rows: Vec<ComplianceBucket> = tables
            .compliance
            .values()
            .filter(|b| {
                b.organization_id == organization_id
                    && b.bucket_date >= from
                    && b.bucket_date <= to
                    && scope.matches(b.user_id, b.team_id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|b| (b.bucket_date, b.user_id));
        Ok(rows)
    }

    async fn watermark(&self, organization_id: OrganizationId) -> StoreResult<Option<Watermark>> {
        let watermarks = self.watermarks.read().await;
        Ok(watermarks.get(&organization_id).copied())
    }

    async fn put_watermark(&self, watermark: Watermark) -> StoreResult<()> {
        let mut watermarks = self.watermarks.write().await;
        watermarks.insert(watermark.organization_id, watermark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{day_window, new_entity_id, Visibility};
    use chrono::{Duration, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn checkin(org: OrganizationId, user: UserId, at: Timestamp, mood: i64) -> Event {
        Event::new(
            org,
            user,
            EventKind::CheckinSubmitted,
            at,
            serde_json::json!({ "mood": mood }),
        )
    }

    #[tokio::test]
    async fn test_events_for_filters_kind_scope_and_window() {
        let store = MemoryStore::new();
        let org = new_entity_id();
        let user_a = new_entity_id();
        let user_b = new_entity_id();
        let day = date(2025, 5, 5);
        let (from, to) = day_window(day);

        store.record_event(checkin(org, user_a, from, 3)).await;
        store.record_event(checkin(org, user_b, from, 4)).await;
        store
            .record_event(Event::new(
                org,
                user_a,
                EventKind::ShoutoutGiven,
                from + Duration::hours(1),
                serde_json::json!({ "visibility": Visibility::Private }),
            ))
            .await;
        // Outside the window.
        store
            .record_event(checkin(org, user_a, to + Duration::milliseconds(1), 5))
            .await;
        // Different organization.
        store
            .record_event(checkin(new_entity_id(), user_a, from, 5))
            .await;

        let all = store
            .events_for(org, &MetricScope::Organization, from, to, &[])
            .await
            .expect("query succeeds");
        assert_eq!(all.len(), 3);

        let user_checkins = store
            .events_for(
                org,
                &MetricScope::User(user_a),
                from,
                to,
                &[EventKind::CheckinSubmitted],
            )
            .await
            .expect("query succeeds");
        assert_eq!(user_checkins.len(), 1);
        assert_eq!(user_checkins[0].user_id, user_a);
    }

    #[tokio::test]
    async fn test_vacation_is_week_normalized() {
        let store = MemoryStore::new();
        let org = new_entity_id();
        let user = new_entity_id();

        // Declared with a Thursday; looked up with the Monday and a Sunday.
        store.set_vacation(org, user, date(2025, 3, 13), true).await;
        assert!(store
            .is_on_vacation(org, user, date(2025, 3, 10))
            .await
            .expect("lookup succeeds"));
        assert!(store
            .is_on_vacation(org, user, date(2025, 3, 16))
            .await
            .expect("lookup succeeds"));
        assert!(!store
            .is_on_vacation(org, user, date(2025, 3, 17))
            .await
            .expect("lookup succeeds"));

        store
            .set_vacation(org, user, date(2025, 3, 10), false)
            .await;
        assert!(!store
            .is_on_vacation(org, user, date(2025, 3, 12))
            .await
            .expect("lookup succeeds"));
    }

    #[tokio::test]
    async fn test_activity_since_reports_max_timestamp() {
        let store = MemoryStore::new();
        let org = new_entity_id();
        let user = new_entity_id();
        let t0 = Utc::now() - Duration::hours(6);

        store.record_event(checkin(org, user, t0 + Duration::hours(1), 3)).await;
        store.record_event(checkin(org, user, t0 + Duration::hours(3), 4)).await;

        let slice = store
            .activity_since(org, t0)
            .await
            .expect("query succeeds");
        assert_eq!(slice.entity_days.len(), 1);
        assert_eq!(slice.max_occurred_at, Some(t0 + Duration::hours(3)));

        let empty = store
            .activity_since(org, t0 + Duration::hours(4))
            .await
            .expect("query succeeds");
        assert!(empty.entity_days.is_empty());
        assert!(empty.max_occurred_at.is_none());
    }

    #[tokio::test]
    async fn test_replace_entity_day_drops_absent_families() {
        let store = MemoryStore::new();
        let org = new_entity_id();
        let user = new_entity_id();
        let day = date(2025, 5, 5);
        let pulse = PulseBucket {
            organization_id: org,
            user_id: user,
            team_id: None,
            bucket_date: day,
            checkin_count: 2,
            mood_sum: 7,
            updated_at: Utc::now(),
        };

        store
            .replace_entity_day(
                org,
                user,
                day,
                BucketSet {
                    pulse: Some(pulse),
                    ..BucketSet::default()
                },
            )
            .await
            .expect("write succeeds");
        let rows = store
            .pulse_buckets(org, &MetricScope::Organization, day, day)
            .await
            .expect("read succeeds");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].checkin_count, 2);

        // Recomputing to an empty day removes the row rather than zeroing it.
        store
            .replace_entity_day(org, user, day, BucketSet::default())
            .await
            .expect("write succeeds");
        let rows = store
            .pulse_buckets(org, &MetricScope::Organization, day, day)
            .await
            .expect("read succeeds");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_watermark_roundtrip() {
        let store = MemoryStore::new();
        let org = new_entity_id();
        assert!(store
            .watermark(org)
            .await
            .expect("read succeeds")
            .is_none());

        let now = Utc::now();
        store
            .put_watermark(Watermark::new(org, now))
            .await
            .expect("write succeeds");
        let stored = store
            .watermark(org)
            .await
            .expect("read succeeds")
            .expect("watermark exists");
        assert_eq!(stored.last_processed_at, now);
    }

    #[tokio::test]
    async fn test_stats_count_reads() {
        let store = MemoryStore::new();
        let org = new_entity_id();
        let day = date(2025, 5, 5);
        let (from, to) = day_window(day);

        let before = store.stats();
        let _ = store
            .events_for(org, &MetricScope::Organization, from, to, &[])
            .await;
        let _ = store
            .pulse_buckets(org, &MetricScope::Organization, day, day)
            .await;
        let after = store.stats();
        assert_eq!(after.event_reads, before.event_reads + 1);
        assert_eq!(after.bucket_reads, before.bucket_reads + 1);
    }
}
