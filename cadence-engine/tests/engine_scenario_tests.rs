//! End-to-end scenarios for the aggregation engine against the in-memory
//! store: recompute idempotence, watermark semantics, read-path selection,
//! cache behavior, and the vacation asymmetry.

use std::sync::Arc;

use cadence_core::{
    day_window, new_entity_id, BucketSet, Event, EventKind, MetricScope, OrganizationId, Period,
    PulseBucket, Timestamp, UserId, Watermark,
};
use cadence_engine::{AnalyticsEngine, EngineConfig, QueryOptions};
use cadence_storage::{BucketStore, EventSource, MemoryStore};
use chrono::{Duration, NaiveDate, Utc};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

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

fn checkin_with_due(
    org: OrganizationId,
    user: UserId,
    at: Timestamp,
    due_at: Timestamp,
    week_of: NaiveDate,
) -> Event {
    Event::new(
        org,
        user,
        EventKind::CheckinSubmitted,
        at,
        serde_json::json!({ "mood": 3, "due_at": due_at, "week_of": week_of }),
    )
}

fn engine(store: Arc<MemoryStore>) -> AnalyticsEngine<MemoryStore> {
    AnalyticsEngine::new(store, EngineConfig::default())
}

#[tokio::test]
async fn test_pulse_recompute_is_a_full_overwrite() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let day = Utc::now().date_naive() - Duration::days(1);
    let at = day.and_hms_opt(9, 0, 0).expect("valid time").and_utc();

    store.record_event(checkin(org, user, at, 4)).await;
    engine.recompute(org, user, day).await.expect("recompute succeeds");

    let rows = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].checkin_count, 1);
    assert_eq!(rows[0].mood_sum, 4);

    // A second check-in on the same day is folded from raw, not added
    // incrementally.
    store
        .record_event(checkin(org, user, at + Duration::minutes(30), 2))
        .await;
    engine.recompute(org, user, day).await.expect("recompute succeeds");

    let rows = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].checkin_count, 2);
    assert_eq!(rows[0].mood_sum, 6);
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let day = Utc::now().date_naive() - Duration::days(1);
    let at = day.and_hms_opt(9, 0, 0).expect("valid time").and_utc();

    store.record_event(checkin(org, user, at, 5)).await;
    store
        .record_event(Event::new(
            org,
            user,
            EventKind::ShoutoutReceived,
            at + Duration::minutes(5),
            serde_json::json!({ "visibility": "private" }),
        ))
        .await;

    engine.recompute(org, user, day).await.expect("recompute succeeds");
    let pulse_first = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    let recognition_first = store
        .recognition_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");

    engine.recompute(org, user, day).await.expect("recompute succeeds");
    let pulse_second = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    let recognition_second = store
        .recognition_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");

    assert_eq!(pulse_first.len(), 1);
    assert_eq!(pulse_first[0].checkin_count, pulse_second[0].checkin_count);
    assert_eq!(pulse_first[0].mood_sum, pulse_second[0].mood_sum);
    assert_eq!(
        recognition_first[0].received_private,
        recognition_second[0].received_private
    );
}

#[tokio::test]
async fn test_absence_invariant() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let at = Utc::now() - Duration::hours(2);
    let day = at.date_naive();

    // A stale row exists but the day has no qualifying events (a vacation
    // declaration produces no bucket of its own).
    store
        .replace_entity_day(
            org,
            user,
            day,
            BucketSet {
                pulse: Some(PulseBucket {
                    organization_id: org,
                    user_id: user,
                    team_id: None,
                    bucket_date: day,
                    checkin_count: 9,
                    mood_sum: 9,
                    updated_at: Utc::now(),
                }),
                ..BucketSet::default()
            },
        )
        .await
        .expect("seed succeeds");
    store
        .record_event(Event::new(
            org,
            user,
            EventKind::VacationDeclared,
            at,
            serde_json::json!({}),
        ))
        .await;

    engine.recompute(org, user, day).await.expect("recompute succeeds");

    let pulse = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    let compliance = store
        .compliance_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    assert!(pulse.is_empty(), "zero activity must mean no row, not a zero row");
    assert!(compliance.is_empty());
}

#[tokio::test]
async fn test_compliance_asymmetry_end_to_end() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();

    // Four weekly check-ins in June 2025; the user was on vacation in the
    // fourth week. Due Fridays 17:00.
    let weeks = [
        (date(2025, 6, 2), true),   // on time
        (date(2025, 6, 9), true),   // on time
        (date(2025, 6, 16), false), // late
        (date(2025, 6, 23), true),  // on time, vacation week
    ];
    for (monday, on_time) in weeks {
        let due = (monday + Duration::days(4)).and_hms_opt(17, 0, 0).expect("valid time").and_utc();
        let submitted = if on_time {
            due - Duration::hours(3)
        } else {
            due + Duration::days(1)
        };
        store
            .record_event(checkin_with_due(org, user, submitted, due, monday))
            .await;
    }
    store.set_vacation(org, user, date(2025, 6, 23), true).await;

    let options = QueryOptions::user(user).with_window(date(2025, 6, 1), date(2025, 6, 30));
    let metrics = engine
        .checkin_compliance_metrics(org, &options)
        .await
        .expect("query succeeds");

    assert_eq!(metrics.total_due_count, 3);
    assert_eq!(metrics.on_time_count, 3);
    assert!((metrics.on_time_percentage - 100.0).abs() < f64::EPSILON);
    assert!(metrics.average_days_early.is_some());
    assert!(metrics.average_days_late.is_some());
}

#[tokio::test]
async fn test_sweep_advances_watermark_to_max_event_timestamp() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let t0 = Utc::now() - Duration::hours(6);

    store
        .put_watermark(Watermark::new(org, t0))
        .await
        .expect("seed watermark");
    store
        .record_event(checkin(org, user, t0 + Duration::hours(1), 4))
        .await;
    store
        .record_event(checkin(org, user, t0 + Duration::hours(3), 3))
        .await;

    engine.sweep_now().await;

    let watermark = store
        .watermark(org)
        .await
        .expect("read succeeds")
        .expect("watermark exists");
    // The maximum processed event timestamp, not "now".
    assert_eq!(watermark.last_processed_at, t0 + Duration::hours(3));

    let day = (t0 + Duration::hours(1)).date_naive();
    let rows = store
        .pulse_buckets(org, &MetricScope::User(user), day - Duration::days(1), day + Duration::days(1))
        .await
        .expect("read succeeds");
    let total: i64 = rows.iter().map(|b| b.checkin_count).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_sweep_seeds_missing_watermark() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let at = Utc::now() - Duration::hours(1);

    store.record_event(checkin(org, user, at, 4)).await;
    engine.sweep_now().await;

    let watermark = store
        .watermark(org)
        .await
        .expect("read succeeds")
        .expect("watermark created lazily");
    assert_eq!(watermark.last_processed_at, at);
}

#[tokio::test]
async fn test_empty_sweep_falls_back_to_wall_clock() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();

    // The only event is already behind the watermark, so the pass observes
    // nothing and falls back to wall-clock.
    store
        .record_event(checkin(org, user, Utc::now() - Duration::hours(1), 4))
        .await;
    let watermark = Watermark::new(org, Utc::now() - Duration::minutes(30));
    store.put_watermark(watermark).await.expect("seed watermark");

    let before = Utc::now();
    engine.sweep_now().await;
    let after = Utc::now();

    let advanced = store
        .watermark(org)
        .await
        .expect("read succeeds")
        .expect("watermark exists");
    assert!(advanced.last_processed_at >= before);
    assert!(advanced.last_processed_at <= after);
}

#[tokio::test]
async fn test_cache_hit_and_write_invalidation() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let day = Utc::now().date_naive() - Duration::days(1);
    let at = day.and_hms_opt(9, 0, 0).expect("valid time").and_utc();

    store.record_event(checkin(org, user, at, 4)).await;
    let options = QueryOptions::organization().with_window(day - Duration::days(3), day);

    let first = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(first.checkin_count, 1);
    let reads_after_first = store.stats().event_reads;

    // Identical options within the TTL: served from cache, no store reads.
    let second = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(second, first);
    assert_eq!(store.stats().event_reads, reads_after_first);

    // An organization-scoped write invalidates; the next query recomputes.
    store
        .record_event(checkin(org, user, at + Duration::minutes(10), 2))
        .await;
    let dropped = engine.note_write(org).await;
    assert!(dropped >= 1);

    let third = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(third.checkin_count, 2);
    assert!(store.stats().event_reads > reads_after_first);
}

#[tokio::test]
async fn test_month_period_reads_rollups() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let day = Utc::now().date_naive() - Duration::days(3);

    // A rollup row with no backing events: only the rollup path can see it.
    store
        .replace_entity_day(
            org,
            user,
            day,
            BucketSet {
                pulse: Some(PulseBucket {
                    organization_id: org,
                    user_id: user,
                    team_id: None,
                    bucket_date: day,
                    checkin_count: 5,
                    mood_sum: 20,
                    updated_at: Utc::now(),
                }),
                ..BucketSet::default()
            },
        )
        .await
        .expect("seed succeeds");

    let options = QueryOptions::organization()
        .with_period(Period::Month)
        .with_window(day - Duration::days(40), day);
    let metrics = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(metrics.checkin_count, 5);
    assert_eq!(metrics.mood_sum, 20);
}

#[tokio::test]
async fn test_recent_day_window_reads_raw_even_when_rollups_exist() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let today = Utc::now().date_naive();

    store
        .replace_entity_day(
            org,
            user,
            today - Duration::days(1),
            BucketSet {
                pulse: Some(PulseBucket {
                    organization_id: org,
                    user_id: user,
                    team_id: None,
                    bucket_date: today - Duration::days(1),
                    checkin_count: 5,
                    mood_sum: 20,
                    updated_at: Utc::now(),
                }),
                ..BucketSet::default()
            },
        )
        .await
        .expect("seed succeeds");

    // Day-level query touching the last 7 days: the raw log wins, and it
    // has no events.
    let options = QueryOptions::organization()
        .with_period(Period::Day)
        .with_window(today - Duration::days(2), today);
    let metrics = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(metrics.checkin_count, 0);
    assert!(metrics.series.is_empty());
}

#[tokio::test]
async fn test_rollups_flag_forces_raw_everywhere() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = AnalyticsEngine::new(
        store.clone(),
        EngineConfig {
            rollups_enabled: false,
            ..EngineConfig::default()
        },
    );
    let org = new_entity_id();
    let user = new_entity_id();
    let day = Utc::now().date_naive() - Duration::days(60);

    store
        .replace_entity_day(
            org,
            user,
            day,
            BucketSet {
                pulse: Some(PulseBucket {
                    organization_id: org,
                    user_id: user,
                    team_id: None,
                    bucket_date: day,
                    checkin_count: 5,
                    mood_sum: 20,
                    updated_at: Utc::now(),
                }),
                ..BucketSet::default()
            },
        )
        .await
        .expect("seed succeeds");

    let options = QueryOptions::organization()
        .with_period(Period::Month)
        .with_window(day - Duration::days(10), day);
    let metrics = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(metrics.checkin_count, 0);
}

#[tokio::test]
async fn test_shadow_reads_do_not_change_the_result() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = AnalyticsEngine::new(
        store.clone(),
        EngineConfig {
            shadow_reads: true,
            ..EngineConfig::default()
        },
    );
    let org = new_entity_id();
    let user = new_entity_id();
    let day = Utc::now().date_naive() - Duration::days(3);

    // Rollup and raw disagree on purpose; the served value stays the
    // rollup answer and the divergence is only logged.
    store
        .replace_entity_day(
            org,
            user,
            day,
            BucketSet {
                pulse: Some(PulseBucket {
                    organization_id: org,
                    user_id: user,
                    team_id: None,
                    bucket_date: day,
                    checkin_count: 5,
                    mood_sum: 20,
                    updated_at: Utc::now(),
                }),
                ..BucketSet::default()
            },
        )
        .await
        .expect("seed succeeds");

    let options = QueryOptions::organization()
        .with_period(Period::Month)
        .with_window(day - Duration::days(40), day);
    let metrics = engine
        .pulse_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(metrics.checkin_count, 5);
}

#[tokio::test]
async fn test_triggered_recompute_drains_on_stop() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let at = Utc::now() - Duration::hours(1);

    store.record_event(checkin(org, user, at, 4)).await;

    engine.start_periodic_sweep().await;
    assert!(engine.is_running().await);
    // Idempotent start.
    engine.start_periodic_sweep().await;

    engine.trigger_recompute(org, user, at).await;
    // Stop drains the trigger queue before shutting down.
    engine.stop_periodic_sweep().await;
    assert!(!engine.is_running().await);
    // Idempotent stop.
    engine.stop_periodic_sweep().await;

    let day = at.date_naive();
    let rows = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].checkin_count, 1);
}

#[tokio::test]
async fn test_trigger_without_scheduler_is_dropped() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let at = Utc::now() - Duration::hours(1);

    store.record_event(checkin(org, user, at, 4)).await;
    engine.trigger_recompute(org, user, at).await;

    assert_eq!(engine.sweep_metrics().triggers_dropped, 1);
    let day = at.date_naive();
    let rows = store
        .pulse_buckets(org, &MetricScope::User(user), day, day)
        .await
        .expect("read succeeds");
    assert!(rows.is_empty(), "dropped trigger must not recompute");
}

#[tokio::test]
async fn test_backfill_processes_range_and_overrides_watermark() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();

    let from = date(2025, 6, 2);
    let to = date(2025, 6, 4);
    for offset in 0..3 {
        let day = from + Duration::days(offset);
        let at = day.and_hms_opt(10, 0, 0).expect("valid time").and_utc();
        store.record_event(checkin(org, user, at, 4)).await;
    }
    // Outside the requested range; must not be touched.
    store
        .record_event(checkin(
            org,
            user,
            date(2025, 6, 10).and_hms_opt(10, 0, 0).expect("valid time").and_utc(),
            4,
        ))
        .await;

    let processed = engine
        .backfill_historical_data(org, from, to)
        .await
        .expect("backfill succeeds");
    assert_eq!(processed, 3);

    let rows = store
        .pulse_buckets(org, &MetricScope::User(user), from, to)
        .await
        .expect("read succeeds");
    assert_eq!(rows.len(), 3);

    // The watermark is set to the end of the range unconditionally, even
    // though later events exist.
    let watermark = store
        .watermark(org)
        .await
        .expect("read succeeds")
        .expect("watermark exists");
    let (_, range_end) = day_window(to);
    assert_eq!(watermark.last_processed_at, range_end);

    let err = engine
        .backfill_historical_data(org, to, from)
        .await
        .expect_err("inverted range rejected");
    assert!(matches!(
        err,
        cadence_core::EngineError::Query(cadence_core::QueryError::InvalidWindow { .. })
    ));
}

#[tokio::test]
async fn test_review_compliance_uses_reviewer_vacation() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone());
    let org = new_entity_id();
    let user = new_entity_id();
    let reviewer = new_entity_id();

    let monday = date(2025, 6, 2);
    let due = (monday + Duration::days(4)).and_hms_opt(17, 0, 0).expect("valid time").and_utc();
    let review_due = due + Duration::days(3);
    store
        .record_event(Event::new(
            org,
            user,
            EventKind::CheckinSubmitted,
            due - Duration::hours(2),
            serde_json::json!({
                "mood": 4,
                "due_at": due,
                "week_of": monday,
                "reviewer_id": reviewer,
                "review_due_at": review_due,
                "reviewed_at": review_due - Duration::hours(1),
            }),
        ))
        .await;
    // The reviewer was on vacation that week: reviewed on time, so the
    // numerator counts it, but the week is not due for them.
    store.set_vacation(org, reviewer, monday, true).await;

    let options = QueryOptions::user(user).with_window(monday, monday + Duration::days(6));
    let metrics = engine
        .review_compliance_metrics(org, &options)
        .await
        .expect("query succeeds");
    assert_eq!(metrics.total_due_count, 0);
    assert_eq!(metrics.on_time_count, 1);
    assert_eq!(metrics.on_time_percentage, 0.0);
}
