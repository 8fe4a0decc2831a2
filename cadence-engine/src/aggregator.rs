//! Bucket Aggregator
//!
//! Recomputes one entity-day's rollups from the raw event log. The unit of
//! work for the sweep scheduler, the trigger worker, and backfills.
//!
//! Recomputation is idempotent: buckets are always derived fresh from the
//! events in the day window, never read-modify-written, so redundant or
//! concurrent calls for the same entity-day converge on the same rows
//! (last writer wins). The whole result is handed to the store as one
//! [`BucketSet`] so the three family writes share a transaction.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::{
    day_window, BucketSet, ComplianceBucket, EngineResult, Event, EventKind, MetricScope,
    OrganizationId, PulseBucket, RecognitionBucket, UserId, Visibility,
};
use cadence_storage::{BucketStore, EventSource};
use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::compliance::{fold_compliance, resolve_week, ComplianceInput};

/// Pulse counters for a set of check-in events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PulseTotals {
    pub checkin_count: i64,
    pub mood_sum: i64,
}

/// Recognition counters for a set of shoutout events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RecognitionTotals {
    pub received_public: i64,
    pub received_private: i64,
    pub given_public: i64,
    pub given_private: i64,
}

impl RecognitionTotals {
    pub fn is_empty(&self) -> bool {
        self.received_public == 0
            && self.received_private == 0
            && self.given_public == 0
            && self.given_private == 0
    }
}

/// Sum mood values and count completed check-ins.
pub(crate) fn fold_pulse<'a, I>(events: I) -> PulseTotals
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut totals = PulseTotals::default();
    for event in events
        .into_iter()
        .filter(|e| e.kind == EventKind::CheckinSubmitted)
    {
        match event.checkin_payload() {
            Ok(payload) if payload.completed => {
                totals.checkin_count += 1;
                totals.mood_sum += payload.mood.unwrap_or(0);
            }
            Ok(_) => {}
            Err(error) => warn!(
                %error,
                occurred_at = %event.occurred_at,
                "Skipping check-in with malformed payload"
            ),
        }
    }
    totals
}

/// Count shoutouts by direction and visibility.
pub(crate) fn fold_recognition<'a, I>(events: I) -> RecognitionTotals
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut totals = RecognitionTotals::default();
    for event in events.into_iter() {
        let direction = match event.kind {
            EventKind::ShoutoutGiven | EventKind::ShoutoutReceived => event.kind,
            _ => continue,
        };
        let visibility = match event.shoutout_payload() {
            Ok(payload) => payload.visibility,
            Err(error) => {
                warn!(
                    %error,
                    occurred_at = %event.occurred_at,
                    "Skipping shoutout with malformed payload"
                );
                continue;
            }
        };
        match (direction, visibility) {
            (EventKind::ShoutoutReceived, Visibility::Public) => totals.received_public += 1,
            (EventKind::ShoutoutReceived, Visibility::Private) => totals.received_private += 1,
            (EventKind::ShoutoutGiven, Visibility::Public) => totals.given_public += 1,
            (EventKind::ShoutoutGiven, Visibility::Private) => totals.given_private += 1,
            _ => {}
        }
    }
    totals
}

/// Resolve vacation state for each check-in's week.
///
/// Vacation is declared per ISO week, so each check-in resolves its own
/// `week_of` independently of the day it buckets under. Lookups are
/// memoized per (user, week) within the call.
pub(crate) async fn resolve_compliance_inputs<S>(
    store: &S,
    organization_id: OrganizationId,
    events: &[Event],
) -> EngineResult<Vec<ComplianceInput>>
where
    S: EventSource + ?Sized,
{
    let mut vacation_memo: HashMap<(UserId, NaiveDate), bool> = HashMap::new();
    let mut inputs = Vec::new();
    for event in events
        .iter()
        .filter(|e| e.kind == EventKind::CheckinSubmitted)
    {
        let payload = match event.checkin_payload() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(
                    %error,
                    occurred_at = %event.occurred_at,
                    "Skipping check-in with malformed payload"
                );
                continue;
            }
        };
        let week = resolve_week(&payload, event.occurred_at);
        let submitter_on_vacation =
            vacation_state(store, &mut vacation_memo, organization_id, event.user_id, week)
                .await?;
        let reviewer_on_vacation = match payload.reviewer_id {
            Some(reviewer_id) => {
                vacation_state(store, &mut vacation_memo, organization_id, reviewer_id, week)
                    .await?
            }
            None => false,
        };
        inputs.push(ComplianceInput {
            occurred_at: event.occurred_at,
            payload,
            submitter_on_vacation,
            reviewer_on_vacation,
        });
    }
    Ok(inputs)
}

async fn vacation_state<S>(
    store: &S,
    memo: &mut HashMap<(UserId, NaiveDate), bool>,
    organization_id: OrganizationId,
    user_id: UserId,
    week: NaiveDate,
) -> EngineResult<bool>
where
    S: EventSource + ?Sized,
{
    if let Some(cached) = memo.get(&(user_id, week)) {
        return Ok(*cached);
    }
    let on_vacation = store.is_on_vacation(organization_id, user_id, week).await?;
    memo.insert((user_id, week), on_vacation);
    Ok(on_vacation)
}

/// Recomputes rollups for single entity-days.
#[derive(Debug)]
pub struct BucketAggregator<S> {
    store: Arc<S>,
}

impl<S> BucketAggregator<S>
where
    S: EventSource + BucketStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Recompute all three bucket families for `(organization, user, day)`.
    ///
    /// Any store failure aborts the entity-day and propagates; there is no
    /// partial-bucket state to clean up because nothing is written until
    /// every family has been folded.
    pub async fn recompute(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        day: NaiveDate,
    ) -> EngineResult<()> {
        let (from, to) = day_window(day);
        let events = self
            .store
            .events_for(organization_id, &MetricScope::User(user_id), from, to, &[])
            .await?;
        let team_id = events.iter().find_map(|e| e.team_id);
        let now = Utc::now();

        let pulse_totals = fold_pulse(&events);
        let pulse = (pulse_totals.checkin_count > 0).then(|| PulseBucket {
            organization_id,
            user_id,
            team_id,
            bucket_date: day,
            checkin_count: pulse_totals.checkin_count,
            mood_sum: pulse_totals.mood_sum,
            updated_at: now,
        });

        let recognition_totals = fold_recognition(&events);
        let recognition = (!recognition_totals.is_empty()).then(|| RecognitionBucket {
            organization_id,
            user_id,
            team_id,
            bucket_date: day,
            received_public: recognition_totals.received_public,
            received_private: recognition_totals.received_private,
            given_public: recognition_totals.given_public,
            given_private: recognition_totals.given_private,
            updated_at: now,
        });

        let inputs =
            resolve_compliance_inputs(self.store.as_ref(), organization_id, &events).await?;
        let counts = fold_compliance(&inputs);
        let compliance = (!counts.is_empty()).then(|| ComplianceBucket {
            organization_id,
            user_id,
            team_id,
            bucket_date: day,
            counts,
            updated_at: now,
        });

        let buckets = BucketSet {
            pulse,
            recognition,
            compliance,
        };
        debug!(
            organization_id = %organization_id,
            user_id = %user_id,
            day = %day,
            empty = buckets.is_empty(),
            "Recomputed entity-day buckets"
        );
        self.store
            .replace_entity_day(organization_id, user_id, day, buckets)
            .await?;
        Ok(())
    }
}
