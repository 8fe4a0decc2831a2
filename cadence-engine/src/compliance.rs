//! Vacation-aware compliance math.
//!
//! Submission and review compliance are tracked independently, each with
//! asymmetric vacation handling: a vacation week is removed from the "due"
//! denominator, but an on-time event during a vacation week still counts in
//! the numerator. Pure functions only; vacation state is resolved by the
//! caller.

use cadence_core::{week_start, CheckinPayload, ComplianceCounts, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// One check-in with its vacation state resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceInput {
    pub occurred_at: Timestamp,
    pub payload: CheckinPayload,
    pub submitter_on_vacation: bool,
    pub reviewer_on_vacation: bool,
}

/// The normalized week a check-in counts toward.
///
/// Vacation is declared per ISO week, not per day, so this is independent
/// of the day the check-in happens to be bucketed under.
pub fn resolve_week(payload: &CheckinPayload, occurred_at: Timestamp) -> NaiveDate {
    match payload.week_of {
        Some(week) => week_start(week),
        None => week_start(occurred_at.date_naive()),
    }
}

/// Fold resolved check-ins into additive compliance counters.
pub fn fold_compliance(inputs: &[ComplianceInput]) -> ComplianceCounts {
    let mut counts = ComplianceCounts::default();
    for input in inputs {
        let payload = &input.payload;

        // Submission compliance.
        if !input.submitter_on_vacation {
            counts.checkin_due += 1;
        }
        if let Some(due_at) = payload.due_at {
            if input.occurred_at <= due_at {
                counts.checkin_on_time += 1;
            }
            let lead = lead_days(due_at, input.occurred_at);
            if lead >= 0.0 {
                counts.checkin_early_days += lead;
                counts.checkin_early_samples += 1;
            } else {
                counts.checkin_late_days += -lead;
                counts.checkin_late_samples += 1;
            }
        }

        // Review compliance, only when a reviewer is assigned.
        if payload.reviewer_id.is_some() {
            if !input.reviewer_on_vacation {
                counts.review_due += 1;
            }
            if let (Some(reviewed_at), Some(review_due_at)) =
                (payload.reviewed_at, payload.review_due_at)
            {
                if reviewed_at <= review_due_at {
                    counts.review_on_time += 1;
                }
                let lead = lead_days(review_due_at, reviewed_at);
                if lead >= 0.0 {
                    counts.review_early_days += lead;
                    counts.review_early_samples += 1;
                } else {
                    counts.review_late_days += -lead;
                    counts.review_late_samples += 1;
                }
            }
        }
    }
    counts
}

/// On-time rate as a percentage, defined as 0 for an empty denominator.
pub fn on_time_percentage(on_time_count: i64, total_due_count: i64) -> f64 {
    if total_due_count <= 0 {
        return 0.0;
    }
    (on_time_count as f64 / total_due_count as f64) * 100.0
}

/// Compliance rate with descriptive lead-time statistics.
///
/// The averages are `None` when no qualifying samples exist; callers must
/// treat that as "insufficient data", not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceMetrics {
    pub total_due_count: i64,
    pub on_time_count: i64,
    pub on_time_percentage: f64,
    pub average_days_early: Option<f64>,
    pub average_days_late: Option<f64>,
}

/// Submission-side metrics from folded counters.
pub fn checkin_metrics(counts: &ComplianceCounts) -> ComplianceMetrics {
    ComplianceMetrics {
        total_due_count: counts.checkin_due,
        on_time_count: counts.checkin_on_time,
        on_time_percentage: on_time_percentage(counts.checkin_on_time, counts.checkin_due),
        average_days_early: average(counts.checkin_early_days, counts.checkin_early_samples),
        average_days_late: average(counts.checkin_late_days, counts.checkin_late_samples),
    }
}

/// Review-side metrics from folded counters.
pub fn review_metrics(counts: &ComplianceCounts) -> ComplianceMetrics {
    ComplianceMetrics {
        total_due_count: counts.review_due,
        on_time_count: counts.review_on_time,
        on_time_percentage: on_time_percentage(counts.review_on_time, counts.review_due),
        average_days_early: average(counts.review_early_days, counts.review_early_samples),
        average_days_late: average(counts.review_late_days, counts.review_late_samples),
    }
}

fn average(sum: f64, samples: i64) -> Option<f64> {
    if samples > 0 {
        Some(sum / samples as f64)
    } else {
        None
    }
}

/// Signed days between due and actual; positive means early.
fn lead_days(due: Timestamp, actual: Timestamp) -> f64 {
    (due - actual).num_milliseconds() as f64 / MILLIS_PER_DAY
}
