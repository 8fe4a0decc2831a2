//! Cadence Core - Entity Types
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! This crate contains ONLY data types, calendar helpers, and the error
//! taxonomy - no aggregation logic.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Organization (tenant) identifier.
pub type OrganizationId = Uuid;

/// User identifier, scoped to an organization.
pub type UserId = Uuid;

/// Team identifier, scoped to an organization.
pub type TeamId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

// ============================================================================
// ENUMS
// ============================================================================

/// Kind discriminator for domain events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A weekly check-in was submitted.
    CheckinSubmitted,
    /// A shoutout was given (event owner is the giver).
    ShoutoutGiven,
    /// A shoutout was received (event owner is the recipient).
    ShoutoutReceived,
    /// A vacation week was declared.
    VacationDeclared,
}

/// Visibility of a recognition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Grouping granularity for analytics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Period {
    /// Coarse periods always read from rollups; day-level queries may not.
    pub fn is_coarse(&self) -> bool {
        !matches!(self, Period::Day)
    }
}

impl std::str::FromStr for Period {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "quarter" => Ok(Period::Quarter),
            "year" => Ok(Period::Year),
            other => Err(QueryError::UnknownPeriod {
                period: other.to_string(),
            }),
        }
    }
}

/// Entity filter for analytics queries and bucket range reads.
///
/// A team or user scope cannot be constructed without its entity id, so a
/// "scoped query with a missing entity" is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScope {
    Organization,
    Team(TeamId),
    User(UserId),
}

impl MetricScope {
    /// Whether a record owned by `user_id` / `team_id` falls inside this scope.
    pub fn matches(&self, user_id: UserId, team_id: Option<TeamId>) -> bool {
        match self {
            MetricScope::Organization => true,
            MetricScope::Team(t) => team_id == Some(*t),
            MetricScope::User(u) => user_id == *u,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// An append-only domain event.
///
/// Events are collaborator-owned and immutable once written; `occurred_at`
/// drives bucketing. The payload is an opaque JSON document parsed into a
/// typed view per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
    pub occurred_at: Timestamp,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        organization_id: OrganizationId,
        user_id: UserId,
        kind: EventKind,
        occurred_at: Timestamp,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            organization_id,
            user_id,
            team_id: None,
            occurred_at,
            kind,
            payload,
        }
    }

    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// Calendar day this event buckets under (UTC day boundary).
    pub fn bucket_date(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }

    /// Parse the payload as a check-in submission.
    pub fn checkin_payload(&self) -> Result<CheckinPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Parse the payload as a shoutout.
    pub fn shoutout_payload(&self) -> Result<ShoutoutPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Typed view of a `CheckinSubmitted` payload.
///
/// All fields are optional on the wire; missing fields take the defaults
/// below so that older events remain parseable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckinPayload {
    /// Mood value reported with the check-in, if any.
    pub mood: Option<i64>,
    /// Whether the check-in was completed (as opposed to a draft).
    pub completed: bool,
    /// The ISO week this check-in covers. Falls back to the week of
    /// `occurred_at` when absent.
    pub week_of: Option<NaiveDate>,
    /// When the check-in was due.
    pub due_at: Option<Timestamp>,
    /// Assigned reviewer, if any.
    pub reviewer_id: Option<UserId>,
    /// When the review was due.
    pub review_due_at: Option<Timestamp>,
    /// When the review actually happened.
    pub reviewed_at: Option<Timestamp>,
}

impl Default for CheckinPayload {
    fn default() -> Self {
        Self {
            mood: None,
            completed: true,
            week_of: None,
            due_at: None,
            reviewer_id: None,
            review_due_at: None,
            reviewed_at: None,
        }
    }
}

/// Typed view of a `ShoutoutGiven` / `ShoutoutReceived` payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoutoutPayload {
    pub visibility: Visibility,
}

// ============================================================================
// BUCKETS
// ============================================================================

/// Pulse (mood) rollup for one entity-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseBucket {
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
    pub bucket_date: NaiveDate,
    pub checkin_count: i64,
    pub mood_sum: i64,
    pub updated_at: Timestamp,
}

impl PulseBucket {
    /// An empty bucket must not be stored; absence means "no activity".
    pub fn is_empty(&self) -> bool {
        self.checkin_count == 0
    }
}

/// Recognition rollup for one entity-day, split by direction and visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionBucket {
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
    pub bucket_date: NaiveDate,
    pub received_public: i64,
    pub received_private: i64,
    pub given_public: i64,
    pub given_private: i64,
    pub updated_at: Timestamp,
}

impl RecognitionBucket {
    pub fn is_empty(&self) -> bool {
        self.received_public == 0
            && self.received_private == 0
            && self.given_public == 0
            && self.given_private == 0
    }
}

/// Additive compliance counters shared by bucket rows and query-time folds.
///
/// Due counts exclude vacation weeks; on-time counts include every on-time
/// event regardless of vacation. Lead-time sums are in fractional days.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComplianceCounts {
    pub checkin_due: i64,
    pub checkin_on_time: i64,
    pub review_due: i64,
    pub review_on_time: i64,
    pub checkin_early_days: f64,
    pub checkin_early_samples: i64,
    pub checkin_late_days: f64,
    pub checkin_late_samples: i64,
    pub review_early_days: f64,
    pub review_early_samples: i64,
    pub review_late_days: f64,
    pub review_late_samples: i64,
}

impl ComplianceCounts {
    /// Accumulate another set of counters into this one.
    pub fn merge(&mut self, other: &ComplianceCounts) {
        self.checkin_due += other.checkin_due;
        self.checkin_on_time += other.checkin_on_time;
        self.review_due += other.review_due;
        self.review_on_time += other.review_on_time;
        self.checkin_early_days += other.checkin_early_days;
        self.checkin_early_samples += other.checkin_early_samples;
        self.checkin_late_days += other.checkin_late_days;
        self.checkin_late_samples += other.checkin_late_samples;
        self.review_early_days += other.review_early_days;
        self.review_early_samples += other.review_early_samples;
        self.review_late_days += other.review_late_days;
        self.review_late_samples += other.review_late_samples;
    }

    pub fn is_empty(&self) -> bool {
        self.checkin_due == 0
            && self.checkin_on_time == 0
            && self.review_due == 0
            && self.review_on_time == 0
            && self.checkin_early_samples == 0
            && self.checkin_late_samples == 0
            && self.review_early_samples == 0
            && self.review_late_samples == 0
    }
}

/// Compliance rollup for one entity-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceBucket {
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
    pub bucket_date: NaiveDate,
    #[serde(flatten)]
    pub counts: ComplianceCounts,
    pub updated_at: Timestamp,
}

impl ComplianceBucket {
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// The full recomputation result for one entity-day.
///
/// `None` for a family means "no qualifying activity" and the store must
/// drop any existing row for that family (the absence invariant). The whole
/// set is handed to the store in one call so implementations can make the
/// three family writes atomic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BucketSet {
    pub pulse: Option<PulseBucket>,
    pub recognition: Option<RecognitionBucket>,
    pub compliance: Option<ComplianceBucket>,
}

impl BucketSet {
    pub fn is_empty(&self) -> bool {
        self.pulse.is_none() && self.recognition.is_none() && self.compliance.is_none()
    }
}

// ============================================================================
// WATERMARK
// ============================================================================

/// The timestamp up to which an organization's events have been folded into
/// buckets.
///
/// `last_processed_at` is monotonically non-decreasing under the periodic
/// sweep and always reflects the maximum event timestamp actually processed,
/// never wall-clock "now" - late-written events with a timestamp after the
/// watermark are picked up by the next pass instead of being skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub organization_id: OrganizationId,
    pub last_processed_at: Timestamp,
}

impl Watermark {
    pub fn new(organization_id: OrganizationId, last_processed_at: Timestamp) -> Self {
        Self {
            organization_id,
            last_processed_at,
        }
    }

    /// Lazily-created watermark for an organization seen for the first time.
    pub fn seeded(organization_id: OrganizationId, now: Timestamp, lookback: Duration) -> Self {
        Self {
            organization_id,
            last_processed_at: now.checked_sub_signed(lookback).unwrap_or(now),
        }
    }

    /// A copy advanced to `at`, keeping monotonicity.
    pub fn advanced_to(&self, at: Timestamp) -> Self {
        Self {
            organization_id: self.organization_id,
            last_processed_at: self.last_processed_at.max(at),
        }
    }
}

// ============================================================================
// CALENDAR
// ============================================================================

/// Inclusive UTC window `[00:00:00.000, 23:59:59.999]` for a calendar day.
pub fn day_window(day: NaiveDate) -> (Timestamp, Timestamp) {
    let start = day.and_time(NaiveTime::MIN).and_utc();
    let end = start + Duration::days(1) - Duration::milliseconds(1);
    (start, end)
}

/// Monday of the ISO week containing `day`.
pub fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
}

/// First day of the period containing `day`.
pub fn period_start(day: NaiveDate, period: Period) -> NaiveDate {
    match period {
        Period::Day => day,
        Period::Week => week_start(day),
        Period::Month => day.with_day(1).unwrap_or(day),
        Period::Quarter => {
            let quarter_month = (day.month0() / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(day.year(), quarter_month, 1).unwrap_or(day)
        }
        Period::Year => NaiveDate::from_ymd_opt(day.year(), 1, 1).unwrap_or(day),
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Query failed on {table}: {reason}")]
    QueryFailed { table: String, reason: String },

    #[error("Bucket write failed for organization {organization_id} user {user_id} day {bucket_date}: {reason}")]
    WriteFailed {
        organization_id: OrganizationId,
        user_id: UserId,
        bucket_date: NaiveDate,
        reason: String,
    },

    #[error("Watermark update failed for organization {organization_id}: {reason}")]
    WatermarkFailed {
        organization_id: OrganizationId,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Malformed analytics query options.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unknown period: {period}")]
    UnknownPeriod { period: String },

    #[error("Invalid window: from {from} is after to {to}")]
    InvalidWindow { from: NaiveDate, to: NaiveDate },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// TESTS
// =============================================================================
