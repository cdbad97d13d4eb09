//! Core domain models and strongly-typed identifiers.
//!
//! Defines jobs, submissions, statistics and the newtype ID wrapper used
//! across the queue. Includes database serialization traits and the state
//! transition vocabulary shared by every store implementation.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Longest topic or correlation key accepted by the store.
pub const MAX_KEY_LENGTH: usize = 255;

/// Strongly-typed job identifier.
///
/// Assigned when a job is persisted and stable for its whole lifecycle.
///
/// # Example
///
/// ```
/// use jobqueue_core::models::JobId;
/// let job_id = JobId::new();
/// println!("Processing job: {}", job_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Job lifecycle status.
///
/// ```text
/// queued -> claimed -> succeeded
///    ^         |----> failed
///    |_________| (retry)
/// ```
///
/// `succeeded` and `failed` are terminal: no store operation moves a job out
/// of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,

    /// Owned by exactly one worker that is running its handler.
    Claimed,

    /// Handler returned success.
    Succeeded,

    /// Retries exhausted, non-retryable failure, or no handler registered.
    Failed,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Queued, Self::Claimed, Self::Succeeded, Self::Failed];

    /// Returns true for `succeeded` and `failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Database representation of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::InvalidInput(format!("invalid job status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

/// A persisted unit of work.
///
/// Rows are created by `add`, mutated only by the worker that owns the claim,
/// and never deleted by the queue itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,

    /// Key selecting the registered processor.
    pub topic: String,

    /// Concurrency class; each rank is served by its own worker pool.
    #[sqlx(try_from = "i32")]
    pub rank: u32,

    /// Opaque arguments passed to the processor, in submission order.
    #[sqlx(json)]
    pub args: Vec<Value>,

    /// Maximum number of retries after the first attempt.
    #[sqlx(try_from = "i32")]
    pub max_retry: u32,

    /// Number of times the job has been claimed.
    ///
    /// Starts at 0 and never exceeds `max_retry + 1`.
    #[sqlx(try_from = "i32")]
    pub attempt: u32,

    /// Caller-defined grouping for statistics.
    pub correlation_group: String,

    /// Optional caller-defined lookup key, unique when present.
    pub correlation_id: Option<String>,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Message of the most recent failure.
    pub last_error: Option<String>,

    /// When the job was persisted. Claim order within a topic and rank.
    pub created_at: DateTime<Utc>,

    /// When the current or last claim happened.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,

    /// Earliest time a re-queued job may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a freshly queued job from a validated submission.
    pub fn from_submission(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            topic: job.topic,
            rank: job.rank,
            args: job.args,
            max_retry: job.max_retry,
            attempt: 0,
            correlation_group: job.correlation_group,
            correlation_id: job.correlation_id,
            status: JobStatus::Queued,
            last_error: None,
            created_at: now,
            claimed_at: None,
            finished_at: None,
            next_attempt_at: None,
            updated_at: now,
        }
    }

    /// Returns true once the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a failed attempt may still be retried.
    ///
    /// Evaluated after the claim increments `attempt`, so a job with
    /// `max_retry = 2` runs at most three times.
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.max_retry
    }

    /// Deserializes the argument at `index`, if present and well-typed.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Option<T> {
        self.args.get(index).and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// A job submission before it is persisted.
///
/// # Example
///
/// ```
/// use jobqueue_core::models::NewJob;
/// use serde_json::json;
///
/// let job = NewJob::new("thumbnails")
///     .rank(1)
///     .max_retry(3)
///     .correlation_group("uploads")
///     .arg(json!(640))
///     .arg(json!(480));
/// assert!(job.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Topic selecting the processor.
    pub topic: String,

    /// Concurrency class.
    #[serde(default)]
    pub rank: u32,

    /// Maximum retries after the first attempt.
    #[serde(default)]
    pub max_retry: u32,

    /// Statistics grouping.
    #[serde(default)]
    pub correlation_group: String,

    /// Optional unique lookup key.
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Processor arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl NewJob {
    /// Creates a rank 0 submission with no retries and no arguments.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            rank: 0,
            max_retry: 0,
            correlation_group: String::new(),
            correlation_id: None,
            args: Vec::new(),
        }
    }

    /// Sets the rank.
    #[must_use]
    pub fn rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Sets the correlation group.
    #[must_use]
    pub fn correlation_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = group.into();
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replaces all arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Checks the submission against the constraints of the jobs table.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(CoreError::InvalidInput("topic must not be empty".to_string()));
        }
        if self.topic.len() > MAX_KEY_LENGTH {
            return Err(CoreError::InvalidInput(format!(
                "topic exceeds {MAX_KEY_LENGTH} bytes"
            )));
        }
        if i32::try_from(self.rank).is_err() {
            return Err(CoreError::InvalidInput(format!("rank {} out of range", self.rank)));
        }
        // attempt is stored as max_retry + 1 at most
        if self.max_retry >= i32::MAX as u32 {
            return Err(CoreError::InvalidInput(format!(
                "max_retry {} out of range",
                self.max_retry
            )));
        }
        if self.correlation_group.len() > MAX_KEY_LENGTH {
            return Err(CoreError::InvalidInput(format!(
                "correlation_group exceeds {MAX_KEY_LENGTH} bytes"
            )));
        }
        if let Some(correlation_id) = &self.correlation_id {
            if correlation_id.is_empty() || correlation_id.len() > MAX_KEY_LENGTH {
                return Err(CoreError::InvalidInput(
                    "correlation_id must be between 1 and 255 bytes".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Which queued jobs a worker may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Rank served by the claiming pool.
    pub rank: u32,

    /// Restricts claiming to these topics; `None` claims any topic.
    pub topics: Option<Vec<String>>,
}

impl ClaimFilter {
    /// Claims any topic of the rank.
    pub fn any_topic(rank: u32) -> Self {
        Self { rank, topics: None }
    }

    /// Claims only the listed topics of the rank.
    pub fn topics(rank: u32, topics: Vec<String>) -> Self {
        Self { rank, topics: Some(topics) }
    }

    /// Returns true when `job` is eligible under this filter.
    pub fn matches(&self, job: &Job) -> bool {
        job.rank == self.rank
            && self.topics.as_ref().is_none_or(|topics| topics.iter().any(|t| *t == job.topic))
    }
}

/// Result of a claimed job's execution, applied by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded.
    Succeeded,

    /// Handler failed with budget left; the job goes back to `queued`.
    Retry {
        /// Failure message recorded on the row.
        error: String,
        /// Earliest time of the next claim, `None` for immediately.
        not_before: Option<DateTime<Utc>>,
    },

    /// Handler failed terminally.
    Failed {
        /// Failure message recorded on the row.
        error: String,
    },

    /// No handler was registered for the topic.
    ///
    /// Fails the job and gives back the attempt consumed by the claim.
    HandlerMissing {
        /// Failure message recorded on the row.
        error: String,
    },
}

impl Outcome {
    /// Status the job ends up in.
    pub const fn resulting_status(&self) -> JobStatus {
        match self {
            Self::Succeeded => JobStatus::Succeeded,
            Self::Retry { .. } => JobStatus::Queued,
            Self::Failed { .. } | Self::HandlerMissing { .. } => JobStatus::Failed,
        }
    }

    /// Recorded failure message, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Retry { error, .. } | Self::Failed { error } | Self::HandlerMissing { error } => {
                Some(error)
            },
        }
    }
}

/// Filter for aggregate statistics. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsFilter {
    /// Restrict to one topic.
    #[serde(default)]
    pub topic: Option<String>,

    /// Restrict to one correlation group.
    #[serde(default)]
    pub correlation_group: Option<String>,
}

impl StatsFilter {
    /// Matches every job.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches one topic.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self { topic: Some(topic.into()), correlation_group: None }
    }

    /// Matches one correlation group.
    pub fn correlation_group(group: impl Into<String>) -> Self {
        Self { topic: None, correlation_group: Some(group.into()) }
    }

    /// Adds a correlation group restriction.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = Some(group.into());
        self
    }

    /// Returns true when `job` is counted under this filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.topic.as_ref().is_none_or(|topic| *topic == job.topic)
            && self.correlation_group.as_ref().is_none_or(|group| *group == job.correlation_group)
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Jobs waiting for a worker.
    pub queued: u64,
    /// Jobs currently claimed.
    pub working: u64,
    /// Jobs that succeeded.
    pub succeeded: u64,
    /// Jobs that failed terminally.
    pub failed: u64,
}

impl JobStats {
    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.queued + self.working + self.succeeded + self.failed
    }

    /// Counts one job in its status bucket.
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Claimed => self.working += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Filter and paging for job listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Restrict to one topic.
    #[serde(default)]
    pub topic: Option<String>,
    /// Restrict to one status.
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Restrict to one correlation group.
    #[serde(default)]
    pub correlation_group: Option<String>,
    /// Maximum rows returned.
    #[serde(default = "default_list_limit")]
    pub limit: u32,
    /// Rows skipped, newest first.
    #[serde(default)]
    pub offset: u32,
}

impl ListFilter {
    /// Returns true when `job` passes the non-paging filters.
    pub fn matches(&self, job: &Job) -> bool {
        self.topic.as_ref().is_none_or(|topic| *topic == job.topic)
            && self.status.is_none_or(|status| status == job.status)
            && self.correlation_group.as_ref().is_none_or(|group| *group == job.correlation_group)
    }
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            topic: None,
            status: None,
            correlation_group: None,
            limit: default_list_limit(),
            offset: 0,
        }
    }
}

fn default_list_limit() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_round_trips_through_string() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Claimed.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn blank_topic_rejected() {
        assert!(NewJob::new("").validate().is_err());
        assert!(NewJob::new("   ").validate().is_err());
        assert!(NewJob::new("a".repeat(MAX_KEY_LENGTH + 1)).validate().is_err());
        assert!(NewJob::new("a".repeat(MAX_KEY_LENGTH)).validate().is_ok());
    }

    #[test]
    fn out_of_range_rank_and_retry_rejected() {
        assert!(NewJob::new("t").rank(u32::MAX).validate().is_err());
        assert!(NewJob::new("t").max_retry(u32::MAX).validate().is_err());
        assert!(NewJob::new("t").rank(7).max_retry(10).validate().is_ok());
    }

    #[test]
    fn retry_budget_counts_first_attempt() {
        let mut job = Job::from_submission(JobId::new(), NewJob::new("t").max_retry(2), Utc::now());
        job.attempt = 2;
        assert!(job.can_retry());
        job.attempt = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn typed_argument_access() {
        let job = Job::from_submission(
            JobId::new(),
            NewJob::new("t").arg(json!(640)).arg(json!("hd")),
            Utc::now(),
        );
        assert_eq!(job.arg::<u32>(0), Some(640));
        assert_eq!(job.arg::<String>(1).as_deref(), Some("hd"));
        assert_eq!(job.arg::<u32>(1), None);
        assert_eq!(job.arg::<u32>(2), None);
    }

    #[test]
    fn claim_filter_respects_rank_and_topics() {
        let job = Job::from_submission(JobId::new(), NewJob::new("plan").rank(2), Utc::now());
        assert!(ClaimFilter::any_topic(2).matches(&job));
        assert!(!ClaimFilter::any_topic(1).matches(&job));
        assert!(ClaimFilter::topics(2, vec!["plan".into()]).matches(&job));
        assert!(!ClaimFilter::topics(2, vec!["room".into()]).matches(&job));
    }

    #[test]
    fn stats_filter_matching() {
        let job = Job::from_submission(
            JobId::new(),
            NewJob::new("plan").correlation_group("2"),
            Utc::now(),
        );
        assert!(StatsFilter::all().matches(&job));
        assert!(StatsFilter::topic("plan").in_group("2").matches(&job));
        assert!(!StatsFilter::topic("plan").in_group("1").matches(&job));
        assert!(!StatsFilter::topic("room").matches(&job));
    }

    #[test]
    fn handler_missing_outcome_fails_job() {
        let outcome = Outcome::HandlerMissing { error: "no handler".into() };
        assert_eq!(outcome.resulting_status(), JobStatus::Failed);
        assert_eq!(outcome.error(), Some("no handler"));
        assert_eq!(Outcome::Succeeded.error(), None);
    }
}
