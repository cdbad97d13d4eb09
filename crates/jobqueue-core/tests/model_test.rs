//! Integration tests for core domain models.
//!
//! Covers submission defaults, serialization shapes consumed by an outer
//! HTTP layer, and lifecycle helpers.

use chrono::{TimeZone, Utc};
use jobqueue_core::{
    models::{Job, JobId, JobStats, JobStatus, ListFilter, NewJob, Outcome, StatsFilter},
    Clock, TestClock,
};
use serde_json::json;

#[test]
fn submission_deserializes_with_defaults() {
    let job: NewJob = serde_json::from_value(json!({ "topic": "Room Type" })).unwrap();

    assert_eq!(job, NewJob::new("Room Type"));
    assert_eq!(job.rank, 0);
    assert_eq!(job.max_retry, 0);
    assert!(job.args.is_empty());
    assert!(job.correlation_id.is_none());
}

#[test]
fn submission_keeps_argument_order() {
    let job: NewJob = serde_json::from_value(json!({
        "topic": "Plan",
        "rank": 2,
        "max_retry": 3,
        "correlation_group": "hotel-7",
        "correlation_id": "plan-42",
        "args": [1, "two", {"three": 3}]
    }))
    .unwrap();

    assert_eq!(job.args, vec![json!(1), json!("two"), json!({"three": 3})]);
    assert_eq!(job.correlation_id.as_deref(), Some("plan-42"));
    assert!(job.validate().is_ok());
}

#[test]
fn empty_correlation_id_rejected() {
    let job = NewJob::new("Plan").correlation_id("");
    assert!(job.validate().is_err());
}

#[test]
fn oversized_correlation_group_rejected() {
    let job = NewJob::new("Plan").correlation_group("g".repeat(256));
    assert!(job.validate().is_err());
}

#[test]
fn fresh_job_is_queued_with_no_attempts() {
    let clock = TestClock::with_start_time(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().into(),
    );
    let job = Job::from_submission(JobId::new(), NewJob::new("Plan").max_retry(1), clock.now_utc());

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.created_at, job.updated_at);
    assert_eq!(job.created_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    assert!(job.claimed_at.is_none());
    assert!(!job.is_terminal());
}

#[test]
fn status_serializes_in_snake_case() {
    assert_eq!(serde_json::to_value(JobStatus::Succeeded).unwrap(), json!("succeeded"));
    let status: JobStatus = serde_json::from_value(json!("claimed")).unwrap();
    assert_eq!(status, JobStatus::Claimed);
}

#[test]
fn stats_serialize_with_working_count() {
    let mut stats = JobStats::default();
    stats.record(JobStatus::Queued);
    stats.record(JobStatus::Claimed);
    stats.record(JobStatus::Failed);

    assert_eq!(
        serde_json::to_value(stats).unwrap(),
        json!({ "queued": 1, "working": 1, "succeeded": 0, "failed": 1 })
    );
    assert_eq!(stats.total(), 3);
}

#[test]
fn stats_filter_deserializes_partially() {
    let filter: StatsFilter = serde_json::from_value(json!({ "topic": "Plan" })).unwrap();
    assert_eq!(filter, StatsFilter::topic("Plan"));
}

#[test]
fn list_filter_defaults_to_first_page() {
    let filter: ListFilter = serde_json::from_value(json!({ "status": "failed" })).unwrap();

    assert_eq!(filter.status, Some(JobStatus::Failed));
    assert_eq!(filter.limit, ListFilter::default().limit);
    assert_eq!(filter.offset, 0);
}

#[test]
fn list_filter_matches_on_every_field() {
    let job = Job::from_submission(
        JobId::new(),
        NewJob::new("Plan").correlation_group("2"),
        Utc::now(),
    );
    let filter = ListFilter {
        topic: Some("Plan".into()),
        status: Some(JobStatus::Queued),
        correlation_group: Some("2".into()),
        ..ListFilter::default()
    };
    assert!(filter.matches(&job));

    let filter = ListFilter { status: Some(JobStatus::Failed), ..filter };
    assert!(!filter.matches(&job));
}

#[test]
fn retry_outcome_requeues() {
    let outcome = Outcome::Retry { error: "timeout".into(), not_before: None };
    assert_eq!(outcome.resulting_status(), JobStatus::Queued);
    assert_eq!(outcome.error(), Some("timeout"));
}
