//! Integration tests for the PostgreSQL job repository.
//!
//! Each test runs against the database named by `DATABASE_URL` and is a
//! no-op when the variable is unset. Every test uses its own topic so runs
//! can share a database.

use std::collections::HashSet;

use chrono::Utc;
use jobqueue_core::{
    models::{ClaimFilter, JobStatus, ListFilter, NewJob, Outcome, StatsFilter},
    storage::Storage,
    CoreError,
};
use uuid::Uuid;

async fn storage() -> Option<Storage> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    let storage = Storage::new(pool);
    storage.migrate().await.unwrap();
    Some(storage)
}

fn unique_topic(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn health_check_and_idempotent_migration() {
    let Some(storage) = storage().await else { return };

    storage.health_check().await.unwrap();
    storage.migrate().await.unwrap();
}

#[tokio::test]
async fn persisted_job_is_queued() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("persist");

    let id = storage
        .jobs
        .create(&NewJob::new(&topic).rank(1).max_retry(2).arg(serde_json::json!("a")))
        .await
        .unwrap();

    let job = storage.jobs.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.args, vec![serde_json::json!("a")]);

    let stats = storage.jobs.stats(&StatsFilter::topic(&topic)).await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
async fn claim_is_fifo_and_exclusive() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("fifo");

    let first = storage.jobs.create(&NewJob::new(&topic)).await.unwrap();
    let second = storage.jobs.create(&NewJob::new(&topic)).await.unwrap();
    let filter = ClaimFilter::topics(0, vec![topic.clone()]);

    let claimed = storage.jobs.claim_next(&filter).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, JobStatus::Claimed);
    assert_eq!(claimed.attempt, 1);
    assert!(claimed.claimed_at.is_some());

    let claimed = storage.jobs.claim_next(&filter).await.unwrap().unwrap();
    assert_eq!(claimed.id, second);
    assert!(storage.jobs.claim_next(&filter).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claims_never_double_assign() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("race");

    for _ in 0..20 {
        storage.jobs.create(&NewJob::new(&topic)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let jobs = storage.jobs.clone();
        let filter = ClaimFilter::topics(0, vec![topic.clone()]);
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = jobs.claim_next(&filter).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn terminal_rows_ignore_further_completions() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("terminal");
    let id = storage.jobs.create(&NewJob::new(&topic)).await.unwrap();
    storage.jobs.claim_next(&ClaimFilter::topics(0, vec![topic])).await.unwrap().unwrap();

    assert!(storage.jobs.complete(id, &Outcome::Succeeded).await.unwrap());
    let failed = Outcome::Failed { error: "late".into() };
    assert!(!storage.jobs.complete(id, &failed).await.unwrap());

    let job = storage.jobs.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.finished_at.is_some());
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn handler_missing_restores_attempt() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("missing");
    let id = storage.jobs.create(&NewJob::new(&topic)).await.unwrap();
    storage.jobs.claim_next(&ClaimFilter::topics(0, vec![topic])).await.unwrap().unwrap();

    let outcome = Outcome::HandlerMissing { error: "no handler".into() };
    assert!(storage.jobs.complete(id, &outcome).await.unwrap());

    let job = storage.jobs.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.last_error.as_deref(), Some("no handler"));
}

#[tokio::test]
async fn retry_with_delay_is_not_claimable_yet() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("delay");
    let id = storage.jobs.create(&NewJob::new(&topic).max_retry(1)).await.unwrap();
    let filter = ClaimFilter::topics(0, vec![topic]);
    storage.jobs.claim_next(&filter).await.unwrap().unwrap();

    let not_before = Some(Utc::now() + chrono::Duration::hours(1));
    let outcome = Outcome::Retry { error: "busy".into(), not_before };
    assert!(storage.jobs.complete(id, &outcome).await.unwrap());

    assert!(storage.jobs.claim_next(&filter).await.unwrap().is_none());
    let job = storage.jobs.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn duplicate_correlation_id_rejected() {
    let Some(storage) = storage().await else { return };
    let key = Uuid::new_v4().to_string();
    let job = NewJob::new(unique_topic("corr")).correlation_id(&key);

    let id = storage.jobs.create(&job).await.unwrap();
    let err = storage.jobs.create(&job).await.unwrap_err();
    assert!(matches!(err, CoreError::ConstraintViolation(_)));

    let found = storage.jobs.find_by_correlation_id(&key).await.unwrap().unwrap();
    assert_eq!(found.id, id);
}

#[tokio::test]
async fn list_returns_newest_first() {
    let Some(storage) = storage().await else { return };
    let topic = unique_topic("list");
    let older = storage.jobs.create(&NewJob::new(&topic)).await.unwrap();
    let newer = storage.jobs.create(&NewJob::new(&topic)).await.unwrap();

    let filter = ListFilter { topic: Some(topic), ..ListFilter::default() };
    let ids: Vec<_> = storage.jobs.list(&filter).await.unwrap().into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![newer, older]);
}
