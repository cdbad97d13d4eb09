//! Repository for job database operations.
//!
//! Provides type-safe access to the `jobs` table with lock-free claiming for
//! concurrent workers, conditional completion updates and aggregate counts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{ClaimFilter, Job, JobId, JobStats, ListFilter, NewJob, Outcome, StatsFilter},
};

const JOB_COLUMNS: &str = "id, topic, rank, args, max_retry, attempt, correlation_group, \
                           correlation_id, status, last_error, created_at, claimed_at, \
                           finished_at, next_attempt_at, updated_at";

fn to_i32(field: &str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| CoreError::InvalidInput(format!("{field} {value} out of range")))
}

fn to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

/// Repository for job database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a queued job and returns its generated ID.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for submissions the table cannot hold and
    /// `ConstraintViolation` for a duplicate correlation id.
    pub async fn create(&self, job: &NewJob) -> Result<JobId> {
        self.create_impl(&*self.pool, job).await
    }

    /// Inserts a queued job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &NewJob,
    ) -> Result<JobId> {
        self.create_impl(&mut **tx, job).await
    }

    async fn create_impl<'e, E>(&self, executor: E, job: &NewJob) -> Result<JobId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        job.validate()?;
        let args = serde_json::Value::Array(job.args.clone());

        // clock_timestamp() keeps FIFO order for jobs inserted in one transaction
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, topic, rank, args, max_retry, attempt, correlation_group,
                correlation_id, status, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, 0, $6, $7, 'queued', clock_timestamp(), clock_timestamp()
            )
            RETURNING id
            "#,
        )
        .bind(JobId::new())
        .bind(&job.topic)
        .bind(to_i32("rank", job.rank)?)
        .bind(args)
        .bind(to_i32("max_retry", job.max_retry)?)
        .bind(&job.correlation_group)
        .bind(&job.correlation_id)
        .fetch_one(executor)
        .await?;

        Ok(JobId(id))
    }

    /// Claims the oldest eligible queued job.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never wait on, or
    /// both receive, the same row. The follow-up update is conditional on
    /// the row still being `queued`.
    ///
    /// # Errors
    ///
    /// Returns error if the database transaction fails.
    pub async fn claim_next(&self, filter: &ClaimFilter) -> Result<Option<Job>> {
        let rank = to_i32("rank", filter.rank)?;
        let mut tx = self.pool.begin().await?;

        let job_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE status = 'queued'
              AND rank = $1
              AND ($2::text[] IS NULL OR topic = ANY($2))
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(rank)
        .bind(filter.topics.as_deref())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'claimed',
                attempt = attempt + 1,
                claimed_at = NOW(),
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(job)
    }

    /// Records the outcome of a claimed job.
    ///
    /// Returns `false` when the job was not `claimed`, which leaves terminal
    /// rows untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(&self, job_id: JobId, outcome: &Outcome) -> Result<bool> {
        self.complete_impl(&*self.pool, job_id, outcome).await
    }

    /// Records the outcome of a claimed job within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        outcome: &Outcome,
    ) -> Result<bool> {
        self.complete_impl(&mut **tx, job_id, outcome).await
    }

    async fn complete_impl<'e, E>(&self, executor: E, job_id: JobId, outcome: &Outcome) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = match outcome {
            Outcome::Succeeded => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'succeeded', finished_at = NOW(), updated_at = NOW()
                    WHERE id = $1 AND status = 'claimed'
                    "#,
                )
                .bind(job_id)
                .execute(executor)
                .await?
            },
            Outcome::Retry { error, not_before } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'queued',
                        last_error = $2,
                        next_attempt_at = $3,
                        claimed_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'claimed'
                    "#,
                )
                .bind(job_id)
                .bind(error)
                .bind(not_before)
                .execute(executor)
                .await?
            },
            Outcome::Failed { error } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed', last_error = $2, finished_at = NOW(), updated_at = NOW()
                    WHERE id = $1 AND status = 'claimed'
                    "#,
                )
                .bind(job_id)
                .bind(error)
                .execute(executor)
                .await?
            },
            Outcome::HandlerMissing { error } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        attempt = GREATEST(attempt - 1, 0),
                        last_error = $2,
                        finished_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1 AND status = 'claimed'
                    "#,
                )
                .bind(job_id)
                .bind(error)
                .execute(executor)
                .await?
            },
        };

        Ok(result.rows_affected() == 1)
    }

    /// Finds a job by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(job)
    }

    /// Finds a job by its caller-supplied correlation id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE correlation_id = $1"
        ))
        .bind(correlation_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    /// Lists jobs newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR topic = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR correlation_group = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.topic.as_deref())
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.correlation_group.as_deref())
        .bind(i64::from(filter.limit))
        .bind(i64::from(filter.offset))
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Counts jobs per status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn stats(&self, filter: &StatsFilter) -> Result<JobStats> {
        let (queued, working, succeeded, failed): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued'),
                COUNT(*) FILTER (WHERE status = 'claimed'),
                COUNT(*) FILTER (WHERE status = 'succeeded'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM jobs
            WHERE ($1::text IS NULL OR topic = $1)
              AND ($2::text IS NULL OR correlation_group = $2)
            "#,
        )
        .bind(filter.topic.as_deref())
        .bind(filter.correlation_group.as_deref())
        .fetch_one(&*self.pool)
        .await?;

        Ok(JobStats {
            queued: to_u64(queued),
            working: to_u64(working),
            succeeded: to_u64(succeeded),
            failed: to_u64(failed),
        })
    }

    /// Releases claims older than `older_than` left behind by a crashed
    /// process.
    ///
    /// Jobs with retry budget left go back to `queued`; the rest fail.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempt <= max_retry THEN 'queued' ELSE 'failed' END,
                claimed_at = CASE WHEN attempt <= max_retry THEN NULL ELSE claimed_at END,
                finished_at = CASE WHEN attempt <= max_retry THEN NULL ELSE NOW() END,
                last_error = 'claim expired before completion',
                updated_at = NOW()
            WHERE status = 'claimed' AND claimed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            warn!(released, %older_than, "Released stale job claims");
        }
        Ok(released)
    }
}
