//! Database access layer for job persistence.
//!
//! All SQL lives in this module. Callers go through [`Storage`] and its
//! repositories so the schema can evolve without touching worker logic.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::debug;

pub mod jobs;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        topic TEXT NOT NULL CHECK (length(topic) BETWEEN 1 AND 255),
        rank INTEGER NOT NULL CHECK (rank >= 0),
        args JSONB NOT NULL DEFAULT '[]'::jsonb,
        max_retry INTEGER NOT NULL CHECK (max_retry >= 0),
        attempt INTEGER NOT NULL DEFAULT 0,
        correlation_group TEXT NOT NULL DEFAULT '' CHECK (length(correlation_group) <= 255),
        correlation_id TEXT,
        status TEXT NOT NULL DEFAULT 'queued'
            CHECK (status IN ('queued', 'claimed', 'succeeded', 'failed')),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        claimed_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        next_attempt_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        CHECK (attempt >= 0 AND attempt <= max_retry + 1)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs(rank, topic, created_at)
    WHERE status = 'queued'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_stats
    ON jobs(topic, correlation_group, status)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_correlation_id
    ON jobs(correlation_id)
    WHERE correlation_id IS NOT NULL
    "#,
];

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for job operations.
    pub jobs: Arc<jobs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { jobs: Arc::new(jobs::Repository::new(Arc::new(pool))) }
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Unavailable` if the pool cannot reach the server.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.jobs.pool()).await?;

        Ok(())
    }

    /// Creates the `jobs` table and its indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.jobs.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }
        debug!(statements = SCHEMA.len(), "Job schema up to date");

        Ok(())
    }
}
