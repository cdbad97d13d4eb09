//! Shared PostgreSQL access for database-backed tests.
//!
//! Tests call [`TestDatabase::from_env`] and return early when it yields
//! `None`, so the suite passes on machines without `DATABASE_URL`. Tests
//! sharing one database keep their data apart with unique topics.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use jobqueue_core::storage::Storage;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::debug;

// Pools are per test because each #[tokio::test] has its own runtime.
static MIGRATED: tokio::sync::OnceCell<()> = tokio::sync::OnceCell::const_new();

/// Handle to the migrated test database.
#[derive(Debug, Clone)]
pub struct TestDatabase {
    pool: PgPool,
}

impl TestDatabase {
    /// Connects to `DATABASE_URL` and applies the schema once per process.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is unset.
    pub async fn from_env() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            return Ok(None);
        };

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(0)
            .max_lifetime(Duration::from_secs(300))
            .acquire_timeout(Duration::from_secs(30))
            .connect(&database_url)
            .await
            .context("failed to create test connection pool")?;

        MIGRATED
            .get_or_try_init(|| async {
                Storage::new(pool.clone()).migrate().await.context("failed to apply schema")?;
                debug!("test database schema ready");
                anyhow::Ok(())
            })
            .await?;

        Ok(Some(Self { pool }))
    }

    /// The test pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Storage over the test pool.
    pub fn storage(&self) -> Arc<Storage> {
        Arc::new(Storage::new(self.pool.clone()))
    }
}
