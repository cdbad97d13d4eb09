//! Test environment bundling a store, a deterministic clock and manager
//! configuration.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use jobqueue_core::{
    models::{Job, JobId, ListFilter},
    Clock, EventHandler, TestClock,
};
use jobqueue_manager::{
    storage::mock::MockJobStore, JobStore, Manager, ManagerConfig, PostgresJobStore, RetryPolicy,
    TopicScope,
};

use crate::database::TestDatabase;

/// Upper bound for waiting on asynchronous worker progress.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`TestEnv`].
pub struct TestEnvBuilder {
    config: ManagerConfig,
    database: Option<TestDatabase>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl TestEnvBuilder {
    /// Builder with a single rank-0 worker and a short poll interval.
    pub fn new() -> Self {
        Self {
            config: ManagerConfig {
                poll_interval: Duration::from_millis(10),
                error_backoff: Duration::from_millis(10),
                ..ManagerConfig::default()
            },
            database: None,
            event_handler: None,
        }
    }

    /// Sets the concurrency limit of `rank`.
    #[must_use]
    pub fn concurrency(mut self, rank: u32, workers: usize) -> Self {
        self.config = self.config.concurrency(rank, workers);
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Sets which topics workers claim.
    #[must_use]
    pub fn topic_scope(mut self, scope: TopicScope) -> Self {
        self.config.topic_scope = scope;
        self
    }

    /// Bounds how long `stop` waits.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = Some(timeout);
        self
    }

    /// Runs managers against PostgreSQL instead of the in-memory store.
    #[must_use]
    pub fn postgres(mut self, database: TestDatabase) -> Self {
        self.database = Some(database);
        self
    }

    /// Sends lifecycle events to `handler`.
    #[must_use]
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Builds the environment.
    pub fn build(self) -> TestEnv {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let clock = TestClock::new();
        let mock = MockJobStore::with_clock(Arc::new(clock.clone()));
        let store: Arc<dyn JobStore> = match &self.database {
            Some(database) => Arc::new(PostgresJobStore::new(database.storage())),
            None => Arc::new(mock.clone()),
        };

        TestEnv { clock, mock, store, config: self.config, event_handler: self.event_handler }
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Store, clock and configuration for one test.
pub struct TestEnv {
    /// Deterministic clock shared by the store and managers
    pub clock: TestClock,
    mock: MockJobStore,
    store: Arc<dyn JobStore>,
    config: ManagerConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl TestEnv {
    /// In-memory environment with default settings.
    pub fn new() -> Self {
        TestEnvBuilder::new().build()
    }

    /// Creates a builder.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// The in-memory store, for fault injection. Unused when the environment
    /// runs against PostgreSQL.
    pub fn mock(&self) -> &MockJobStore {
        &self.mock
    }

    /// The store managers of this environment use.
    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// The manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Creates a stopped manager over this environment's store and clock.
    pub fn manager(&self) -> Result<Manager> {
        let manager = Manager::new(self.store.clone(), self.config.clone())
            .context("invalid manager configuration")?
            .with_clock(Arc::new(self.clock.clone()));

        Ok(match &self.event_handler {
            Some(handler) => manager.with_event_handler(handler.clone()),
            None => manager,
        })
    }

    /// Advances the test clock.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Current test time.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now_utc()
    }

    /// Loads a job that must exist.
    pub async fn job(&self, id: JobId) -> Result<Job> {
        self.store.find(id).await?.with_context(|| format!("job {id} not found"))
    }

    /// Loads every job of `topic`.
    pub async fn jobs_for_topic(&self, topic: &str) -> Result<Vec<Job>> {
        let filter =
            ListFilter { topic: Some(topic.to_string()), limit: 1000, ..ListFilter::default() };
        Ok(self.store.list(filter).await?)
    }

    /// Waits until every job in `ids` is terminal and returns them.
    pub async fn wait_for_terminal(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.wait_until("jobs to reach a terminal status", || async move {
            for id in ids {
                if !self.job(*id).await?.is_terminal() {
                    return Ok(false);
                }
            }
            anyhow::Ok(true)
        })
        .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            jobs.push(self.job(*id).await?);
        }
        Ok(jobs)
    }

    /// Polls `condition` until it holds or [`WAIT_TIMEOUT`] elapses.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if condition().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("timed out after {WAIT_TIMEOUT:?} waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
