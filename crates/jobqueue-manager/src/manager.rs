//! Job manager orchestrating the registry, rank pools and store.
//!
//! ```text
//! ┌─────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Manager │──▶│ Rank pools    │──▶│ Topic        │
//! └─────────┘   │ (N per rank)  │   │ handlers     │
//!      │        └───────────────┘   └──────────────┘
//!      ▼               │
//! ┌─────────────────────────┐
//! │ JobStore (PostgreSQL)   │
//! └─────────────────────────┘
//! ```
//!
//! `add`, `stats` and the lookups go straight to the store. `start` spawns one
//! pool per configured rank and `stop` drains them.

use std::sync::Arc;

use futures::future::join_all;
use jobqueue_core::{
    models::{Job, JobId, JobStats, ListFilter, NewJob, StatsFilter},
    storage::Storage,
    Clock, EventHandler, NoOpEventHandler, RealClock,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::ManagerConfig,
    error::{ManagerError, Result},
    registry::{JobHandler, TopicRegistry},
    storage::{JobStore, PostgresJobStore},
    worker::WorkerContext,
    worker_pool::RankPool,
};

/// Persistent job queue manager.
///
/// # Example
///
/// ```no_run
/// use jobqueue_core::models::NewJob;
/// use jobqueue_manager::{handler_fn, HandlerError, Manager, ManagerConfig};
/// use sqlx::PgPool;
///
/// # async fn example(pool: PgPool) -> Result<(), jobqueue_manager::ManagerError> {
/// let mut manager = Manager::postgres(pool, ManagerConfig::default().concurrency(1, 2))?;
///
/// manager
///     .register("Room Type", handler_fn(|job| async move {
///         tracing::info!(job_id = %job.id, "resizing");
///         Ok::<_, HandlerError>(())
///     }))
///     .await;
///
/// manager.add(NewJob::new("Room Type").rank(1).max_retry(3).arg(640).arg(480)).await?;
/// manager.start().await?;
/// // ...
/// manager.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    store: Arc<dyn JobStore>,
    registry: TopicRegistry,
    config: Arc<ManagerConfig>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    cancellation_token: Option<CancellationToken>,
    pools: Vec<RankPool>,
}

impl Manager {
    /// Creates a stopped manager over `store`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Configuration` if `config` is invalid.
    pub fn new(store: Arc<dyn JobStore>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            registry: TopicRegistry::new(),
            config: Arc::new(config),
            clock: Arc::new(RealClock::new()),
            event_handler: Arc::new(NoOpEventHandler::new()),
            cancellation_token: None,
            pools: Vec::new(),
        })
    }

    /// Creates a manager backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Configuration` if `config` is invalid.
    pub fn postgres(pool: PgPool, config: ManagerConfig) -> Result<Self> {
        let storage = Arc::new(Storage::new(pool));
        Self::new(Arc::new(PostgresJobStore::new(storage)), config)
    }

    /// Replaces the clock used for sleeps and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the handler receiving job lifecycle events.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Registers `handler` for `topic`, replacing any previous one.
    ///
    /// Takes effect for jobs claimed after the call, also while running.
    pub async fn register(&self, topic: impl Into<String>, handler: impl JobHandler) {
        let topic = topic.into();
        info!(topic = %topic, "registering job handler");
        self.registry.register(topic, Arc::new(handler)).await;
    }

    /// Validates and persists a job. It is claimable once persisted.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidJob` if the submission is rejected and
    /// `ManagerError::StoreUnavailable` if it could not be persisted.
    pub async fn add(&self, job: NewJob) -> Result<JobId> {
        job.validate()?;

        let topic = job.topic.clone();
        let rank = job.rank;
        let id = self.store.persist(job).await?;

        info!(job_id = %id, topic = %topic, rank, "job added");
        Ok(id)
    }

    /// Starts one pool per configured rank.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::AlreadyStarted` if running,
    /// `ManagerError::StillStopping` while workers of a timed out `stop` are
    /// still finishing, and `ManagerError::StoreUnavailable` if the store is
    /// unreachable. Nothing is spawned on error.
    pub async fn start(&mut self) -> Result<()> {
        if self.cancellation_token.is_some() {
            return Err(ManagerError::AlreadyStarted);
        }

        // Pools left by a timed out stop still count against the rank limits.
        self.pools.retain(RankPool::has_active_workers);
        if !self.pools.is_empty() {
            let active_workers = self.pools.iter().map(RankPool::active_workers).sum();
            return Err(ManagerError::StillStopping { active_workers });
        }

        self.store.health_check().await?;

        if let Some(timeout) = self.config.stale_claim_timeout {
            let older_than = self.clock.now_utc()
                - chrono::Duration::from_std(timeout)
                    .map_err(|e| ManagerError::configuration(e.to_string()))?;
            let released = self.store.release_stale_claims(older_than).await?;
            if released > 0 {
                warn!(released, "released stale job claims");
            }
        }

        info!(
            ranks = self.config.ranks.len(),
            total_workers = self.config.total_workers(),
            "starting job manager"
        );

        let token = CancellationToken::new();
        let context = WorkerContext {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            event_handler: self.event_handler.clone(),
        };

        for (&rank, &workers) in &self.config.ranks {
            if workers == 0 {
                info!(rank, "rank disabled");
                continue;
            }
            let mut pool = RankPool::new(rank, workers, context.clone(), token.clone());
            pool.spawn_workers();
            self.pools.push(pool);
        }

        self.cancellation_token = Some(token);
        info!("job manager started");
        Ok(())
    }

    /// Stops all workers, waiting for in-flight jobs to finish and their
    /// outcomes to be persisted.
    ///
    /// Waits indefinitely unless `shutdown_timeout` is configured. After a
    /// timeout the remaining workers keep finishing their jobs in the
    /// background; calling `stop` again resumes waiting for them. The
    /// manager can be started again once every worker has exited.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotStarted` if neither running nor stopping,
    /// `ManagerError::ShutdownTimeout` if the configured timeout elapsed and
    /// `ManagerError::WorkerPanic` if a worker task died.
    pub async fn stop(&mut self) -> Result<()> {
        match self.cancellation_token.take() {
            Some(token) => {
                info!(pools = self.pools.len(), "stopping job manager");
                token.cancel();
            },
            None if !self.pools.is_empty() => {
                info!(pools = self.pools.len(), "waiting for workers of a timed out stop");
            },
            None => return Err(ManagerError::NotStarted),
        }

        let drain = join_all(self.pools.iter_mut().map(RankPool::shutdown));

        let results = match self.config.shutdown_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, drain).await {
                Ok(results) => results,
                Err(_elapsed) => {
                    let active_workers: usize =
                        self.pools.iter().map(RankPool::active_workers).sum();
                    error!(
                        timeout_seconds = timeout.as_secs(),
                        active_workers,
                        "worker shutdown timed out, some jobs may still be running"
                    );
                    return Err(ManagerError::ShutdownTimeout { timeout });
                },
            },
            None => drain.await,
        };

        self.pools.clear();
        results.into_iter().collect::<Result<Vec<()>>>()?;
        info!("job manager stopped");
        Ok(())
    }

    /// Job counts per status matching `filter`. Zero counts when nothing
    /// matches.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::StoreUnavailable` if the store fails.
    pub async fn stats(&self, filter: StatsFilter) -> Result<JobStats> {
        Ok(self.store.query_stats(filter).await?)
    }

    /// Loads a job by id.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::StoreUnavailable` if the store fails.
    pub async fn lookup(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.store.find(job_id).await?)
    }

    /// Loads a job by its caller-supplied correlation id.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::StoreUnavailable` if the store fails.
    pub async fn lookup_by_correlation_id(
        &self,
        correlation_id: impl Into<String>,
    ) -> Result<Option<Job>> {
        Ok(self.store.find_by_correlation_id(correlation_id.into()).await?)
    }

    /// Lists jobs matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::StoreUnavailable` if the store fails.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Job>> {
        Ok(self.store.list(filter).await?)
    }

    /// Whether `start` succeeded and `stop` has not been called since.
    pub fn is_running(&self) -> bool {
        self.cancellation_token.is_some()
    }

    /// Whether any worker task is still alive.
    pub fn has_active_workers(&self) -> bool {
        self.pools.iter().any(RankPool::has_active_workers)
    }

    /// The manager's topic registry.
    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}
