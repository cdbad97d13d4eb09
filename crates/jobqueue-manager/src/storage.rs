//! Storage abstraction layer for the job manager.
//!
//! Workers and the manager only see [`JobStore`]. Production wraps the
//! PostgreSQL repository from `jobqueue_core::storage`; tests use the
//! in-memory [`mock::MockJobStore`], which honours the same claim and
//! completion contract.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use jobqueue_core::{
    error::Result,
    models::{ClaimFilter, Job, JobId, JobStats, ListFilter, NewJob, Outcome, StatsFilter},
    storage::Storage,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations required by the manager and its workers.
///
/// Implementations never retry internally; connectivity failures surface as
/// `CoreError::Unavailable` and the caller decides when to try again.
pub trait JobStore: Send + Sync + 'static {
    /// Inserts a queued job.
    fn persist(&self, job: NewJob) -> StoreFuture<'_, JobId>;

    /// Atomically claims the oldest eligible queued job matching `filter`.
    ///
    /// The returned job is `claimed` with `attempt` already incremented.
    /// Two concurrent calls never return the same job.
    fn claim_next(&self, filter: ClaimFilter) -> StoreFuture<'_, Option<Job>>;

    /// Records the outcome of a claimed job.
    ///
    /// Returns `false` if the job was not `claimed`.
    fn complete(&self, job_id: JobId, outcome: Outcome) -> StoreFuture<'_, bool>;

    /// Counts jobs per status.
    fn query_stats(&self, filter: StatsFilter) -> StoreFuture<'_, JobStats>;

    /// Finds a job by ID.
    fn find(&self, job_id: JobId) -> StoreFuture<'_, Option<Job>>;

    /// Finds a job by correlation id.
    fn find_by_correlation_id(&self, correlation_id: String) -> StoreFuture<'_, Option<Job>>;

    /// Lists jobs newest first.
    fn list(&self, filter: ListFilter) -> StoreFuture<'_, Vec<Job>>;

    /// Releases claims older than `older_than`, returning how many changed.
    fn release_stale_claims(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Verifies the store is reachable.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}

/// Production store backed by PostgreSQL.
pub struct PostgresJobStore {
    storage: Arc<Storage>,
}

impl PostgresJobStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl JobStore for PostgresJobStore {
    fn persist(&self, job: NewJob) -> StoreFuture<'_, JobId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.create(&job).await })
    }

    fn claim_next(&self, filter: ClaimFilter) -> StoreFuture<'_, Option<Job>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.claim_next(&filter).await })
    }

    fn complete(&self, job_id: JobId, outcome: Outcome) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.complete(job_id, &outcome).await })
    }

    fn query_stats(&self, filter: StatsFilter) -> StoreFuture<'_, JobStats> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.stats(&filter).await })
    }

    fn find(&self, job_id: JobId) -> StoreFuture<'_, Option<Job>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find_by_id(job_id).await })
    }

    fn find_by_correlation_id(&self, correlation_id: String) -> StoreFuture<'_, Option<Job>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find_by_correlation_id(&correlation_id).await })
    }

    fn list(&self, filter: ListFilter) -> StoreFuture<'_, Vec<Job>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.list(&filter).await })
    }

    fn release_stale_claims(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.release_stale_claims(older_than).await })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory store for testing manager logic without a database.
    //!
    //! Claims happen inside a single mutex section, so the mock gives the
    //! same exclusivity guarantee as `FOR UPDATE SKIP LOCKED`. Timestamps
    //! come from the injected clock.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use jobqueue_core::{
        error::{CoreError, Result},
        models::{JobStatus, StatsFilter},
        time::{Clock, RealClock},
    };
    use tokio::sync::{Mutex, RwLock};

    use super::{
        ClaimFilter, Job, JobId, JobStats, JobStore, ListFilter, NewJob, Outcome, StoreFuture,
    };

    #[derive(Default)]
    struct State {
        jobs: HashMap<JobId, Job>,
        // insertion order doubles as created_at order
        order: Vec<JobId>,
    }

    /// Mock store keeping jobs in memory.
    #[derive(Clone)]
    pub struct MockJobStore {
        state: Arc<Mutex<State>>,
        clock: Arc<dyn Clock>,
        unavailable: Arc<AtomicBool>,
        claim_error: Arc<RwLock<Option<String>>>,
        complete_error: Arc<RwLock<Option<String>>>,
        claim_calls: Arc<AtomicUsize>,
        complete_calls: Arc<AtomicUsize>,
    }

    impl MockJobStore {
        /// Creates an empty store using the real clock.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty store stamping times from `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                state: Arc::new(Mutex::new(State::default())),
                clock,
                unavailable: Arc::new(AtomicBool::new(false)),
                claim_error: Arc::new(RwLock::new(None)),
                complete_error: Arc::new(RwLock::new(None)),
                claim_calls: Arc::new(AtomicUsize::new(0)),
                complete_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Makes every operation fail with `CoreError::Unavailable` until
        /// switched back.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Injects an error for the next completion.
        pub async fn inject_complete_error(&self, error: impl Into<String>) {
            *self.complete_error.write().await = Some(error.into());
        }

        /// Number of claim attempts, including failed and empty ones.
        pub fn claim_calls(&self) -> usize {
            self.claim_calls.load(Ordering::SeqCst)
        }

        /// Number of completion attempts, including failed ones.
        pub fn complete_calls(&self) -> usize {
            self.complete_calls.load(Ordering::SeqCst)
        }

        /// Snapshot of one job.
        pub async fn job(&self, job_id: JobId) -> Option<Job> {
            self.state.lock().await.jobs.get(&job_id).cloned()
        }

        /// Snapshot of all jobs in insertion order.
        pub async fn jobs(&self) -> Vec<Job> {
            let state = self.state.lock().await;
            state.order.iter().filter_map(|id| state.jobs.get(id).cloned()).collect()
        }

        /// Inserts a job as-is, bypassing validation.
        ///
        /// Used to seed claimed or terminal rows.
        pub async fn insert(&self, job: Job) {
            let mut state = self.state.lock().await;
            if state.jobs.insert(job.id, job.clone()).is_none() {
                state.order.push(job.id);
            }
        }

        fn check_available(&self) -> Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CoreError::Unavailable("mock store offline".to_string()));
            }
            Ok(())
        }
    }

    impl Default for MockJobStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl JobStore for MockJobStore {
        fn persist(&self, job: NewJob) -> StoreFuture<'_, JobId> {
            Box::pin(async move {
                self.check_available()?;
                job.validate()?;

                let mut state = self.state.lock().await;
                if let Some(correlation_id) = &job.correlation_id {
                    let duplicate = state
                        .jobs
                        .values()
                        .any(|j| j.correlation_id.as_deref() == Some(correlation_id.as_str()));
                    if duplicate {
                        return Err(CoreError::ConstraintViolation(format!(
                            "correlation_id {correlation_id} already exists"
                        )));
                    }
                }

                let id = JobId::new();
                state.jobs.insert(id, Job::from_submission(id, job, self.clock.now_utc()));
                state.order.push(id);
                Ok(id)
            })
        }

        fn claim_next(&self, filter: ClaimFilter) -> StoreFuture<'_, Option<Job>> {
            Box::pin(async move {
                self.claim_calls.fetch_add(1, Ordering::SeqCst);
                self.check_available()?;

                let error = self.claim_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Unavailable(error));
                }

                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                let State { jobs, order } = &mut *state;

                let next = order.iter().copied().find(|id| {
                    jobs.get(id).is_some_and(|job| {
                        job.status == JobStatus::Queued
                            && filter.matches(job)
                            && job.next_attempt_at.is_none_or(|at| at <= now)
                    })
                });

                Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
                    job.status = JobStatus::Claimed;
                    job.attempt += 1;
                    job.claimed_at = Some(now);
                    job.next_attempt_at = None;
                    job.updated_at = now;
                    job.clone()
                }))
            })
        }

        fn complete(&self, job_id: JobId, outcome: Outcome) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.complete_calls.fetch_add(1, Ordering::SeqCst);
                self.check_available()?;

                let error = self.complete_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Unavailable(error));
                }

                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    return Ok(false);
                };
                if job.status != JobStatus::Claimed {
                    return Ok(false);
                }

                job.status = outcome.resulting_status();
                job.updated_at = now;
                match outcome {
                    Outcome::Succeeded => job.finished_at = Some(now),
                    Outcome::Retry { error, not_before } => {
                        job.last_error = Some(error);
                        job.next_attempt_at = not_before;
                        job.claimed_at = None;
                    },
                    Outcome::Failed { error } => {
                        job.last_error = Some(error);
                        job.finished_at = Some(now);
                    },
                    Outcome::HandlerMissing { error } => {
                        job.attempt = job.attempt.saturating_sub(1);
                        job.last_error = Some(error);
                        job.finished_at = Some(now);
                    },
                }
                Ok(true)
            })
        }

        fn query_stats(&self, filter: StatsFilter) -> StoreFuture<'_, JobStats> {
            Box::pin(async move {
                self.check_available()?;

                let state = self.state.lock().await;
                let mut stats = JobStats::default();
                for job in state.jobs.values().filter(|job| filter.matches(job)) {
                    stats.record(job.status);
                }
                Ok(stats)
            })
        }

        fn find(&self, job_id: JobId) -> StoreFuture<'_, Option<Job>> {
            Box::pin(async move {
                self.check_available()?;
                Ok(self.state.lock().await.jobs.get(&job_id).cloned())
            })
        }

        fn find_by_correlation_id(&self, correlation_id: String) -> StoreFuture<'_, Option<Job>> {
            Box::pin(async move {
                self.check_available()?;
                let state = self.state.lock().await;
                Ok(state
                    .jobs
                    .values()
                    .find(|job| job.correlation_id.as_deref() == Some(correlation_id.as_str()))
                    .cloned())
            })
        }

        fn list(&self, filter: ListFilter) -> StoreFuture<'_, Vec<Job>> {
            Box::pin(async move {
                self.check_available()?;
                let state = self.state.lock().await;
                Ok(state
                    .order
                    .iter()
                    .rev()
                    .filter_map(|id| state.jobs.get(id))
                    .filter(|job| filter.matches(job))
                    .skip(filter.offset as usize)
                    .take(filter.limit as usize)
                    .cloned()
                    .collect())
            })
        }

        fn release_stale_claims(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                self.check_available()?;
                let now = self.clock.now_utc();
                let mut state = self.state.lock().await;
                let mut released = 0;

                for job in state.jobs.values_mut() {
                    let stale = job.status == JobStatus::Claimed
                        && job.claimed_at.is_some_and(|at| at < older_than);
                    if !stale {
                        continue;
                    }

                    if job.can_retry() {
                        job.status = JobStatus::Queued;
                        job.claimed_at = None;
                    } else {
                        job.status = JobStatus::Failed;
                        job.finished_at = Some(now);
                    }
                    job.last_error = Some("claim expired before completion".to_string());
                    job.updated_at = now;
                    released += 1;
                }
                Ok(released)
            })
        }

        fn health_check(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move { self.check_available() })
        }
    }

}
