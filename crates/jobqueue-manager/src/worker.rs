//! Job worker: claims one job at a time and runs its handler.
//!
//! A worker owns at most one claimed job, so a rank pool of `N` workers never
//! holds more than `N` claims. Cancellation is only observed between jobs; a
//! running handler always completes and its outcome is persisted before the
//! worker exits.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use jobqueue_core::{
    models::{ClaimFilter, Job, Outcome},
    Clock, EventHandler, HandlerMissingEvent, JobEvent, JobFailedEvent, JobRetryScheduledEvent,
    JobSucceededEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{ManagerConfig, TopicScope},
    error::{HandlerError, ManagerError, Result},
    registry::TopicRegistry,
    retry::RetryDecision,
    storage::JobStore,
};

/// Failed outcome writes between error-level log lines.
const COMPLETE_ERROR_EVERY: u64 = 10;

/// Collaborators shared by every worker of a manager.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub registry: TopicRegistry,
    pub config: Arc<ManagerConfig>,
    pub clock: Arc<dyn Clock>,
    pub event_handler: Arc<dyn EventHandler>,
}

/// Individual worker serving one rank.
pub(crate) struct JobWorker {
    id: usize,
    rank: u32,
    context: WorkerContext,
    cancellation_token: CancellationToken,
}

impl JobWorker {
    pub fn new(
        id: usize,
        rank: u32,
        context: WorkerContext,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, rank, context, cancellation_token }
    }

    /// Main worker loop: claims and processes jobs until cancelled.
    pub async fn run(&self) {
        info!(worker_id = self.id, rank = self.rank, "job worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, rank = self.rank, "job worker received shutdown signal");
                break;
            }

            match self.process_next().await {
                Ok(true) => {},
                Ok(false) => {
                    tokio::select! {
                        () = self.context.clock.sleep(self.context.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        rank = self.rank,
                        error = %error,
                        "failed to claim job"
                    );
                    tokio::select! {
                        () = self.context.clock.sleep(self.context.config.error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, rank = self.rank, "job worker stopped");
    }

    /// Claims and processes one job. Returns `false` when nothing was
    /// claimable.
    async fn process_next(&self) -> Result<bool> {
        let filter = match self.context.config.topic_scope {
            TopicScope::AnyTopic => ClaimFilter::any_topic(self.rank),
            TopicScope::RegisteredTopics => {
                let topics = self.context.registry.topics().await;
                if topics.is_empty() {
                    return Ok(false);
                }
                ClaimFilter::topics(self.rank, topics)
            },
        };

        let Some(job) = self.context.store.claim_next(filter).await.map_err(ManagerError::from)?
        else {
            return Ok(false);
        };

        debug!(
            worker_id = self.id,
            rank = self.rank,
            job_id = %job.id,
            topic = %job.topic,
            attempt = job.attempt,
            "claimed job"
        );

        self.process_job(job).await;
        Ok(true)
    }

    async fn process_job(&self, job: Job) {
        let Some(handler) = self.context.registry.get(&job.topic).await else {
            let error = ManagerError::handler_missing(&job.topic);
            warn!(
                worker_id = self.id,
                job_id = %job.id,
                topic = %job.topic,
                "no handler registered, failing job"
            );
            let outcome = Outcome::HandlerMissing { error: error.to_string() };
            if self.record(&job, outcome).await {
                self.emit(JobEvent::HandlerMissing(HandlerMissingEvent {
                    job_id: job.id,
                    topic: job.topic.clone(),
                    failed_at: self.context.clock.now_utc(),
                }))
                .await;
            }
            return;
        };

        let result = AssertUnwindSafe(handler.process(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::retryable(format!("handler panicked: {}", panic_message(&panic))))
            });
        let now = self.context.clock.now_utc();

        match result {
            Ok(()) => {
                if self.record(&job, Outcome::Succeeded).await {
                    info!(
                        worker_id = self.id,
                        job_id = %job.id,
                        topic = %job.topic,
                        attempt = job.attempt,
                        "job succeeded"
                    );
                    self.emit(JobEvent::Succeeded(JobSucceededEvent {
                        job_id: job.id,
                        topic: job.topic.clone(),
                        rank: job.rank,
                        attempt: job.attempt,
                        finished_at: now,
                    }))
                    .await;
                }
            },
            Err(error) => {
                let failure = ManagerError::handler_failure(error.message.clone());
                match self.context.config.retry_policy.decide(&job, &error, now) {
                    RetryDecision::Retry { not_before } => {
                        warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            topic = %job.topic,
                            attempt = job.attempt,
                            max_retry = job.max_retry,
                            error = %failure,
                            "job failed, scheduling retry"
                        );
                        let outcome = Outcome::Retry { error: error.message.clone(), not_before };
                        if self.record(&job, outcome).await {
                            self.emit(JobEvent::RetryScheduled(JobRetryScheduledEvent {
                                job_id: job.id,
                                topic: job.topic.clone(),
                                attempt: job.attempt,
                                error_message: error.message,
                                next_attempt_at: not_before,
                            }))
                            .await;
                        }
                    },
                    RetryDecision::GiveUp { reason } => {
                        warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            topic = %job.topic,
                            attempt = job.attempt,
                            error = %failure,
                            reason = %reason,
                            "job failed permanently"
                        );
                        let outcome = Outcome::Failed { error: error.message.clone() };
                        if self.record(&job, outcome).await {
                            self.emit(JobEvent::Failed(JobFailedEvent {
                                job_id: job.id,
                                topic: job.topic.clone(),
                                attempt: job.attempt,
                                error_message: error.message,
                                retryable: error.retryable,
                                failed_at: now,
                            }))
                            .await;
                        }
                    },
                }
            },
        }
    }

    /// Persists `outcome`, retrying store errors every `error_backoff` until
    /// the store accepts it.
    ///
    /// Not interrupted by cancellation, and the worker claims nothing else
    /// meanwhile, so the rank keeps its concurrency budget. Returns whether
    /// the job row changed.
    async fn record(&self, job: &Job, outcome: Outcome) -> bool {
        let mut failures: u64 = 0;
        loop {
            match self.context.store.complete(job.id, outcome.clone()).await {
                Ok(true) => {
                    if failures > 0 {
                        info!(
                            worker_id = self.id,
                            job_id = %job.id,
                            failures,
                            "job outcome recorded after store recovered"
                        );
                    }
                    return true;
                },
                Ok(false) => {
                    warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        "job was no longer claimed, outcome discarded"
                    );
                    return false;
                },
                Err(e) => {
                    failures += 1;
                    if failures % COMPLETE_ERROR_EVERY == 0 {
                        error!(
                            worker_id = self.id,
                            job_id = %job.id,
                            failures,
                            error = %e,
                            "still unable to record job outcome"
                        );
                    } else {
                        warn!(
                            worker_id = self.id,
                            job_id = %job.id,
                            failures,
                            error = %e,
                            "failed to record job outcome, retrying"
                        );
                    }
                    self.context.clock.sleep(self.context.config.error_backoff).await;
                },
            }
        }
    }

    async fn emit(&self, event: JobEvent) {
        self.context.event_handler.handle_event(event).await;
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use jobqueue_core::{
        models::{JobStatus, NewJob},
        NoOpEventHandler, TestClock,
    };

    use super::*;
    use crate::{
        registry::{handler_fn, JobHandler},
        storage::mock::MockJobStore,
    };

    struct Exploding;

    #[async_trait::async_trait]
    impl JobHandler for Exploding {
        async fn process(&self, _job: &Job) -> std::result::Result<(), HandlerError> {
            panic!("handler exploded")
        }
    }

    /// Succeeds, but takes the store offline before the outcome is written.
    struct TakesStoreOffline(MockJobStore);

    #[async_trait::async_trait]
    impl JobHandler for TakesStoreOffline {
        async fn process(&self, _job: &Job) -> std::result::Result<(), HandlerError> {
            self.0.set_unavailable(true);
            Ok(())
        }
    }

    fn context(store: &MockJobStore) -> WorkerContext {
        WorkerContext {
            store: Arc::new(store.clone()),
            registry: TopicRegistry::new(),
            config: Arc::new(ManagerConfig::default()),
            clock: Arc::new(TestClock::new()),
            event_handler: Arc::new(NoOpEventHandler::new()),
        }
    }

    #[tokio::test]
    async fn empty_queue_reports_idle() {
        let store = MockJobStore::new();
        let worker = JobWorker::new(0, 0, context(&store), CancellationToken::new());

        assert!(!worker.process_next().await.unwrap());
        assert_eq!(store.claim_calls(), 1);
    }

    #[tokio::test]
    async fn claim_errors_surface_as_store_unavailable() {
        let store = MockJobStore::new();
        store.inject_claim_error("connection reset").await;
        let worker = JobWorker::new(0, 0, context(&store), CancellationToken::new());

        let err = worker.process_next().await.unwrap_err();
        assert!(matches!(err, ManagerError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn panicking_handler_is_retried() {
        let store = MockJobStore::new();
        let ctx = context(&store);
        ctx.registry.register("Plan", Arc::new(Exploding)).await;
        let id = store.persist(NewJob::new("Plan").max_retry(1)).await.unwrap();
        let worker = JobWorker::new(0, 0, ctx, CancellationToken::new());

        assert!(worker.process_next().await.unwrap());

        let job = store.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert!(job.last_error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn registered_scope_skips_claim_without_handlers() {
        let store = MockJobStore::new();
        let mut ctx = context(&store);
        ctx.config = Arc::new(ManagerConfig {
            topic_scope: TopicScope::RegisteredTopics,
            ..ManagerConfig::default()
        });
        store.persist(NewJob::new("Plan")).await.unwrap();
        let worker = JobWorker::new(0, 0, ctx, CancellationToken::new());

        assert!(!worker.process_next().await.unwrap());
        assert_eq!(store.claim_calls(), 0);
    }

    #[tokio::test]
    async fn outcome_recording_survives_transient_store_error() {
        let store = MockJobStore::new();
        let ctx = context(&store);
        ctx.registry.register("Plan", Arc::new(handler_fn(|_| async { Ok::<_, HandlerError>(()) }))).await;
        let id = store.persist(NewJob::new("Plan")).await.unwrap();
        store.inject_complete_error("connection reset").await;
        let worker = JobWorker::new(0, 0, ctx, CancellationToken::new());

        assert!(worker.process_next().await.unwrap());
        assert_eq!(store.job(id).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn outcome_is_retried_until_store_recovers() {
        let store = MockJobStore::new();
        let ctx = context(&store);
        ctx.registry.register("Plan", Arc::new(TakesStoreOffline(store.clone()))).await;
        let first = store.persist(NewJob::new("Plan")).await.unwrap();
        let second = store.persist(NewJob::new("Plan")).await.unwrap();
        let worker = JobWorker::new(0, 0, ctx, CancellationToken::new());

        let task = tokio::spawn(async move {
            let processed = worker.process_next().await;
            (worker, processed)
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.complete_calls() < 10 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker keeps retrying the outcome");

        assert!(!task.is_finished());
        assert_eq!(store.job(first).await.unwrap().status, JobStatus::Claimed);
        assert_eq!(store.job(second).await.unwrap().status, JobStatus::Queued);
        assert_eq!(store.claim_calls(), 1);

        store.set_unavailable(false);
        let (_worker, processed) = task.await.unwrap();

        assert!(processed.unwrap());
        assert_eq!(store.job(first).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(store.job(second).await.unwrap().status, JobStatus::Queued);
        assert_eq!(store.claim_calls(), 1);
    }
}
