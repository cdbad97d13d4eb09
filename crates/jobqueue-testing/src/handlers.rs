//! Probe handlers that record what the worker pool does to them.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use jobqueue_core::models::{Job, JobId};
use jobqueue_manager::{HandlerError, JobHandler};
use tokio::sync::Mutex;

/// Tracks how many handler invocations overlap.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    /// Creates a probe with zero counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an invocation as running until the guard is dropped.
    pub fn enter(&self) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard { current: self.current.clone() }
    }

    /// Invocations running right now.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest overlap observed.
    pub fn max_observed(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Guard returned by [`ConcurrencyProbe::enter`].
#[derive(Debug)]
pub struct ProbeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One recorded handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Job that was processed
    pub job_id: JobId,
    /// Topic of the job
    pub topic: String,
    /// Attempt number seen by the handler
    pub attempt: u32,
}

/// Ordered log of handler invocations.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    entries: Arc<Mutex<Vec<Invocation>>>,
}

impl InvocationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, job: &Job) {
        self.entries.lock().await.push(Invocation {
            job_id: job.id,
            topic: job.topic.clone(),
            attempt: job.attempt,
        });
    }

    /// All invocations in order.
    pub async fn entries(&self) -> Vec<Invocation> {
        self.entries.lock().await.clone()
    }

    /// Total number of invocations.
    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Invocations of `job_id`.
    pub async fn count_for(&self, job_id: JobId) -> usize {
        self.entries.lock().await.iter().filter(|i| i.job_id == job_id).count()
    }

    /// Invocation count per job.
    pub async fn counts(&self) -> HashMap<JobId, usize> {
        let mut counts = HashMap::new();
        for invocation in self.entries.lock().await.iter() {
            *counts.entry(invocation.job_id).or_insert(0) += 1;
        }
        counts
    }

    /// Job ids in the order they were first invoked.
    pub async fn order(&self) -> Vec<JobId> {
        let mut seen = Vec::new();
        for invocation in self.entries.lock().await.iter() {
            if !seen.contains(&invocation.job_id) {
                seen.push(invocation.job_id);
            }
        }
        seen
    }
}

/// What a [`ProbeHandler`] does with each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Return `Ok`.
    Succeed,
    /// Return a retryable error.
    FailRetryable,
    /// Return a permanent error.
    FailPermanent,
    /// Fail with a retryable error while `attempt <= n`, then succeed.
    FailTimes(u32),
    /// Panic.
    Panic,
}

/// Configurable handler that records its invocations and overlap.
#[derive(Debug, Clone)]
pub struct ProbeHandler {
    behaviour: Behaviour,
    delay: Option<Duration>,
    probe: ConcurrencyProbe,
    log: InvocationLog,
}

impl ProbeHandler {
    /// Handler with the given behaviour and no delay.
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: None,
            probe: ConcurrencyProbe::new(),
            log: InvocationLog::new(),
        }
    }

    /// Always succeeds.
    pub fn succeeding() -> Self {
        Self::new(Behaviour::Succeed)
    }

    /// Always fails with a retryable error.
    pub fn failing() -> Self {
        Self::new(Behaviour::FailRetryable)
    }

    /// Always fails with a permanent error.
    pub fn permanently_failing() -> Self {
        Self::new(Behaviour::FailPermanent)
    }

    /// Fails the first `times` attempts.
    pub fn flaky(times: u32) -> Self {
        Self::new(Behaviour::FailTimes(times))
    }

    /// Always panics.
    pub fn panicking() -> Self {
        Self::new(Behaviour::Panic)
    }

    /// Sleeps for `delay` before acting.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shares `probe` with other handlers, e.g. every topic of one rank.
    #[must_use]
    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Shares `log` with other handlers.
    #[must_use]
    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.log = log;
        self
    }

    /// The handler's concurrency probe.
    pub fn probe(&self) -> ConcurrencyProbe {
        self.probe.clone()
    }

    /// The handler's invocation log.
    pub fn log(&self) -> InvocationLog {
        self.log.clone()
    }
}

#[async_trait]
impl JobHandler for ProbeHandler {
    async fn process(&self, job: &Job) -> Result<(), HandlerError> {
        let _guard = self.probe.enter();
        self.log.record(job).await;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::FailRetryable => {
                Err(HandlerError::retryable(format!("attempt {} failed", job.attempt)))
            },
            Behaviour::FailPermanent => Err(HandlerError::permanent("rejected")),
            Behaviour::FailTimes(times) if job.attempt <= times => {
                Err(HandlerError::retryable(format!("attempt {} failed", job.attempt)))
            },
            Behaviour::FailTimes(_) => Ok(()),
            Behaviour::Panic => panic!("probe handler panicked on job {}", job.id),
        }
    }
}
