//! Test data builders with sensible defaults.

use chrono::{DateTime, Utc};
use jobqueue_core::models::{Job, JobId, JobStatus, NewJob};
use serde_json::Value;
use uuid::Uuid;

/// Builder for job submissions.
///
/// `with_defaults` picks a unique topic so tests sharing a store do not see
/// each other's jobs.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    topic: String,
    rank: u32,
    max_retry: u32,
    correlation_group: String,
    correlation_id: Option<String>,
    args: Vec<Value>,
}

impl JobBuilder {
    /// Creates a builder for `topic` with rank 0 and no retries.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            rank: 0,
            max_retry: 0,
            correlation_group: String::new(),
            correlation_id: None,
            args: Vec::new(),
        }
    }

    /// Creates a builder with a unique topic and correlation group.
    pub fn with_defaults() -> Self {
        Self::new(unique_topic("job")).correlation_group(format!("group_{}", Uuid::new_v4().simple()))
    }

    /// Sets the topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Sets the rank.
    #[must_use]
    pub fn rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Sets the correlation group.
    #[must_use]
    pub fn correlation_group(mut self, group: impl Into<String>) -> Self {
        self.correlation_group = group.into();
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Builds the submission.
    pub fn build(self) -> NewJob {
        let job = NewJob::new(self.topic)
            .rank(self.rank)
            .max_retry(self.max_retry)
            .correlation_group(self.correlation_group)
            .args(self.args);

        match self.correlation_id {
            Some(id) => job.correlation_id(id),
            None => job,
        }
    }

    /// Builds a stored job row in `status` with `attempt` runs so far.
    pub fn build_row(self, status: JobStatus, attempt: u32, now: DateTime<Utc>) -> Job {
        let mut job = Job::from_submission(JobId::new(), self.build(), now);
        job.status = status;
        job.attempt = attempt;
        if status != JobStatus::Queued {
            job.claimed_at = Some(now);
        }
        if status.is_terminal() {
            job.finished_at = Some(now);
        }
        job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Topic name with a random suffix.
pub fn unique_topic(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
