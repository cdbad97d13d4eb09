//! Manager configuration.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ManagerError, Result},
    retry::RetryPolicy,
};

/// Which topics a rank pool claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicScope {
    /// Claim every topic of the rank. Jobs without a handler fail.
    #[default]
    AnyTopic,
    /// Claim only topics with a registered handler. Jobs of other topics
    /// stay queued until a handler is registered.
    RegisteredTopics,
}

/// Configuration for the job manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Concurrency limit per rank. Ranks not listed, or listed with 0,
    /// are never processed.
    pub ranks: BTreeMap<u32, usize>,

    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,

    /// How long a worker backs off after a store error.
    pub error_backoff: Duration,

    /// Backoff between attempts of a failed job.
    pub retry_policy: RetryPolicy,

    /// On start, release claims older than this left by a crashed process.
    ///
    /// Managers sharing a table cannot tell a crashed peer's claim from a
    /// live one, so this must exceed the longest handler run. A shorter
    /// timeout re-queues jobs that are still running and they execute twice.
    pub stale_claim_timeout: Option<Duration>,

    /// Maximum time `stop` waits for in-flight jobs. `None` waits forever.
    pub shutdown_timeout: Option<Duration>,

    /// Which topics workers claim.
    pub topic_scope: TopicScope,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ranks: BTreeMap::from([(0, crate::DEFAULT_CONCURRENCY)]),
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            stale_claim_timeout: None,
            shutdown_timeout: None,
            topic_scope: TopicScope::default(),
        }
    }
}

impl ManagerConfig {
    /// Sets the concurrency limit of `rank`.
    #[must_use]
    pub fn concurrency(mut self, rank: u32, workers: usize) -> Self {
        self.ranks.insert(rank, workers);
        self
    }

    /// Total number of workers across all ranks.
    pub fn total_workers(&self) -> usize {
        self.ranks.values().sum()
    }

    /// Checks the configuration for values the worker loop cannot use.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ManagerError::configuration("poll_interval must be positive"));
        }
        if self.error_backoff.is_zero() {
            return Err(ManagerError::configuration("error_backoff must be positive"));
        }
        if self.stale_claim_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ManagerError::configuration(
                "stale_claim_timeout must be positive, it would release live claims",
            ));
        }
        if let Some(&rank) = self.ranks.keys().find(|rank| i32::try_from(**rank).is_err()) {
            return Err(ManagerError::configuration(format!("rank {rank} out of range")));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(ManagerError::configuration("jitter_factor must be between 0.0 and 1.0"));
        }
        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return Err(ManagerError::configuration("base_delay must not exceed max_delay"));
        }
        Ok(())
    }
}
