//! Retry decisions and backoff timing for failed jobs.
//!
//! Whether a job is retried depends only on the handler error and the job's
//! own retry budget. The policy decides *when* a re-queued job becomes
//! claimable again; the default re-queues it for immediate pickup.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobqueue_core::models::Job;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Backoff applied between attempts of the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Strategy for calculating delays.
    pub backoff: BackoffStrategy,

    /// Base delay for the strategy.
    pub base_delay: Duration,

    /// Upper bound on any delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::Immediate,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Re-queued jobs are claimable at once.
    #[default]
    Immediate,
    /// Fixed delay between attempts.
    Fixed,
    /// Delay grows by the base amount each attempt.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

/// What to do with a job whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back in the queue.
    Retry {
        /// Earliest next claim, `None` for immediately
        not_before: Option<DateTime<Utc>>,
    },
    /// Fail the job.
    GiveUp {
        /// Why the job is not retried
        reason: String,
    },
}

impl RetryPolicy {
    /// Policy with exponential backoff and ±25% jitter.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self { backoff: BackoffStrategy::Exponential, base_delay, max_delay, jitter_factor: 0.25 }
    }

    /// Decides the fate of `job` after its handler returned `error`.
    ///
    /// `job.attempt` already counts the failed run.
    pub fn decide(&self, job: &Job, error: &HandlerError, failed_at: DateTime<Utc>) -> RetryDecision {
        if !error.retryable {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if !job.can_retry() {
            return RetryDecision::GiveUp {
                reason: format!("maximum retries ({}) exhausted", job.max_retry),
            };
        }

        let not_before = self.delay(job.attempt).and_then(|delay| {
            chrono::Duration::from_std(delay).ok().map(|delay| failed_at + delay)
        });

        RetryDecision::Retry { not_before }
    }

    /// Delay before the attempt after `attempt` (1-based), or `None` for
    /// immediate retry.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        let base_delay = match self.backoff {
            BackoffStrategy::Immediate => return None,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped_delay = base_delay.min(self.max_delay);
        let jittered_delay = apply_jitter(capped_delay, self.jitter_factor);

        Some(jittered_delay.min(self.max_delay))
    }
}

/// Randomizes `duration` by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}
