//! Invariant checks over job rows and observed worker behaviour.
//!
//! Every check returns `anyhow::Result` so tests can `?` them and get a
//! description of the violating job.

use std::collections::HashMap;

use anyhow::{ensure, Context, Result};
use jobqueue_core::models::{Job, JobId, JobStats, JobStatus};

/// Properties that must hold for every job and every run.
pub struct Invariants;

impl Invariants {
    /// `attempt` never exceeds `max_retry + 1`.
    pub fn retry_count_bounded(job: &Job) -> Result<()> {
        ensure!(
            job.attempt <= job.max_retry.saturating_add(1),
            "job {} exceeded its retry budget: attempt {} > {}",
            job.id,
            job.attempt,
            job.max_retry.saturating_add(1)
        );
        Ok(())
    }

    /// A handler ran at most `max_retry + 1` times for each job.
    pub fn invocations_bounded(jobs: &[Job], invocations: &HashMap<JobId, usize>) -> Result<()> {
        for job in jobs {
            let count = invocations.get(&job.id).copied().unwrap_or(0);
            let budget = job.max_retry as usize + 1;
            ensure!(
                count <= budget,
                "handler invoked {count} times for job {} with budget {budget}",
                job.id
            );
        }
        Ok(())
    }

    /// Timestamps agree with status.
    pub fn lifecycle_consistent(job: &Job) -> Result<()> {
        match job.status {
            JobStatus::Queued => {
                ensure!(job.claimed_at.is_none(), "queued job {} has claimed_at", job.id);
                ensure!(job.finished_at.is_none(), "queued job {} has finished_at", job.id);
            },
            JobStatus::Claimed => {
                ensure!(job.claimed_at.is_some(), "claimed job {} lacks claimed_at", job.id);
                ensure!(job.attempt >= 1, "claimed job {} has attempt 0", job.id);
            },
            JobStatus::Succeeded | JobStatus::Failed => {
                ensure!(job.finished_at.is_some(), "terminal job {} lacks finished_at", job.id);
            },
        }
        Ok(())
    }

    /// Every submitted job still exists in the store.
    pub fn no_lost_jobs(submitted: &[JobId], stored: &[Job]) -> Result<()> {
        for id in submitted {
            stored
                .iter()
                .find(|job| job.id == *id)
                .with_context(|| format!("job {id} disappeared from the store"))?;
        }
        Ok(())
    }

    /// Every job reached `succeeded` or `failed`.
    pub fn all_terminal(jobs: &[Job]) -> Result<()> {
        for job in jobs {
            ensure!(job.is_terminal(), "job {} still {}", job.id, job.status);
        }
        Ok(())
    }

    /// A terminal job did not change after it became terminal.
    pub fn terminal_unchanged(before: &Job, after: &Job) -> Result<()> {
        if !before.is_terminal() {
            return Ok(());
        }
        ensure!(
            before.status == after.status
                && before.attempt == after.attempt
                && before.finished_at == after.finished_at,
            "terminal job {} changed from {} to {}",
            before.id,
            before.status,
            after.status
        );
        Ok(())
    }

    /// A job failed for a missing handler kept its pre-claim attempt count.
    pub fn handler_missing_preserves_attempt(before: &Job, after: &Job) -> Result<()> {
        ensure!(after.status == JobStatus::Failed, "job {} is {}, not failed", after.id, after.status);
        ensure!(
            after.attempt == before.attempt,
            "job {} attempt changed from {} to {}",
            after.id,
            before.attempt,
            after.attempt
        );
        Ok(())
    }

    /// Observed overlap stayed within the rank's limit.
    pub fn concurrency_within_limit(observed: usize, limit: usize) -> Result<()> {
        ensure!(observed <= limit, "observed {observed} concurrent jobs with limit {limit}");
        Ok(())
    }

    /// Reported counts equal the counts recomputed from the rows.
    pub fn stats_match(jobs: &[Job], stats: &JobStats) -> Result<()> {
        let mut expected = JobStats::default();
        for job in jobs {
            expected.record(job.status);
        }
        ensure!(expected == *stats, "stats {stats:?} do not match rows {expected:?}");
        Ok(())
    }

    /// Jobs of one topic and rank were first dispatched in creation order.
    pub fn fifo_dispatch(order: &[JobId], jobs: &[Job]) -> Result<()> {
        let created: HashMap<JobId, _> = jobs.iter().map(|j| (j.id, (j.created_at, j.id))).collect();
        for pair in order.windows(2) {
            let first = created.get(&pair[0]).context("unknown job in dispatch order")?;
            let second = created.get(&pair[1]).context("unknown job in dispatch order")?;
            ensure!(first <= second, "job {} dispatched before older job {}", pair[0], pair[1]);
        }
        Ok(())
    }
}

/// Property-based test strategies for job types.
pub mod strategies {
    use chrono::{TimeZone, Utc};
    use jobqueue_core::models::{Job, JobId, JobStatus, NewJob};
    use proptest::{
        collection::vec,
        option,
        prelude::{any, prop_oneof, Just, Strategy},
        string::string_regex,
    };
    use uuid::Uuid;

    /// Valid topic names.
    pub fn topic_strategy() -> impl Strategy<Value = String> {
        string_regex("[A-Za-z][A-Za-z0-9 _-]{0,40}").unwrap()
    }

    /// Any job status.
    pub fn job_status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Queued),
            Just(JobStatus::Claimed),
            Just(JobStatus::Succeeded),
            Just(JobStatus::Failed),
        ]
    }

    /// Valid submissions.
    pub fn new_job_strategy() -> impl Strategy<Value = NewJob> {
        (
            topic_strategy(),
            0u32..8,
            0u32..10,
            option::of(string_regex("[a-z0-9]{1,8}").unwrap()),
            vec(any::<i64>(), 0..4),
        )
            .prop_map(|(topic, rank, max_retry, group, args)| {
                NewJob::new(topic)
                    .rank(rank)
                    .max_retry(max_retry)
                    .correlation_group(group.unwrap_or_default())
                    .args(args.into_iter().map(Into::into).collect())
            })
    }

    /// Stored rows whose attempt respects their budget.
    pub fn job_row_strategy() -> impl Strategy<Value = Job> {
        (new_job_strategy(), job_status_strategy(), any::<[u8; 16]>(), 0i64..1_000_000)
            .prop_flat_map(|(submission, status, id, created)| {
                let budget = submission.max_retry + 1;
                (Just((submission, status, id, created)), 0..=budget)
            })
            .prop_map(|((submission, status, id, created), attempt)| {
                let now = Utc.timestamp_opt(1_700_000_000 + created, 0).single().unwrap_or_default();
                let mut job = Job::from_submission(JobId(Uuid::from_bytes(id)), submission, now);
                job.status = status;
                job.attempt = attempt;
                if status != JobStatus::Queued {
                    job.claimed_at = Some(now);
                    job.attempt = attempt.max(1);
                }
                if status.is_terminal() {
                    job.finished_at = Some(now);
                }
                job
            })
    }
}
