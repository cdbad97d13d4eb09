//! End-to-end manager behaviour against the in-memory store.
//!
//! Covers submission, the retry budget, rank concurrency limits, missing
//! handlers, statistics and graceful shutdown.

use std::time::Duration;

use anyhow::Result;
use jobqueue_core::models::{JobStats, JobStatus, StatsFilter};
use jobqueue_manager::{ManagerError, TopicScope};
use jobqueue_testing::{
    unique_topic, ConcurrencyProbe, Invariants, JobBuilder, ProbeHandler, TestEnv,
};

#[tokio::test]
async fn add_then_stats_reports_one_more_queued() -> Result<()> {
    let env = TestEnv::new();
    let manager = env.manager()?;
    let topic = unique_topic("Plan");
    let filter = StatsFilter::topic(&topic).in_group("2");

    let before = manager.stats(filter.clone()).await?;
    manager.add(JobBuilder::new(&topic).correlation_group("2").build()).await?;
    let after = manager.stats(filter).await?;

    assert_eq!(after.queued, before.queued + 1);
    assert_eq!(after.working, before.working);
    assert_eq!(after.succeeded, before.succeeded);
    assert_eq!(after.failed, before.failed);
    Ok(())
}

#[tokio::test]
async fn invalid_submission_is_rejected_synchronously() -> Result<()> {
    let env = TestEnv::new();
    let manager = env.manager()?;

    let err = manager.add(JobBuilder::new("").build()).await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidJob { .. }));

    let err = manager.add(JobBuilder::new("Plan").rank(u32::MAX).build()).await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidJob { .. }));

    assert!(env.mock().jobs().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn always_failing_handler_exhausts_retry_budget() -> Result<()> {
    let env = TestEnv::new();
    let mut manager = env.manager()?;
    let handler = ProbeHandler::failing();
    let log = handler.log();
    manager.register("A", handler).await;

    let id = manager
        .add(JobBuilder::new("A").rank(0).max_retry(2).correlation_group("g1").build())
        .await?;
    manager.start().await?;
    let jobs = env.wait_for_terminal(&[id]).await?;
    manager.stop().await?;

    let job = &jobs[0];
    assert_eq!(job.attempt, 3);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("attempt 3 failed"));
    assert_eq!(log.count_for(id).await, 3);

    let stats = manager.stats(StatsFilter::topic("A")).await?;
    assert_eq!(stats, JobStats { queued: 0, working: 0, succeeded: 0, failed: 1 });
    Ok(())
}

#[tokio::test]
async fn handler_invocations_never_exceed_budget() -> Result<()> {
    let env = TestEnv::builder().concurrency(0, 4).build();
    let mut manager = env.manager()?;
    let topic = unique_topic("flaky");
    let handler = ProbeHandler::flaky(3);
    let log = handler.log();
    manager.register(&topic, handler).await;

    let mut ids = Vec::new();
    for max_retry in 0..6 {
        ids.push(manager.add(JobBuilder::new(&topic).max_retry(max_retry).build()).await?);
    }
    manager.start().await?;
    let jobs = env.wait_for_terminal(&ids).await?;
    manager.stop().await?;

    Invariants::invocations_bounded(&jobs, &log.counts().await)?;
    for job in &jobs {
        Invariants::retry_count_bounded(job)?;
        Invariants::lifecycle_consistent(job)?;
        let expected = if job.max_retry >= 3 { JobStatus::Succeeded } else { JobStatus::Failed };
        assert_eq!(job.status, expected, "job with max_retry {}", job.max_retry);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_double_claim() -> Result<()> {
    let env = TestEnv::builder().concurrency(0, 8).build();
    let mut manager = env.manager()?;
    let topic = unique_topic("resize");
    let handler = ProbeHandler::succeeding().with_delay(Duration::from_millis(1));
    let log = handler.log();
    manager.register(&topic, handler).await;

    let mut ids = Vec::new();
    for _ in 0..50 {
        ids.push(manager.add(JobBuilder::new(&topic).build()).await?);
    }
    manager.start().await?;
    let jobs = env.wait_for_terminal(&ids).await?;
    manager.stop().await?;

    let counts = log.counts().await;
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt, 1);
        assert_eq!(counts.get(&job.id), Some(&1), "job {} processed more than once", job.id);
    }
    Ok(())
}

#[tokio::test]
async fn rank_limit_of_one_serialises_sleeping_jobs() -> Result<()> {
    let env = TestEnv::builder().concurrency(0, 1).build();
    let mut manager = env.manager()?;
    let handler = ProbeHandler::succeeding().with_delay(Duration::from_millis(50));
    let probe = handler.probe();
    manager.register("sleep", handler).await;

    let first = manager.add(JobBuilder::new("sleep").rank(0).build()).await?;
    let second = manager.add(JobBuilder::new("sleep").rank(0).build()).await?;
    manager.start().await?;
    env.wait_for_terminal(&[first, second]).await?;
    manager.stop().await?;

    assert_eq!(probe.max_observed(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rank_limits_are_independent() -> Result<()> {
    let env = TestEnv::builder().concurrency(0, 0).concurrency(1, 3).concurrency(2, 1).build();
    let mut manager = env.manager()?;

    let rank_one = ConcurrencyProbe::new();
    let rank_two = ConcurrencyProbe::new();
    let delay = Duration::from_millis(20);
    manager
        .register("one", ProbeHandler::succeeding().with_delay(delay).with_probe(rank_one.clone()))
        .await;
    manager
        .register("two", ProbeHandler::succeeding().with_delay(delay).with_probe(rank_two.clone()))
        .await;

    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(manager.add(JobBuilder::new("one").rank(1).build()).await?);
        ids.push(manager.add(JobBuilder::new("two").rank(2).build()).await?);
    }
    let disabled = manager.add(JobBuilder::new("one").rank(0).build()).await?;

    manager.start().await?;
    env.wait_for_terminal(&ids).await?;
    manager.stop().await?;

    Invariants::concurrency_within_limit(rank_one.max_observed(), 3)?;
    Invariants::concurrency_within_limit(rank_two.max_observed(), 1)?;
    assert_eq!(env.job(disabled).await?.status, JobStatus::Queued);
    Ok(())
}

#[tokio::test]
async fn missing_handler_fails_without_consuming_attempt() -> Result<()> {
    let env = TestEnv::new();
    let mut manager = env.manager()?;
    let id = manager.add(JobBuilder::new("unregistered").max_retry(5).build()).await?;
    let before = env.job(id).await?;

    manager.start().await?;
    let after = env.wait_for_terminal(&[id]).await?.remove(0);
    manager.stop().await?;

    Invariants::handler_missing_preserves_attempt(&before, &after)?;
    assert_eq!(after.attempt, 0);
    assert!(after.last_error.as_deref().is_some_and(|e| e.contains("no handler registered")));
    assert!(after.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn registered_scope_waits_for_late_registration() -> Result<()> {
    let env = TestEnv::builder().topic_scope(TopicScope::RegisteredTopics).build();
    let mut manager = env.manager()?;
    let id = manager.add(JobBuilder::new("late").build()).await?;

    manager.start().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(env.job(id).await?.status, JobStatus::Queued);

    manager.register("late", ProbeHandler::succeeding()).await;
    let job = env.wait_for_terminal(&[id]).await?.remove(0);
    manager.stop().await?;

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt, 1);
    Ok(())
}

#[tokio::test]
async fn stats_are_idempotent_and_filtered() -> Result<()> {
    let env = TestEnv::new();
    let manager = env.manager()?;
    let topic = unique_topic("Room Type");
    for group in ["1", "1", "2"] {
        manager.add(JobBuilder::new(&topic).correlation_group(group).build()).await?;
    }

    let first = manager.stats(StatsFilter::topic(&topic)).await?;
    let second = manager.stats(StatsFilter::topic(&topic)).await?;
    assert_eq!(first, second);
    assert_eq!(first.queued, 3);

    let group = manager.stats(StatsFilter::topic(&topic).in_group("1")).await?;
    assert_eq!(group.queued, 2);

    let none = manager.stats(StatsFilter::topic(unique_topic("nothing"))).await?;
    assert_eq!(none, JobStats::default());

    Invariants::stats_match(&env.jobs_for_topic(&topic).await?, &first)?;
    Ok(())
}

#[tokio::test]
async fn stop_returns_after_in_flight_outcome_is_persisted() -> Result<()> {
    let env = TestEnv::new();
    let mut manager = env.manager()?;
    let handler = ProbeHandler::succeeding().with_delay(Duration::from_millis(200));
    let probe = handler.probe();
    manager.register("slow", handler).await;
    let id = manager.add(JobBuilder::new("slow").build()).await?;

    manager.start().await?;
    env.wait_until("handler to start", || {
        let probe = probe.clone();
        async move { anyhow::Ok(probe.current() == 1) }
    })
    .await?;
    manager.stop().await?;

    assert_eq!(probe.current(), 0);
    assert_eq!(env.job(id).await?.status, JobStatus::Succeeded);
    assert!(!manager.has_active_workers());
    Ok(())
}

#[tokio::test]
async fn shutdown_timeout_is_reported() -> Result<()> {
    let env = TestEnv::builder().shutdown_timeout(Duration::from_millis(20)).build();
    let mut manager = env.manager()?;
    let handler = ProbeHandler::succeeding().with_delay(Duration::from_millis(500));
    let probe = handler.probe();
    manager.register("stuck", handler).await;
    manager.add(JobBuilder::new("stuck").build()).await?;

    manager.start().await?;
    env.wait_until("handler to start", || {
        let probe = probe.clone();
        async move { anyhow::Ok(probe.current() == 1) }
    })
    .await?;

    let err = manager.stop().await.unwrap_err();
    assert!(matches!(err, ManagerError::ShutdownTimeout { .. }));
    assert!(!manager.is_running());
    Ok(())
}

#[tokio::test]
async fn restart_after_shutdown_timeout_respects_rank_limit() -> Result<()> {
    let env = TestEnv::builder()
        .concurrency(0, 1)
        .shutdown_timeout(Duration::from_millis(20))
        .build();
    let mut manager = env.manager()?;
    let handler = ProbeHandler::succeeding().with_delay(Duration::from_millis(300));
    let probe = handler.probe();
    manager.register("slow", handler).await;
    let first = manager.add(JobBuilder::new("slow").build()).await?;
    let second = manager.add(JobBuilder::new("slow").build()).await?;

    manager.start().await?;
    env.wait_until("first job to start", || {
        let probe = probe.clone();
        async move { anyhow::Ok(probe.current() == 1) }
    })
    .await?;

    let err = manager.stop().await.unwrap_err();
    assert!(matches!(err, ManagerError::ShutdownTimeout { .. }));
    assert!(manager.has_active_workers());

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, ManagerError::StillStopping { active_workers: 1 }));
    assert!(err.is_retryable());
    assert!(!manager.is_running());

    // A second stop resumes waiting for the timed out worker.
    while manager.has_active_workers() {
        match manager.stop().await {
            Ok(()) => break,
            Err(ManagerError::ShutdownTimeout { .. }) => {},
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(env.job(first).await?.status, JobStatus::Succeeded);
    assert_eq!(env.job(second).await?.status, JobStatus::Queued);

    manager.start().await?;
    env.wait_for_terminal(&[second]).await?;
    manager.stop().await?;

    assert_eq!(probe.max_observed(), 1);
    Ok(())
}

#[tokio::test]
async fn stopped_manager_can_restart() -> Result<()> {
    let env = TestEnv::new();
    let mut manager = env.manager()?;
    manager.register("Plan", ProbeHandler::succeeding()).await;

    manager.start().await?;
    manager.stop().await?;

    let id = manager.add(JobBuilder::new("Plan").build()).await?;
    assert_eq!(env.job(id).await?.status, JobStatus::Queued);

    manager.start().await?;
    env.wait_for_terminal(&[id]).await?;
    manager.stop().await?;

    assert_eq!(env.job(id).await?.status, JobStatus::Succeeded);
    Ok(())
}

#[tokio::test]
async fn unreachable_store_fails_add_start_and_stats() -> Result<()> {
    let env = TestEnv::new();
    let mut manager = env.manager()?;
    env.mock().set_unavailable(true);

    let err = manager.add(JobBuilder::new("Plan").build()).await.unwrap_err();
    assert!(matches!(err, ManagerError::StoreUnavailable { .. }));
    assert!(matches!(manager.start().await, Err(ManagerError::StoreUnavailable { .. })));
    assert!(matches!(
        manager.stats(StatsFilter::all()).await,
        Err(ManagerError::StoreUnavailable { .. })
    ));
    assert!(!manager.is_running());

    env.mock().set_unavailable(false);
    manager.start().await?;
    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn lookups_by_id_and_correlation_id() -> Result<()> {
    let env = TestEnv::new();
    let manager = env.manager()?;

    let id = manager
        .add(
            JobBuilder::new("Room Type")
                .rank(1)
                .correlation_id("room-1")
                .arg(640)
                .arg(480)
                .build(),
        )
        .await?;

    let job = manager.lookup_by_correlation_id("room-1").await?.expect("job by correlation id");
    assert_eq!(job.id, id);
    assert_eq!(job.arg::<u32>(0), Some(640));
    assert_eq!(job.arg::<u32>(1), Some(480));
    assert!(manager.lookup_by_correlation_id("room-2").await?.is_none());

    let err = manager.add(JobBuilder::new("Room Type").correlation_id("room-1").build()).await;
    assert!(matches!(err, Err(ManagerError::InvalidJob { .. })));
    Ok(())
}
