//! Demo topics run by the service binary.
//!
//! Two topics, `Room Type` on rank 1 and `Plan` on rank 2, whose handlers
//! sleep for a configurable time and log the job's arguments.

use std::time::Duration;

use jobqueue_core::models::{JobStats, NewJob, StatsFilter};
use jobqueue_manager::{handler_fn, HandlerError, Manager};
use tracing::info;

/// Topic of the room type demo jobs.
pub const ROOM_TYPE_TOPIC: &str = "Room Type";

/// Topic of the plan demo jobs.
pub const PLAN_TOPIC: &str = "Plan";

/// Registers a sleeping handler for every demo topic.
pub async fn register_topics(manager: &Manager, processing_time: Duration) {
    for topic in [ROOM_TYPE_TOPIC, PLAN_TOPIC] {
        manager
            .register(
                topic,
                handler_fn(move |job| async move {
                    tokio::time::sleep(processing_time).await;
                    info!(
                        job_id = %job.id,
                        topic = %job.topic,
                        rank = job.rank,
                        attempt = job.attempt,
                        args = ?job.args,
                        "Demo job processed"
                    );
                    Ok::<_, HandlerError>(())
                }),
            )
            .await;
    }
}

/// The jobs submitted on every run.
pub fn jobs() -> Vec<NewJob> {
    vec![
        NewJob::new(ROOM_TYPE_TOPIC).rank(1).max_retry(3).correlation_group("1").arg(640).arg(480),
        NewJob::new(PLAN_TOPIC).rank(2).max_retry(3).correlation_group("2").arg(111).arg(222),
    ]
}

/// Filter for the jobs whose progress decides whether workers start.
pub fn progress_filter() -> StatsFilter {
    StatsFilter::topic(PLAN_TOPIC).in_group("2")
}

/// Workers start only while no plan job is running or finished.
///
/// Another process may already be draining the queue, in which case this
/// one only submits.
pub fn should_start(stats: &JobStats) -> bool {
    stats.working == 0 && stats.succeeded + stats.failed == 0
}
