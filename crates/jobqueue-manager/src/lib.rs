//! Persistent job queue manager with rank-partitioned worker pools.
//!
//! Callers register a handler per topic, submit jobs and start the manager.
//! Each configured rank gets its own pool of workers that claim queued jobs
//! from the store, run the topic's handler and record the outcome.
//!
//! # Architecture
//!
//! Workers claim jobs from PostgreSQL using `FOR UPDATE SKIP LOCKED`, so any
//! number of workers and processes can share one table without double
//! claims. Each worker runs the full job lifecycle:
//!
//! 1. **Claim** - the oldest due `queued` job of the worker's rank
//! 2. **Dispatch** - look up the topic handler and await it
//! 3. **Record** - mark the job succeeded, re-queue it or fail it
//!
//! A rank with concurrency `N` runs `N` workers, and a worker holds at most
//! one job, so no more than `N` jobs of that rank are claimed at once by one
//! manager.
//!
//! # Example
//!
//! ```no_run
//! use jobqueue_core::models::{NewJob, StatsFilter};
//! use jobqueue_manager::{handler_fn, HandlerError, Manager, ManagerConfig};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), jobqueue_manager::ManagerError> {
//! let mut manager = Manager::postgres(pool, ManagerConfig::default())?;
//! manager.register("Plan", handler_fn(|_job| async { Ok::<_, HandlerError>(()) })).await;
//!
//! manager.add(NewJob::new("Plan").correlation_group("2")).await?;
//! manager.start().await?;
//!
//! let stats = manager.stats(StatsFilter::topic("Plan")).await?;
//! println!("{} queued", stats.queued);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod storage;
mod worker;
mod worker_pool;

pub use config::{ManagerConfig, TopicScope};
pub use error::{HandlerError, ManagerError, Result};
pub use manager::Manager;
pub use registry::{handler_fn, FnHandler, JobHandler, TopicRegistry};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use storage::{JobStore, PostgresJobStore, StoreFuture};

/// Default number of workers for a rank.
pub const DEFAULT_CONCURRENCY: usize = 1;
