//! Rank pools: a fixed set of supervised workers serving one rank.
//!
//! The number of workers is the rank's concurrency limit. Each worker holds at
//! most one claimed job, so the limit holds without a separate semaphore.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{ManagerError, Result},
    worker::{JobWorker, WorkerContext},
};

/// Workers of one rank.
pub(crate) struct RankPool {
    rank: u32,
    worker_count: usize,
    context: WorkerContext,
    cancellation_token: CancellationToken,
    worker_handles: Vec<(usize, JoinHandle<()>)>,
}

impl RankPool {
    pub fn new(
        rank: u32,
        worker_count: usize,
        context: WorkerContext,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { rank, worker_count, context, cancellation_token, worker_handles: Vec::new() }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Spawns the pool's workers. Returns immediately.
    pub fn spawn_workers(&mut self) {
        info!(rank = self.rank, worker_count = self.worker_count, "spawning job workers");

        for worker_id in 0..self.worker_count {
            let worker = JobWorker::new(
                worker_id,
                self.rank,
                self.context.clone(),
                self.cancellation_token.clone(),
            );

            self.worker_handles.push((worker_id, tokio::spawn(async move { worker.run().await })));
        }
    }

    /// Cancels the workers and waits for in-flight jobs to be recorded.
    ///
    /// Handles are removed as their workers exit, so if this future is
    /// dropped early the pool still tracks the workers that are running and
    /// a later call resumes waiting for them.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::WorkerPanic` for the first worker task that
    /// terminated abnormally. All workers are joined regardless.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!(
            rank = self.rank,
            worker_count = self.worker_handles.len(),
            "shutting down rank pool"
        );

        self.cancellation_token.cancel();

        let mut first_error = None;
        while let Some((worker_id, handle)) = self.worker_handles.first_mut() {
            let worker_id = *worker_id;
            let joined = handle.await;
            self.worker_handles.remove(0);

            if let Err(join_error) = joined {
                error!(
                    rank = self.rank,
                    worker_id,
                    error = %join_error,
                    "worker task panicked during shutdown"
                );
                first_error.get_or_insert(ManagerError::WorkerPanic {
                    worker_id,
                    rank: self.rank,
                    error: join_error.to_string(),
                });
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Number of worker tasks still running.
    pub fn active_workers(&self) -> usize {
        self.worker_handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.active_workers() > 0
    }
}

impl Drop for RankPool {
    fn drop(&mut self) {
        let active = self.active_workers();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                rank = self.rank,
                active_workers = active,
                "rank pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
