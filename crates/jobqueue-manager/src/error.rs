//! Error types for manager and handler operations.
//!
//! `ManagerError` is what callers of the [`Manager`](crate::Manager) see.
//! `HandlerError` is what topic handlers return; its `retryable` flag decides
//! whether a failure consumes an attempt and re-queues or fails the job.

use std::time::Duration;

use jobqueue_core::CoreError;
use thiserror::Error;

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors surfaced by the job manager.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    /// Submission rejected before reaching the store.
    #[error("invalid job: {reason}")]
    InvalidJob {
        /// Which constraint the submission violated
        reason: String,
    },

    /// The store could not be reached or rejected the operation.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Underlying store error
        message: String,
    },

    /// A claimed job had no registered handler.
    #[error("no handler registered for topic {topic:?}")]
    HandlerMissing {
        /// Topic of the job
        topic: String,
    },

    /// A handler returned an error or panicked.
    #[error("handler failed: {message}")]
    HandlerFailure {
        /// Handler error message
        message: String,
    },

    /// `start` called on a running manager.
    #[error("manager already started")]
    AlreadyStarted,

    /// `stop` called on a manager that is not running.
    #[error("manager not started")]
    NotStarted,

    /// Workers did not finish within the configured shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured timeout
        timeout: Duration,
    },

    /// Workers from a timed out `stop` are still finishing their jobs.
    #[error("{active_workers} workers from the previous run are still stopping")]
    StillStopping {
        /// Worker tasks that have not exited yet
        active_workers: usize,
    },

    /// A worker task terminated abnormally.
    #[error("worker {worker_id} of rank {rank} panicked: {error}")]
    WorkerPanic {
        /// Worker index within its pool
        worker_id: usize,
        /// Rank served by the worker
        rank: u32,
        /// Join error message
        error: String,
    },

    /// Manager configuration is invalid.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },
}

impl ManagerError {
    /// Creates an invalid job error.
    pub fn invalid_job(reason: impl Into<String>) -> Self {
        Self::InvalidJob { reason: reason.into() }
    }

    /// Creates a store unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Creates a handler missing error.
    pub fn handler_missing(topic: impl Into<String>) -> Self {
        Self::HandlerMissing { topic: topic.into() }
    }

    /// Creates a handler failure error.
    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self::HandlerFailure { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. }
            | Self::HandlerFailure { .. }
            | Self::StillStopping { .. } => true,

            Self::InvalidJob { .. }
            | Self::HandlerMissing { .. }
            | Self::AlreadyStarted
            | Self::NotStarted
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Configuration { .. } => false,
        }
    }
}

impl From<CoreError> for ManagerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(reason) | CoreError::ConstraintViolation(reason) => {
                Self::InvalidJob { reason }
            },
            CoreError::Unavailable(_) | CoreError::Database(_) | CoreError::NotFound(_) => {
                Self::StoreUnavailable { message: err.to_string() }
            },
        }
    }
}

/// Error returned by a topic handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Failure description recorded on the job.
    pub message: String,

    /// Whether the job may be retried if budget remains.
    pub retryable: bool,
}

impl HandlerError {
    /// A failure that consumes one attempt and re-queues while budget remains.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    /// A failure that fails the job regardless of remaining budget.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::retryable(message)
    }
}
