//! Core domain models and persistence for the job queue.
//!
//! Provides strongly-typed job primitives, lifecycle events, the clock
//! abstraction and the PostgreSQL repository. The manager crate builds its
//! worker pools on top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    EventHandler, HandlerMissingEvent, JobEvent, JobFailedEvent, JobRetryScheduledEvent,
    JobSucceededEvent, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    ClaimFilter, Job, JobId, JobStats, JobStatus, ListFilter, NewJob, Outcome, StatsFilter,
};
pub use time::{Clock, RealClock, TestClock};
