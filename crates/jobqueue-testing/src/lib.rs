//! Test infrastructure for the job queue.
//!
//! Provides a [`TestEnv`] wiring managers to an in-memory or PostgreSQL store
//! with a deterministic clock, probe handlers that record invocations and
//! overlap, fixture builders, and invariant checks with proptest strategies.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod env;
pub mod fixtures;
pub mod handlers;
pub mod invariants;

pub use database::TestDatabase;
pub use env::{TestEnv, TestEnvBuilder, WAIT_TIMEOUT};
pub use fixtures::{unique_topic, JobBuilder};
pub use handlers::{Behaviour, ConcurrencyProbe, Invocation, InvocationLog, ProbeHandler};
pub use invariants::{strategies, Invariants};
pub use jobqueue_core::{Clock, TestClock};
