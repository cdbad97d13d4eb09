//! Job lifecycle events for decoupled observers.
//!
//! Workers emit an event after every completion they persist. Observers such
//! as audit logs or test probes subscribe through [`EventHandler`] without the
//! worker knowing about them.
//!
//! ```text
//!                    Succeeded / Retry / Failed / HandlerMissing
//! ┌─────────────────┐                        ┌────────────────────┐
//! │ JobWorker       │ ──────────────────────▶│ MulticastHandler   │
//! └─────────────────┘                        └────────────────────┘
//!                                                      │
//!                                                      ▼
//!                                               subscribers
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::JobId;

/// Events emitted by workers after a claimed job is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Handler succeeded.
    Succeeded(JobSucceededEvent),

    /// Handler failed and the job was re-queued.
    RetryScheduled(JobRetryScheduledEvent),

    /// Handler failed terminally.
    Failed(JobFailedEvent),

    /// No handler was registered for the topic.
    HandlerMissing(HandlerMissingEvent),
}

impl JobEvent {
    /// Job the event refers to.
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Succeeded(e) => e.job_id,
            Self::RetryScheduled(e) => e.job_id,
            Self::Failed(e) => e.job_id,
            Self::HandlerMissing(e) => e.job_id,
        }
    }

    /// Topic of the job the event refers to.
    pub fn topic(&self) -> &str {
        match self {
            Self::Succeeded(e) => &e.topic,
            Self::RetryScheduled(e) => &e.topic,
            Self::Failed(e) => &e.topic,
            Self::HandlerMissing(e) => &e.topic,
        }
    }
}

/// Event emitted when a handler succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSucceededEvent {
    /// ID of the job.
    pub job_id: JobId,

    /// Topic of the job.
    pub topic: String,

    /// Rank of the job.
    pub rank: u32,

    /// Attempt that succeeded (1-based).
    pub attempt: u32,

    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
}

/// Event emitted when a failed job is put back in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRetryScheduledEvent {
    /// ID of the job.
    pub job_id: JobId,

    /// Topic of the job.
    pub topic: String,

    /// Attempt that failed (1-based).
    pub attempt: u32,

    /// Handler error message.
    pub error_message: String,

    /// Earliest time of the next claim, if delayed.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Event emitted when a job fails terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailedEvent {
    /// ID of the job.
    pub job_id: JobId,

    /// Topic of the job.
    pub topic: String,

    /// Attempt that failed (1-based).
    pub attempt: u32,

    /// Handler error message.
    pub error_message: String,

    /// Whether the handler reported the error as retryable.
    pub retryable: bool,

    /// When the outcome was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Event emitted when a claimed job has no registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerMissingEvent {
    /// ID of the job.
    pub job_id: JobId,

    /// Topic without a handler.
    pub topic: String,

    /// When the outcome was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Trait for observing job events.
///
/// Implementations must not block: the emitting worker awaits the call before
/// claiming its next job.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a job event.
    async fn handle_event(&self, event: JobEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: JobEvent) {}
}

/// Forwards every event to all subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: JobEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        event_count: Arc<AtomicUsize>,
    }

    impl CountingHandler {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let counter = Arc::new(AtomicUsize::new(0));
            (Self { event_count: counter.clone() }, counter)
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: JobEvent) {
            self.event_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn succeeded_event() -> JobEvent {
        JobEvent::Succeeded(JobSucceededEvent {
            job_id: JobId::new(),
            topic: "Plan".to_string(),
            rank: 1,
            attempt: 1,
            finished_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_subscribers() {
        let mut multicast = MulticastEventHandler::new();
        let (first, first_count) = CountingHandler::new();
        let (second, second_count) = CountingHandler::new();
        multicast.add_subscriber(Arc::new(first));
        multicast.add_subscriber(Arc::new(second));
        assert_eq!(multicast.subscriber_count(), 2);

        multicast.handle_event(succeeded_event()).await;

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_multicast_and_no_op_accept_events() {
        MulticastEventHandler::new().handle_event(succeeded_event()).await;
        NoOpEventHandler::new().handle_event(succeeded_event()).await;
    }

    #[test]
    fn accessors_cover_every_variant() {
        let id = JobId::new();
        let event = JobEvent::HandlerMissing(HandlerMissingEvent {
            job_id: id,
            topic: "Room Type".to_string(),
            failed_at: Utc::now(),
        });
        assert_eq!(event.job_id(), id);
        assert_eq!(event.topic(), "Room Type");
    }
}
