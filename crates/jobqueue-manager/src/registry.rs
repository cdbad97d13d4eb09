//! Topic registry mapping topic names to job handlers.
//!
//! Registration is last-write-wins and may happen while workers are running;
//! a worker resolves the handler when it claims a job, not when it starts.

use std::{collections::HashMap, fmt, future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use jobqueue_core::models::Job;
use tokio::sync::RwLock;

use crate::error::HandlerError;

/// Processor for the jobs of one topic.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use jobqueue_core::models::Job;
/// use jobqueue_manager::{HandlerError, JobHandler};
///
/// struct Resize;
///
/// #[async_trait]
/// impl JobHandler for Resize {
///     async fn process(&self, job: &Job) -> Result<(), HandlerError> {
///         let width: u32 = job.arg(0).ok_or_else(|| HandlerError::permanent("missing width"))?;
///         let _ = width;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Runs one attempt of `job`.
    async fn process(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wraps a closure taking an owned [`Job`] as a handler.
///
/// ```
/// use jobqueue_manager::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|job| async move {
///     tracing::info!(job_id = %job.id, "processing");
///     Ok::<_, HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f, _marker: PhantomData }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> Result<(), HandlerError> {
        (self.f)(job.clone()).await
    }
}

/// Shared map from topic to handler.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl TopicRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`, replacing any previous handler.
    pub async fn register(&self, topic: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().await.insert(topic.into(), handler);
    }

    /// Returns the handler for `topic`.
    pub async fn get(&self, topic: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(topic).cloned()
    }

    /// Whether `topic` has a handler.
    pub async fn contains(&self, topic: &str) -> bool {
        self.handlers.read().await.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of registered topics.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether no topic is registered.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.handlers.try_read().map(|h| h.len()).ok();
        f.debug_struct("TopicRegistry").field("topics", &topics).finish()
    }
}
