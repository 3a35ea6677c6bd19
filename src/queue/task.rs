//! Task types for the admission queue.
//!
//! [`QueuedTask`] is the type-erased unit the scheduler moves between the
//! class queues and the executor.  Callers never see it; they get a
//! [`TaskHandle<T>`] back from `enqueue` and await it for the typed result.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

// ---------------------------------------------------------------------------
// ResourceClass
// ---------------------------------------------------------------------------

/// The backend capacity a task competes for.  Each class has its own queue
/// and its own concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    Recognition,
    Synthesis,
    Generation,
    HealthCheck,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::Recognition,
        ResourceClass::Synthesis,
        ResourceClass::Generation,
        ResourceClass::HealthCheck,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ResourceClass::Recognition => "recognition",
            ResourceClass::Synthesis => "synthesis",
            ResourceClass::Generation => "generation",
            ResourceClass::HealthCheck => "health-check",
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority.  Higher priorities overtake queued (not yet started)
/// lower-priority tasks of the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

// ---------------------------------------------------------------------------
// TaskOptions
// ---------------------------------------------------------------------------

/// Per-task overrides.  Unset fields fall back to the class configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Cancelling this token removes the task from its queue (or aborts it
    /// if running) and resolves the handle with [`TaskError::Cancelled`].
    pub cancel: Option<CancellationToken>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

// ---------------------------------------------------------------------------
// QueuedTask
// ---------------------------------------------------------------------------

pub(crate) type AnyOutput = Box<dyn Any + Send>;
pub(crate) type WorkFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<AnyOutput, TaskError>> + Send + Sync>;
pub(crate) type Responder = oneshot::Sender<Result<AnyOutput, TaskError>>;

/// A unit of work owned by the queue from enqueue until it is settled.
pub struct QueuedTask {
    pub id: u64,
    pub class: ResourceClass,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub(crate) work: WorkFn,
    pub(crate) cancel: CancellationToken,
    pub(crate) responder: Responder,
}

impl QueuedTask {
    /// Settle the task.  A dropped handle is not an error.
    pub(crate) fn respond(self, result: Result<AnyOutput, TaskError>) {
        let _ = self.responder.send(result);
    }
}

impl std::fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Wrap a typed, re-callable work factory into the erased form the queue
/// stores.
pub(crate) fn erase<T, F, Fut>(work: F) -> WorkFn
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
{
    Arc::new(move || {
        let fut = work();
        async move { fut.await.map(|v| Box::new(v) as AnyOutput) }.boxed()
    })
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Future resolving to the task's final result once the queue settles it
/// (success, retries exhausted, or cancellation).
#[must_use = "a TaskHandle does nothing unless awaited"]
pub struct TaskHandle<T> {
    id: u64,
    rx: oneshot::Receiver<Result<AnyOutput, TaskError>>,
    _output: PhantomData<fn() -> T>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<Result<AnyOutput, TaskError>>) -> Self {
        Self {
            id,
            rx,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T: 'static> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(output))) => Poll::Ready(
                output
                    .downcast::<T>()
                    .map(|boxed| *boxed)
                    .map_err(|_| TaskError::Internal("task output type mismatch".into())),
            ),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            // Queue dropped without settling: treat as teardown.
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_low_to_critical() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn options_builder_sets_fields() {
        let opts = TaskOptions::new()
            .priority(Priority::High)
            .timeout(Duration::from_secs(3))
            .max_retries(0);
        assert_eq!(opts.priority, Some(Priority::High));
        assert_eq!(opts.timeout, Some(Duration::from_secs(3)));
        assert_eq!(opts.max_retries, Some(0));
        assert!(opts.cancel.is_none());
    }

    #[tokio::test]
    async fn handle_downcasts_output() {
        let (tx, rx) = oneshot::channel();
        let handle: TaskHandle<u32> = TaskHandle::new(7, rx);
        tx.send(Ok(Box::new(42u32) as AnyOutput)).unwrap();
        assert_eq!(handle.await, Ok(42));
    }

    #[tokio::test]
    async fn dropped_sender_resolves_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<AnyOutput, TaskError>>();
        let handle: TaskHandle<u32> = TaskHandle::new(1, rx);
        drop(tx);
        assert_eq!(handle.await, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn erased_work_is_recallable() {
        let work = erase(|| async { Ok::<_, TaskError>("done".to_string()) });
        for _ in 0..2 {
            let out = (work)().await.unwrap();
            assert_eq!(*out.downcast::<String>().unwrap(), "done");
        }
    }
}
