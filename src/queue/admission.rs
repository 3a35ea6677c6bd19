//! Priority admission queue with per-class concurrency caps.
//!
//! The queue decides *when* work may run; the connection pool decides *how*
//! a network call executes.  Each [`ResourceClass`] has a bounded queue and
//! an independent concurrency cap, both taken from [`QueueConfig`].
//!
//! # Flow
//!
//! ```text
//! enqueue ──full?──▶ Err(CapacityExceeded)             (synchronous, no blocking)
//!    │
//!    └─▶ insert by priority (desc), FIFO within a priority
//!
//! scheduler tick (every `scheduler_interval_ms`, or woken on enqueue)
//!    └─▶ per class: while in_flight < concurrency → pop head → spawn execute
//!
//! execute
//!    ├─ Ok                               → resolve handle
//!    ├─ retryable error, retries left    → backoff (slot held), push to *front*
//!    └─ otherwise / cancelled            → resolve handle with the error
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::stats::{load_percent, ClassStats, Counters, QueueStats, SampleWindow, SAMPLE_WINDOW};
use super::task::{erase, AnyOutput, QueuedTask, ResourceClass, TaskHandle, TaskOptions};
use crate::config::QueueConfig;
use crate::error::TaskError;
use crate::retry::backoff_delay;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<QueuedTask>,
    in_flight: usize,
    counters: Counters,
}

impl Lane {
    /// Insert after every task of equal or higher priority.
    fn insert_by_priority(&mut self, task: QueuedTask) {
        let pos = self
            .pending
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }
}

struct State {
    lanes: HashMap<ResourceClass, Lane>,
    wait_times: SampleWindow,
    processing_times: SampleWindow,
    closed: bool,
}

enum Settled {
    Completed,
    Failed,
    Cancelled,
}

struct Inner {
    config: QueueConfig,
    state: Mutex<State>,
    wake: Notify,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move runnable tasks out of their lanes, respecting each class's cap.
    fn take_runnable(&self) -> Vec<QueuedTask> {
        let mut ready = Vec::new();
        let mut cancelled = Vec::new();
        {
            let mut state = self.lock();
            let now = Instant::now();
            let State {
                lanes, wait_times, ..
            } = &mut *state;

            for class in ResourceClass::ALL {
                let cap = self.config.class(class).concurrency;
                let Some(lane) = lanes.get_mut(&class) else {
                    continue;
                };

                // Purge entries whose caller already gave up.
                if lane.pending.iter().any(|t| t.cancel.is_cancelled()) {
                    let (gone, keep): (VecDeque<_>, VecDeque<_>) =
                        lane.pending.drain(..).partition(|t| t.cancel.is_cancelled());
                    lane.pending = keep;
                    lane.counters.cancelled += gone.len() as u64;
                    cancelled.extend(gone);
                }

                while lane.in_flight < cap {
                    let Some(task) = lane.pending.pop_front() else {
                        break;
                    };
                    lane.in_flight += 1;
                    wait_times.push(now.saturating_duration_since(task.enqueued_at));
                    ready.push(task);
                }
            }
        }

        for task in cancelled {
            log::debug!("queue: dropping cancelled {} task #{}", task.class, task.id);
            task.respond(Err(TaskError::Cancelled));
        }
        ready
    }

    /// Release the in-flight slot of `class` and record how the attempt ended.
    fn settle(&self, class: ResourceClass, processing: Duration, how: Settled) {
        let mut state = self.lock();
        state.processing_times.push(processing);
        if let Some(lane) = state.lanes.get_mut(&class) {
            lane.in_flight = lane.in_flight.saturating_sub(1);
            match how {
                Settled::Completed => lane.counters.completed += 1,
                Settled::Failed => lane.counters.failed += 1,
                Settled::Cancelled => lane.counters.cancelled += 1,
            }
        }
        drop(state);
        self.wake.notify_one();
    }

    fn note_retry(&self, class: ResourceClass) {
        if let Some(lane) = self.lock().lanes.get_mut(&class) {
            lane.counters.retried += 1;
        }
    }

    /// Put a task that is about to be retried back at the head of its lane
    /// and only then give up its in-flight slot, so nothing queued behind
    /// it can start in between.
    fn requeue_front(&self, mut task: QueuedTask) {
        let mut state = self.lock();
        let closed = state.closed;
        let lane = state.lanes.entry(task.class).or_default();
        lane.in_flight = lane.in_flight.saturating_sub(1);
        if closed {
            lane.counters.cancelled += 1;
            drop(state);
            task.respond(Err(TaskError::Cancelled));
            return;
        }
        task.enqueued_at = Instant::now();
        lane.pending.push_front(task);
        drop(state);
        self.wake.notify_one();
    }
}

// ---------------------------------------------------------------------------
// AdmissionQueue
// ---------------------------------------------------------------------------

/// Process-wide priority admission queue.  Cheap to clone.
///
/// ```rust,no_run
/// use voice_relay::config::QueueConfig;
/// use voice_relay::queue::{AdmissionQueue, ResourceClass, TaskOptions};
///
/// # async fn example() -> Result<(), voice_relay::TaskError> {
/// let queue = AdmissionQueue::start(QueueConfig::default());
/// let answer: u32 = queue
///     .submit(ResourceClass::Generation, TaskOptions::new(), || async { Ok(42) })
///     .await?;
/// assert_eq!(answer, 42);
/// queue.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

impl AdmissionQueue {
    /// Create a queue without starting its scheduler.  Tasks are accepted but
    /// nothing runs until [`spawn_scheduler`](Self::spawn_scheduler).
    pub fn new(config: QueueConfig) -> Self {
        let lanes = ResourceClass::ALL
            .into_iter()
            .map(|class| (class, Lane::default()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    lanes,
                    wait_times: SampleWindow::new(SAMPLE_WINDOW),
                    processing_times: SampleWindow::new(SAMPLE_WINDOW),
                    closed: false,
                }),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Create a queue and start its scheduler.  Must be called inside a
    /// tokio runtime.
    pub fn start(config: QueueConfig) -> Self {
        let queue = Self::new(config);
        queue.spawn_scheduler();
        queue
    }

    /// Start the periodic scheduler.  Calling it twice is a no-op.
    pub fn spawn_scheduler(&self) {
        let mut slot = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(run_scheduler(inner)));
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Admit `work` into the queue of `class`.
    ///
    /// Fails immediately with [`TaskError::CapacityExceeded`] when the class
    /// queue is full.  `work` is called once per attempt, so it must be able
    /// to produce a fresh future for every retry.
    pub fn enqueue<T, F, Fut>(
        &self,
        class: ResourceClass,
        options: TaskOptions,
        work: F,
    ) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let policy = self.inner.config.class(class);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<Result<AnyOutput, TaskError>>();

        let task = QueuedTask {
            id,
            class,
            priority: options.priority.unwrap_or(policy.default_priority),
            enqueued_at: Instant::now(),
            timeout: options.timeout.unwrap_or_else(|| policy.timeout()),
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(policy.max_retries),
            work: erase(work),
            cancel: options.cancel.unwrap_or_default(),
            responder: tx,
        };

        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(TaskError::Cancelled);
            }
            let lane = state.lanes.entry(class).or_default();
            if lane.pending.len() >= policy.queue_capacity {
                lane.counters.rejected += 1;
                log::warn!(
                    "queue: {class} queue full ({}), rejecting task #{id}",
                    policy.queue_capacity
                );
                return Err(TaskError::CapacityExceeded(format!(
                    "{class} queue full ({})",
                    policy.queue_capacity
                )));
            }
            lane.insert_by_priority(task);
        }

        log::debug!("queue: admitted {class} task #{id}");
        self.inner.wake.notify_one();
        Ok(TaskHandle::new(id, rx))
    }

    /// [`enqueue`](Self::enqueue) and await the result.
    pub async fn submit<T, F, Fut>(
        &self,
        class: ResourceClass,
        options: TaskOptions,
        work: F,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        self.enqueue(class, options, work)?.await
    }

    /// Rolling statistics snapshot.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let classes: Vec<ClassStats> = ResourceClass::ALL
            .into_iter()
            .map(|class| {
                let policy = self.inner.config.class(class);
                let lane = state.lanes.get(&class);
                let pending = lane.map_or(0, |l| l.pending.len());
                let processing = lane.map_or(0, |l| l.in_flight);
                let c = lane.map(|l| l.counters).unwrap_or_default();
                ClassStats {
                    class,
                    pending,
                    processing,
                    completed: c.completed,
                    failed: c.failed,
                    rejected: c.rejected,
                    retried: c.retried,
                    cancelled: c.cancelled,
                    concurrency: policy.concurrency,
                    queue_capacity: policy.queue_capacity,
                    load_percent: load_percent(processing, policy.concurrency),
                }
            })
            .collect();

        let average_load_percent =
            classes.iter().map(|c| c.load_percent).sum::<f64>() / classes.len() as f64;

        QueueStats {
            avg_wait: state.wait_times.average(),
            avg_processing: state.processing_times.average(),
            high_load: average_load_percent > self.inner.config.high_load_threshold,
            average_load_percent,
            classes,
        }
    }

    /// `true` when the average class load exceeds the configured threshold.
    pub fn is_high_load(&self) -> bool {
        self.stats().high_load
    }

    /// Stop the scheduler, abort running attempts and resolve every pending
    /// task with [`TaskError::Cancelled`].  Later enqueues are refused.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<QueuedTask> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state
                .lanes
                .values_mut()
                .flat_map(|lane| {
                    lane.counters.cancelled += lane.pending.len() as u64;
                    lane.pending.drain(..).collect::<Vec<_>>()
                })
                .collect()
        };
        if !drained.is_empty() {
            log::info!("queue: shutdown cancelled {} pending tasks", drained.len());
        }
        for task in drained {
            task.respond(Err(TaskError::Cancelled));
        }
    }

    /// Wait for the scheduler task to exit after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let handle = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler and executor
// ---------------------------------------------------------------------------

async fn run_scheduler(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.scheduler_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            () = inner.wake.notified() => {}
        }

        for task in inner.take_runnable() {
            tokio::spawn(execute(Arc::clone(&inner), task));
        }
    }
    log::debug!("queue: scheduler stopped");
}

async fn execute(inner: Arc<Inner>, mut task: QueuedTask) {
    let class = task.class;
    let policy = inner.config.class(class);
    let started = Instant::now();
    let attempt = (task.work)();

    let outcome = tokio::select! {
        biased;
        () = task.cancel.cancelled() => Err(TaskError::Cancelled),
        () = inner.shutdown.cancelled() => Err(TaskError::Cancelled),
        result = tokio::time::timeout(task.timeout, attempt) => {
            result.unwrap_or(Err(TaskError::Timeout(task.timeout)))
        }
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(output) => {
            inner.settle(class, elapsed, Settled::Completed);
            task.respond(Ok(output));
        }
        Err(err) if err.is_retryable() && task.retry_count < task.max_retries => {
            // The slot stays held through the backoff.
            inner.note_retry(class);
            let delay = backoff_delay(
                task.retry_count,
                policy.retry_base_delay(),
                policy.retry_max_delay(),
            );
            task.retry_count += 1;
            log::warn!(
                "queue: {class} task #{} failed ({err}); retry {}/{} in {delay:?}",
                task.id,
                task.retry_count,
                task.max_retries
            );

            let abandoned = tokio::select! {
                () = task.cancel.cancelled() => true,
                () = inner.shutdown.cancelled() => true,
                () = tokio::time::sleep(delay) => false,
            };
            if abandoned {
                inner.settle(class, started.elapsed(), Settled::Cancelled);
                task.respond(Err(TaskError::Cancelled));
            } else {
                inner.requeue_front(task);
            }
        }
        Err(TaskError::Cancelled) => {
            inner.settle(class, elapsed, Settled::Cancelled);
            task.respond(Err(TaskError::Cancelled));
        }
        Err(err) => {
            log::warn!(
                "queue: {class} task #{} failed after {} attempt(s): {err}",
                task.id,
                task.retry_count + 1
            );
            inner.settle(class, elapsed, Settled::Failed);
            task.respond(Err(err));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
