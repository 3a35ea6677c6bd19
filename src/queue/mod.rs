//! Priority admission queue.
//!
//! This module provides:
//! * [`AdmissionQueue`] — per-class bounded queues with concurrency caps,
//!   priority ordering, timeouts, retries and cancellation.
//! * [`TaskHandle`] — awaitable typed result of an admitted task.
//! * [`QueueStats`] — rolling counters and load figures.

pub mod admission;
pub mod stats;
pub mod task;

pub use admission::AdmissionQueue;
pub use stats::{ClassStats, QueueStats};
pub use task::{Priority, QueuedTask, ResourceClass, TaskHandle, TaskOptions};
