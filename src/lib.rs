//! Voice conversation orchestration core.
//!
//! Turns a recorded utterance into a spoken reply through three remote
//! services (recognition, generation, synthesis), under bounded
//! concurrency, with caching and ordered playback:
//!
//! * [`queue`] — per-class priority admission with retries and timeouts.
//! * [`pool`] — per-host connection reuse under a global ceiling.
//! * [`cache`] — memory-bounded text and audio caches.
//! * [`backend`] — service contracts and their HTTP adapters.
//! * [`pipeline`] — the per-turn orchestrator.
//! * [`services`] — wiring of the shared services.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod services;

pub use error::TaskError;
