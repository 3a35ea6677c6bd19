//! Memory-bounded response cache.
//!
//! This module provides:
//! * [`BoundedCache`] — one TTL tier with a byte budget and hybrid
//!   recency + frequency eviction.
//! * [`ResponseCache`] — text and audio tiers sharing one global budget.
//! * [`CacheKey`] — stable SHA-256 keys for conversation context and
//!   synthesized text.
//! * [`CacheRejected`] — admission refusal, returned as a value.

pub mod bounded;
pub mod key;
pub mod store;

pub use bounded::{BoundedCache, CacheEntry, CacheRejected, Weigh};
pub use key::CacheKey;
pub use store::{CacheStats, ResponseCache};
