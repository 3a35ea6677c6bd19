//! Memory-budgeted TTL cache with hybrid recency + frequency eviction.
//!
//! [`BoundedCache`] is the single-tier building block; the two-tier
//! [`ResponseCache`](super::ResponseCache) wraps one for text replies and one
//! for synthesized audio.
//!
//! # Admission
//!
//! `set` never over-commits: if the new entry would push the estimated
//! memory above the budget the call is refused with [`CacheRejected`] and
//! the cache is left untouched.
//!
//! # Eviction
//!
//! * Expired entries are dropped lazily on `get` and eagerly by
//!   [`sweep_expired`](BoundedCache::sweep_expired).
//! * When the entry count reaches 90% of `max_entries`, entries are ranked by
//!   `access_count / (minutes_since_last_access + 1)` and the lowest-scoring
//!   20% are removed, repeating until the count is below the threshold.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

/// Fixed per-entry bookkeeping estimate (map slot, timestamps, counters).
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Entry-count fraction at which score-based eviction kicks in.
const EVICTION_THRESHOLD: f64 = 0.9;

/// Fraction of entries removed per eviction round.
const EVICTION_FRACTION: f64 = 0.2;

// ---------------------------------------------------------------------------
// Weigh
// ---------------------------------------------------------------------------

/// Estimated heap footprint of a cached value.
pub trait Weigh {
    fn weight(&self) -> usize;
}

impl Weigh for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weigh for Bytes {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weigh for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// Estimated size of an entry stored under `key`.
pub fn entry_size<V: Weigh>(key: &str, value: &V) -> usize {
    key.len() + value.weight() + ENTRY_OVERHEAD_BYTES
}

// ---------------------------------------------------------------------------
// CacheRejected
// ---------------------------------------------------------------------------

/// Why a `set` was refused.  Returned as a value; the cache is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheRejected {
    #[error("entry of {size} bytes exceeds the {budget}-byte budget")]
    TooLarge { size: usize, budget: usize },

    #[error("tier budget exhausted: need {needed} bytes, {available} available")]
    TierFull { needed: usize, available: usize },

    #[error("global budget exhausted: need {needed} bytes, {available} available")]
    GlobalFull { needed: usize, available: usize },
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A cached value plus the bookkeeping used for TTL and eviction.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub size: usize,
}

impl<V> CacheEntry<V> {
    fn new(value: V, size: usize, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            last_access: now,
            access_count: 1,
            size,
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }

    /// Hybrid recency + frequency score; lower scores are evicted first.
    pub fn score(&self, now: Instant) -> f64 {
        let minutes = now.saturating_duration_since(self.last_access).as_secs_f64() / 60.0;
        self.access_count as f64 / (minutes + 1.0)
    }
}

// ---------------------------------------------------------------------------
// BoundedCache
// ---------------------------------------------------------------------------

/// A single memory-budgeted cache tier.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use voice_relay::cache::BoundedCache;
///
/// let mut cache: BoundedCache<String> = BoundedCache::new(100, 4_096, Duration::from_secs(60));
/// cache.set("greeting", "hello".to_string(), usize::MAX).unwrap();
/// assert_eq!(cache.get("greeting").as_deref(), Some("hello"));
/// ```
#[derive(Debug)]
pub struct BoundedCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    max_entries: usize,
    max_memory: usize,
    ttl: Duration,
    memory_used: usize,
    evictions: u64,
    expired: u64,
}

impl<V: Weigh + Clone> BoundedCache<V> {
    pub fn new(max_entries: usize, max_memory: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            max_memory,
            ttl,
            memory_used: 0,
            evictions: 0,
            expired: 0,
        }
    }

    /// Look up `key`, refreshing its recency and frequency on a hit.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(self.ttl, now),
            None => return None,
        };

        if expired {
            self.remove(key);
            self.expired += 1;
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = now;
        Some(entry.value.clone())
    }

    /// Insert or replace `key`.
    ///
    /// `global_available` is the number of bytes the caller can still spend
    /// across every tier sharing the same global budget.  The entry is
    /// admitted only if it fits both this tier's budget and that allowance.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: V,
        global_available: usize,
    ) -> Result<(), CacheRejected> {
        let key = key.into();
        let size = entry_size(&key, &value);

        if size > self.max_memory {
            return Err(CacheRejected::TooLarge {
                size,
                budget: self.max_memory,
            });
        }

        let replaced = self.entries.get(&key).map_or(0, |e| e.size);
        let growth = size.saturating_sub(replaced);

        let tier_available = self.max_memory.saturating_sub(self.memory_used - replaced);
        if size > tier_available {
            return Err(CacheRejected::TierFull {
                needed: size,
                available: tier_available,
            });
        }
        if growth > global_available {
            return Err(CacheRejected::GlobalFull {
                needed: growth,
                available: global_available,
            });
        }

        if replaced == 0 && self.near_entry_ceiling(1) {
            self.evict_lowest_scoring();
        }

        let now = Instant::now();
        if let Some(old) = self.entries.insert(key, CacheEntry::new(value, size, now)) {
            self.memory_used -= old.size;
        }
        self.memory_used += size;
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.memory_used -= entry.size;
        Some(entry.value)
    }

    /// Drop every entry older than the TTL.  Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(ttl, now);
            if !keep {
                freed += entry.size;
            }
            keep
        });
        self.memory_used -= freed;
        let removed = before - self.entries.len();
        self.expired += removed as u64;
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.memory_used = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated bytes currently held.
    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Entries removed by score-based eviction since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Entries dropped for age, on lookup or by a sweep, since creation.
    pub fn expired(&self) -> u64 {
        self.expired
    }

    /// Read-only view of an entry's bookkeeping (no recency refresh).
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    fn eviction_threshold(&self) -> usize {
        ((self.max_entries as f64 * EVICTION_THRESHOLD).floor() as usize).max(1)
    }

    fn near_entry_ceiling(&self, incoming: usize) -> bool {
        self.entries.len() + incoming > self.eviction_threshold()
    }

    /// Remove expired entries, then the lowest-scoring 20% in rounds until
    /// the count is under the eviction threshold (leaving room for one more).
    fn evict_lowest_scoring(&mut self) {
        let swept = self.sweep_expired();
        if swept > 0 {
            log::debug!("cache: swept {swept} expired entries before eviction");
        }

        let now = Instant::now();
        while self.near_entry_ceiling(1) && !self.entries.is_empty() {
            let mut ranked: Vec<(String, f64)> = self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.score(now)))
                .collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

            let batch = ((ranked.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
            for (key, _) in ranked.into_iter().take(batch) {
                if self.remove(&key).is_some() {
                    self.evictions += 1;
                }
            }
        }
        log::debug!(
            "cache: evicted down to {} entries ({} bytes)",
            self.entries.len(),
            self.memory_used
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
