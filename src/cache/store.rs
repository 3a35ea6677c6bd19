//! Two-tier response cache shared by every conversation session.
//!
//! Text replies and synthesized audio live in separate [`BoundedCache`]
//! tiers with their own byte budgets (a configurable split of one global
//! budget).  Every `set` is additionally checked against the global budget so
//! the combined estimate can never exceed it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bounded::{BoundedCache, CacheRejected};
use super::key::CacheKey;
use crate::config::CacheConfig;

// ---------------------------------------------------------------------------
// CacheStats
// ---------------------------------------------------------------------------

/// Point-in-time counters for both tiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub text_entries: usize,
    pub audio_entries: usize,
    pub text_bytes: usize,
    pub audio_bytes: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub rejections: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn memory_used(&self) -> usize {
        self.text_bytes + self.audio_bytes
    }

    /// Hit ratio in `[0, 1]`; `0.0` before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

/// Process-wide cache for generation text and synthesized audio.
///
/// Lock order is always text tier, then audio tier.
pub struct ResponseCache {
    text: Mutex<BoundedCache<String>>,
    audio: Mutex<BoundedCache<Bytes>>,
    max_memory: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    rejections: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            text: Mutex::new(BoundedCache::new(
                config.max_entries,
                config.text_budget(),
                config.ttl(),
            )),
            audio: Mutex::new(BoundedCache::new(
                config.max_entries,
                config.audio_budget(),
                config.ttl(),
            )),
            max_memory: config.max_memory_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Text tier
    // -----------------------------------------------------------------------

    pub fn get_text(&self, key: &CacheKey) -> Option<String> {
        let hit = lock(&self.text).get(key.as_str());
        self.record_lookup(hit.is_some());
        hit
    }

    pub fn set_text(&self, key: &CacheKey, value: String) -> Result<(), CacheRejected> {
        let mut text = lock(&self.text);
        let audio_used = lock(&self.audio).memory_used();
        let available = self.max_memory.saturating_sub(text.memory_used() + audio_used);
        let result = text.set(key.as_str(), value, available);
        self.record_admission(&result, "text");
        result
    }

    // -----------------------------------------------------------------------
    // Audio tier
    // -----------------------------------------------------------------------

    pub fn get_audio(&self, key: &CacheKey) -> Option<Bytes> {
        let hit = lock(&self.audio).get(key.as_str());
        self.record_lookup(hit.is_some());
        hit
    }

    pub fn set_audio(&self, key: &CacheKey, value: Bytes) -> Result<(), CacheRejected> {
        let text = lock(&self.text);
        let mut audio = lock(&self.audio);
        let available = self
            .max_memory
            .saturating_sub(text.memory_used() + audio.memory_used());
        let result = audio.set(key.as_str(), value, available);
        self.record_admission(&result, "audio");
        result
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Remove expired entries from both tiers.  Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        lock(&self.text).sweep_expired() + lock(&self.audio).sweep_expired()
    }

    pub fn clear(&self) {
        lock(&self.text).clear();
        lock(&self.audio).clear();
    }

    /// Entries across both tiers.
    pub fn len(&self) -> usize {
        lock(&self.text).len() + lock(&self.audio).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combined estimated bytes across both tiers.
    pub fn memory_used(&self) -> usize {
        lock(&self.text).memory_used() + lock(&self.audio).memory_used()
    }

    pub fn stats(&self) -> CacheStats {
        let text = lock(&self.text);
        let audio = lock(&self.audio);
        CacheStats {
            text_entries: text.len(),
            audio_entries: audio.len(),
            text_bytes: text.memory_used(),
            audio_bytes: audio.memory_used(),
            max_memory_bytes: self.max_memory,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            evictions: text.evictions() + audio.evictions(),
            expired: text.expired() + audio.expired(),
        }
    }

    /// Spawn the periodic TTL sweep.  The task exits when `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            log::debug!("cache: sweep removed {removed} expired entries");
                        }
                    }
                }
            }
            log::debug!("cache: sweeper stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_admission(&self, result: &Result<(), CacheRejected>, tier: &str) {
        if let Err(e) = result {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            log::debug!("cache: {tier} entry rejected: {e}");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::bounded::entry_size;

    fn config(max_memory: usize, text_share: f64) -> CacheConfig {
        CacheConfig {
            max_entries: 100,
            max_memory_bytes: max_memory,
            text_memory_share: text_share,
            ttl_secs: 60,
            cleanup_interval_secs: 1,
        }
    }

    #[test]
    fn text_and_audio_round_trip() {
        let cache = ResponseCache::new(&config(100_000, 0.5));
        let tk = CacheKey::for_synthesis("v", "text");
        let ak = CacheKey::for_synthesis("v", "audio");

        cache.set_text(&tk, "reply".into()).unwrap();
        cache.set_audio(&ak, Bytes::from_static(&[1, 2, 3, 4])).unwrap();

        assert_eq!(cache.get_text(&tk).as_deref(), Some("reply"));
        assert_eq!(cache.get_audio(&ak).map(|b| b.len()), Some(4));
    }

    #[test]
    fn audio_bytes_are_preserved_exactly() {
        let cache = ResponseCache::new(&config(1_000_000, 0.1));
        let key = CacheKey::for_synthesis("v", "Hi!");
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_007).collect();
        cache.set_audio(&key, Bytes::from(payload.clone())).unwrap();
        assert_eq!(cache.get_audio(&key).as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn tiers_have_independent_budgets() {
        let cache = ResponseCache::new(&config(1_000, 0.2));
        let key = CacheKey::for_synthesis("v", "long");

        // 400 bytes does not fit the 200-byte text tier but fits audio.
        assert!(cache.set_text(&key, "x".repeat(400)).is_err());
        assert!(cache.set_audio(&key, Bytes::from(vec![0u8; 400])).is_ok());
    }

    #[test]
    fn stats_count_hits_misses_rejections() {
        let cache = ResponseCache::new(&config(1_000, 0.5));
        let key = CacheKey::for_synthesis("v", "a");
        assert!(cache.get_text(&key).is_none());
        cache.set_text(&key, "a".into()).unwrap();
        assert!(cache.get_text(&key).is_some());
        assert!(cache.set_text(&key, "z".repeat(10_000)).is_err());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.rejections, 1);
        assert_eq!(stats.text_entries, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn memory_used_sums_both_tiers() {
        let cache = ResponseCache::new(&config(10_000, 0.5));
        let k = CacheKey::for_synthesis("v", "k");
        cache.set_text(&k, "abc".into()).unwrap();
        cache.set_audio(&k, Bytes::from_static(b"abcd")).unwrap();
        let expected = entry_size(k.as_str(), &"abc".to_string())
            + entry_size(k.as_str(), &Bytes::from_static(b"abcd"));
        assert_eq!(cache.memory_used(), expected);
        assert!(cache.memory_used() <= cache.stats().max_memory_bytes);
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expiring_on_lookup_are_counted() {
        let mut cfg = config(10_000, 0.5);
        cfg.ttl_secs = 2;
        let cache = ResponseCache::new(&cfg);
        let key = CacheKey::for_synthesis("v", "stale");
        cache.set_text(&key, "old reply".into()).unwrap();
        cache.set_audio(&key, Bytes::from_static(b"pcm")).unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get_text(&key).is_none());
        assert!(cache.get_audio(&key).is_none());

        let stats = cache.stats();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.misses, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let mut cfg = config(10_000, 0.5);
        cfg.ttl_secs = 2;
        let cache = Arc::new(ResponseCache::new(&cfg));
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(1), shutdown.clone());

        let key = CacheKey::for_synthesis("v", "gone");
        cache.set_audio(&key, Bytes::from_static(b"pcm")).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(cache.stats().audio_entries, 0);
        assert!(cache.stats().expired >= 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
