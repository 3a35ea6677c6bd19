//! Pooled-connection request executor.
//!
//! # Slots
//!
//! Each remote host (`scheme://host:port`) owns up to
//! `max_connections_per_host` [`ConnectionSlot`]s.  A slot wraps a
//! single-connection `reqwest::Client`, so reusing a slot reuses its
//! keep-alive connection.  A slot is leased to exactly one in-flight request
//! at a time and released by an RAII guard on every exit path.
//!
//! ```text
//! request ──in_flight >= global?──▶ Err(CapacityExceeded)     (fail fast)
//!    │
//!    ├─ acquire slot: idle → reuse | under per-host cap → create
//!    │                else wait (10ms → 200ms backoff) until the deadline
//!    ├─ send under timeout + slot cancellation token
//!    └─ retryable error & retries left → release slot, backoff, try again
//! ```
//!
//! A background reaper closes slots idle longer than `keep_alive_secs`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::request::{check_status, read_body, RequestSpec, ResponseBody};
use crate::config::PoolConfig;
use crate::error::TaskError;
use crate::retry::backoff_delay;

/// First wait when every slot of a host is busy.
const ACQUIRE_BASE_DELAY: Duration = Duration::from_millis(10);
/// Longest single wait between slot acquisition attempts.
const ACQUIRE_MAX_DELAY: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// ConnectionSlot
// ---------------------------------------------------------------------------

/// One reusable connection to a host.
#[derive(Debug)]
pub struct ConnectionSlot {
    pub id: u64,
    pub host: String,
    pub in_use: bool,
    pub last_used: Instant,
    /// Token of the current lease; cancelled on pool shutdown.
    pub cancel: CancellationToken,
    client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// PoolStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub slots: usize,
    pub in_use: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub slots_created: u64,
    pub slots_reaped: u64,
    pub rejected: u64,
    pub in_flight: usize,
    pub hosts: BTreeMap<String, HostStats>,
}

impl PoolStats {
    pub fn total_slots(&self) -> usize {
        self.hosts.values().map(|h| h.slots).sum()
    }
}

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

struct PoolInner {
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Vec<ConnectionSlot>>>,
    in_flight: AtomicUsize,
    next_slot: AtomicU64,
    created: AtomicU64,
    reaped: AtomicU64,
    rejected: AtomicU64,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn hosts(&self) -> MutexGuard<'_, HashMap<String, Vec<ConnectionSlot>>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve one unit of the global ceiling, or fail fast.
    fn admit(self: &Arc<Self>) -> Result<InFlightPermit, TaskError> {
        let limit = self.config.global_concurrency;
        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1));
        match reserved {
            Ok(_) => Ok(InFlightPermit {
                inner: Arc::clone(self),
            }),
            Err(n) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("pool: global ceiling reached ({n}/{limit}), rejecting request");
                Err(TaskError::CapacityExceeded(format!(
                    "pool global concurrency {limit} reached"
                )))
            }
        }
    }

    /// Lease an idle slot or create one under the per-host limit.
    fn try_lease(
        self: &Arc<Self>,
        host: &str,
        parent: Option<&CancellationToken>,
    ) -> Result<Option<SlotLease>, TaskError> {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let mut hosts = self.hosts();
        let slots = hosts.entry(host.to_string()).or_default();

        if let Some(slot) = slots.iter_mut().find(|s| !s.in_use) {
            slot.in_use = true;
            slot.cancel = token.clone();
            return Ok(Some(self.lease(host, slot.id, slot.client.clone(), token)));
        }

        if slots.len() >= self.config.max_connections_per_host {
            return Ok(None);
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(self.config.keep_alive())
            .build()
            .map_err(|e| TaskError::Internal(format!("failed to build HTTP client: {e}")))?;
        let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        slots.push(ConnectionSlot {
            id,
            host: host.to_string(),
            in_use: true,
            last_used: Instant::now(),
            cancel: token.clone(),
            client: client.clone(),
        });
        self.created.fetch_add(1, Ordering::Relaxed);
        log::debug!("pool: opened slot #{id} for {host} ({} total)", slots.len());
        Ok(Some(self.lease(host, id, client, token)))
    }

    fn lease(
        self: &Arc<Self>,
        host: &str,
        slot_id: u64,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> SlotLease {
        SlotLease {
            inner: Arc::clone(self),
            host: host.to_string(),
            slot_id,
            client,
            cancel,
        }
    }

    /// Wait for a slot of `host` until `budget` elapses.
    async fn acquire(
        self: &Arc<Self>,
        host: &str,
        parent: Option<&CancellationToken>,
        budget: Duration,
    ) -> Result<SlotLease, TaskError> {
        let deadline = Instant::now() + budget;
        let mut delay = ACQUIRE_BASE_DELAY;
        loop {
            if let Some(lease) = self.try_lease(host, parent)? {
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("pool: no free slot for {host} within {budget:?}");
                return Err(TaskError::Timeout(budget));
            }
            tokio::select! {
                () = cancelled(parent) => return Err(TaskError::Cancelled),
                () = self.shutdown.cancelled() => return Err(TaskError::Cancelled),
                () = tokio::time::sleep(delay.min(deadline - now)) => {}
            }
            delay = (delay * 2).min(ACQUIRE_MAX_DELAY);
        }
    }

    fn release(&self, host: &str, slot_id: u64) {
        let mut hosts = self.hosts();
        if let Some(slot) = hosts
            .get_mut(host)
            .and_then(|slots| slots.iter_mut().find(|s| s.id == slot_id))
        {
            slot.in_use = false;
            slot.last_used = Instant::now();
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// One unit of the global in-flight ceiling.
struct InFlightPermit {
    inner: Arc<PoolInner>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive use of one slot; returns it to the pool on drop.
struct SlotLease {
    inner: Arc<PoolInner>,
    host: String,
    slot_id: u64,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.inner.release(&self.host, self.slot_id);
    }
}

// ---------------------------------------------------------------------------
// StreamLease
// ---------------------------------------------------------------------------

/// A streaming response body that keeps its slot leased until dropped.
pub struct StreamLease {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    cancel: CancellationToken,
    _lease: SlotLease,
    _permit: InFlightPermit,
}

impl StreamLease {
    /// Next body chunk; `None` at end of stream.  Yields
    /// `Err(TaskError::Cancelled)` once the slot's token fires.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, TaskError>> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Some(Err(TaskError::Cancelled)),
            chunk = self.body.next() => chunk.map(|r| r.map_err(TaskError::from)),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLease")
            .field("host", &self._lease.host)
            .field("slot", &self._lease.slot_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// Process-wide HTTP executor with per-host slot reuse and a global
/// in-flight ceiling.  Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                hosts: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                next_slot: AtomicU64::new(1),
                created: AtomicU64::new(0),
                reaped: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Execute `spec` to completion, retrying transient failures.
    pub async fn request(&self, spec: RequestSpec) -> Result<ResponseBody, TaskError> {
        let host = spec.host_key()?;
        let _permit = self.inner.admit()?;
        let max_retries = spec.max_retries.unwrap_or(self.inner.config.max_retries);

        let mut attempt = 0;
        loop {
            match self.attempt(&host, &spec).await {
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    self.backoff(&host, &spec, attempt, max_retries, &e).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Open a streaming response.  Retries cover connection setup and
    /// response headers only; once the lease is returned the body is the
    /// caller's to consume.
    pub async fn stream(&self, spec: RequestSpec) -> Result<StreamLease, TaskError> {
        let host = spec.host_key()?;
        let permit = self.inner.admit()?;
        let max_retries = spec.max_retries.unwrap_or(self.inner.config.max_retries);
        let timeout = spec.timeout.unwrap_or(self.inner.config.request_timeout());

        let mut attempt = 0;
        loop {
            let lease = self.inner.acquire(&host, spec.cancel.as_ref(), timeout).await?;
            let token = lease.cancel.clone();
            let open = async {
                let response = spec.build(&lease.client)?.send().await?;
                check_status(response).await
            };
            let opened = tokio::select! {
                biased;
                () = token.cancelled() => Err(TaskError::Cancelled),
                r = tokio::time::timeout(timeout, open) => r.unwrap_or(Err(TaskError::Timeout(timeout))),
            };

            match opened {
                Ok(response) => {
                    return Ok(StreamLease {
                        body: response.bytes_stream().boxed(),
                        cancel: token,
                        _lease: lease,
                        _permit: permit,
                    });
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    drop(lease);
                    self.backoff(&host, &spec, attempt, max_retries, &e).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close idle slots older than the keep-alive window.  Returns how many
    /// were removed.
    pub fn reap_idle(&self) -> usize {
        let keep_alive = self.inner.config.keep_alive();
        let now = Instant::now();
        let mut removed = 0;
        {
            let mut hosts = self.inner.hosts();
            for slots in hosts.values_mut() {
                let before = slots.len();
                slots.retain(|s| s.in_use || now.saturating_duration_since(s.last_used) <= keep_alive);
                removed += before - slots.len();
            }
            hosts.retain(|_, slots| !slots.is_empty());
        }
        if removed > 0 {
            self.inner.reaped.fetch_add(removed as u64, Ordering::Relaxed);
            log::debug!("pool: reaped {removed} idle slots");
        }
        removed
    }

    /// Spawn the periodic reaper.  The task exits when `shutdown` fires.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let interval = self.inner.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => { pool.reap_idle(); }
                }
            }
            log::debug!("pool: reaper stopped");
        })
    }

    pub fn stats(&self) -> PoolStats {
        let hosts = self
            .inner
            .hosts()
            .iter()
            .map(|(host, slots)| {
                let in_use = slots.iter().filter(|s| s.in_use).count();
                (
                    host.clone(),
                    HostStats {
                        slots: slots.len(),
                        in_use,
                    },
                )
            })
            .collect();
        PoolStats {
            slots_created: self.inner.created.load(Ordering::Relaxed),
            slots_reaped: self.inner.reaped.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Acquire),
            hosts,
        }
    }

    /// Cancel every leased slot and drop all idle ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut hosts = self.inner.hosts();
        for slot in hosts.values().flatten() {
            slot.cancel.cancel();
        }
        for slots in hosts.values_mut() {
            slots.retain(|s| s.in_use);
        }
        log::debug!("pool: shut down");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn attempt(&self, host: &str, spec: &RequestSpec) -> Result<ResponseBody, TaskError> {
        let timeout = spec.timeout.unwrap_or(self.inner.config.request_timeout());
        let lease = self.inner.acquire(host, spec.cancel.as_ref(), timeout).await?;
        let work = async {
            let response = spec.build(&lease.client)?.send().await?;
            let response = check_status(response).await?;
            read_body(response, spec.expect).await
        };
        tokio::select! {
            biased;
            () = lease.cancel.cancelled() => Err(TaskError::Cancelled),
            r = tokio::time::timeout(timeout, work) => r.unwrap_or(Err(TaskError::Timeout(timeout))),
        }
    }

    async fn backoff(
        &self,
        host: &str,
        spec: &RequestSpec,
        attempt: u32,
        max_retries: u32,
        err: &TaskError,
    ) -> Result<(), TaskError> {
        let delay = backoff_delay(
            attempt,
            self.inner.config.retry_base_delay(),
            self.inner.config.retry_max_delay(),
        );
        log::warn!(
            "pool: {} {host} failed ({err}); retry {}/{max_retries} in {delay:?}",
            spec.method,
            attempt + 1
        );
        tokio::select! {
            () = cancelled(spec.cancel.as_ref()) => Err(TaskError::Cancelled),
            () = self.inner.shutdown.cancelled() => Err(TaskError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
