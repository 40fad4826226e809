//! Criticality-aware cache store.
//!
//! Entries carry the criticality of the call that produced them. TTLs have
//! per-criticality floors and a hard cap for sensitive values, and space is
//! reclaimed by evicting the lowest-priority entries first. An entry is
//! never evicted to make room for a lower-criticality one; when no eligible
//! candidate frees enough space the insert is dropped as a soft failure.
//!
//! Eviction order comes from a min-heap of priority slots rather than a
//! linear scan. Slots go stale when an entry is replaced or its priority
//! drifts; they are validated against the live map on pop and re-pushed
//! with a fresh priority when the entry has become hotter.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::config::{CacheConfig, SENSITIVE_TTL_CAP};
use crate::cache::crypto::CacheCipher;
use crate::cache::entry::{decode, encode, is_sensitive, CacheEntry};
use crate::cache::stats::{CacheStats, MetricsCollector};
use crate::clock::{Clock, SystemClock};
use crate::context::{CallContext, Criticality};
use crate::error::ResilienceResult;

/// One candidate in the eviction heap; lower priority pops first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapSlot {
    priority: i64,
    stamp: u64,
    key: String,
}

/// Byte-budgeted cache keyed by string, safe for concurrent use.
pub struct CacheStore<C: Clock = SystemClock> {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    eviction_heap: Mutex<BinaryHeap<Reverse<HeapSlot>>>,
    total_bytes: AtomicUsize,
    stamp: AtomicU64,
    metrics: MetricsCollector,
    cipher: CacheCipher,
    clock: Arc<C>,
}

impl<C: Clock> std::fmt::Debug for CacheStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries.len())
            .field("total_bytes", &self.total_bytes.load(Ordering::Relaxed))
            .field("max_bytes", &self.config.max_bytes)
            .finish()
    }
}

impl CacheStore<SystemClock> {
    /// Create a cache store using the system clock.
    pub fn new(config: CacheConfig) -> ResilienceResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CacheStore<C> {
    /// Create a cache store with a custom clock (useful for testing).
    pub fn with_clock(config: CacheConfig, clock: C) -> ResilienceResult<Self> {
        config.validate()?;

        let key = match &config.encryption_key {
            Some(key) => key.clone(),
            None => CacheCipher::generate_key(),
        };
        let cipher = CacheCipher::new(&key)?;

        Ok(Self {
            config,
            entries: DashMap::new(),
            eviction_heap: Mutex::new(BinaryHeap::new()),
            total_bytes: AtomicUsize::new(0),
            stamp: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
            cipher,
            clock: Arc::new(clock),
        })
    }

    /// Look up a value, removing it if expired.
    pub fn get(&self, key: &str, _ctx: &CallContext) -> ResilienceResult<Option<Value>> {
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                entry.record_access();
                let value = decode(&entry.value, &self.cipher)?;
                self.metrics.record_hit();
                return Ok(Some(value));
            }
        } else {
            self.metrics.record_miss();
            return Ok(None);
        }

        // The ref guard above is dropped; reap the expired entry.
        if let Some((_, removed)) = self.entries.remove_if(key, |_, e| e.is_expired(now)) {
            self.total_bytes.fetch_sub(removed.size_bytes, Ordering::AcqRel);
            self.metrics.record_expiration();
            debug!(key, "Expired cache entry removed on access");
        }
        self.metrics.record_miss();
        Ok(None)
    }

    /// Store a value under a key.
    ///
    /// Returns `Ok(false)` when the insert is dropped because the payload
    /// exceeds the byte budget or no eligible eviction candidate could free
    /// enough space. That is a soft failure, not an error.
    #[instrument(skip(self, value, ctx), fields(criticality = %ctx.criticality))]
    pub fn set(
        &self,
        key: &str,
        value: &Value,
        ctx: &CallContext,
        ttl: Option<Duration>,
    ) -> ResilienceResult<bool> {
        let sensitive = is_sensitive(value);
        let floor = ctx.criticality.ttl_floor();
        let mut ttl = ttl.unwrap_or(floor).max(floor);
        if sensitive {
            ttl = ttl.min(SENSITIVE_TTL_CAP);
        }

        let encoded = encode(value, sensitive, self.config.compression_threshold, &self.cipher)?;
        let size_bytes = encoded.size_bytes();

        if size_bytes > self.config.max_bytes {
            debug!(key, size_bytes, "Payload exceeds cache byte budget, not cached");
            self.metrics.record_rejected_insert();
            return Ok(false);
        }

        // Bytes freed by replacing the key count toward the budget up front,
        // but the old entry stays in place until the insert is known to fit
        // so a dropped replacement never loses the cached value.
        let existing = self.entries.get(key).map(|e| e.size_bytes).unwrap_or(0);
        let needed = size_bytes.saturating_sub(existing);

        if !self.ensure_capacity(needed, ctx.criticality, key) {
            debug!(key, size_bytes, "No eligible eviction candidate, insert dropped");
            self.metrics.record_rejected_insert();
            return Ok(false);
        }

        if let Some((_, old)) = self.entries.remove(key) {
            self.total_bytes.fetch_sub(old.size_bytes, Ordering::AcqRel);
        }

        let now = self.clock.now();
        let stamp = self.stamp.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = CacheEntry {
            value: encoded,
            criticality: ctx.criticality,
            sensitive,
            size_bytes,
            inserted_at: now,
            expires_at: now + ttl,
            access_count: AtomicU32::new(0),
            stamp,
        };
        let priority = entry.priority(now);

        self.entries.insert(key.to_string(), entry);
        self.total_bytes.fetch_add(size_bytes, Ordering::AcqRel);
        self.lock_heap().push(Reverse(HeapSlot { priority, stamp, key: key.to_string() }));
        self.metrics.record_insert();
        Ok(true)
    }

    /// Remove a single entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.total_bytes.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Release);
        self.lock_heap().clear();
    }

    /// Remove only sensitive entries, leaving the rest untouched.
    ///
    /// Returns the number of entries wiped.
    pub fn clear_sensitive(&self) -> usize {
        let mut removed = 0usize;
        let mut freed = 0usize;

        self.entries.retain(|_, entry| {
            if entry.sensitive {
                removed += 1;
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });

        self.total_bytes.fetch_sub(freed, Ordering::AcqRel);
        if removed > 0 {
            info!(removed, "Sensitive cache entries wiped");
        }
        removed
    }

    /// Remove all expired entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0usize;
        for key in expired {
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| e.is_expired(now)) {
                self.total_bytes.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                self.metrics.record_expiration();
                removed += 1;
            }
        }
        removed
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(
            self.entries.len(),
            self.total_bytes.load(Ordering::Acquire),
            self.config.max_bytes,
        )
    }

    /// Spawn the background expiry sweep, stopping when `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweep task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "Cache sweep removed expired entries");
                        }
                    }
                }
            }
        })
    }

    /// Evict lowest-priority entries until `incoming` bytes fit.
    ///
    /// Entries at or above the incoming criticality are set aside, never
    /// evicted, as is the entry for `incoming_key` itself since its bytes
    /// are already credited to the budget. Returns whether enough space was
    /// freed.
    fn ensure_capacity(
        &self,
        incoming: usize,
        incoming_criticality: Criticality,
        incoming_key: &str,
    ) -> bool {
        if self.total_bytes.load(Ordering::Acquire) + incoming <= self.config.max_bytes {
            return true;
        }

        let now = self.clock.now();
        let mut heap = self.lock_heap();
        let mut protected: Vec<Reverse<HeapSlot>> = Vec::new();

        while self.total_bytes.load(Ordering::Acquire) + incoming > self.config.max_bytes {
            let Some(Reverse(slot)) = heap.pop() else { break };

            if slot.key == incoming_key {
                protected.push(Reverse(slot));
                continue;
            }

            let current = match self.entries.get(&slot.key) {
                Some(entry) if entry.stamp == slot.stamp => {
                    if entry.criticality >= incoming_criticality {
                        protected.push(Reverse(slot));
                        continue;
                    }
                    entry.priority(now)
                }
                // Replaced or removed since the slot was pushed.
                _ => continue,
            };

            if current > slot.priority {
                // Entry got hotter since the slot was pushed; reorder it.
                heap.push(Reverse(HeapSlot { priority: current, stamp: slot.stamp, key: slot.key }));
                continue;
            }

            if let Some((_, entry)) = self.entries.remove_if(&slot.key, |_, e| e.stamp == slot.stamp)
            {
                self.total_bytes.fetch_sub(entry.size_bytes, Ordering::AcqRel);
                self.metrics.record_eviction();
                debug!(key = %slot.key, priority = slot.priority, "Evicted cache entry");
            }
        }

        for slot in protected {
            heap.push(slot);
        }

        self.total_bytes.load(Ordering::Acquire) + incoming <= self.config.max_bytes
    }

    fn lock_heap(&self) -> MutexGuard<'_, BinaryHeap<Reverse<HeapSlot>>> {
        self.eviction_heap.lock().unwrap_or_else(|poisoned| {
            warn!("Cache eviction heap lock poisoned");
            poisoned.into_inner()
        })
    }
}
