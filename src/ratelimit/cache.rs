//! Memoization of limiter instances per [`ConfigKey`].
//!
//! Each key owns a slot in a sharded [`DashMap`]. A slot is reserved under the
//! map's shard lock, but the limiter itself is built outside of it through the
//! slot's [`OnceCell`], so constructions for different keys run concurrently
//! while concurrent misses on the same key wait for a single construction.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use super::engine::{EngineError, SharedLimiter};
use super::key::ConfigKey;

struct Slot {
    limiter: OnceCell<SharedLimiter>,
    /// Milliseconds since the cache epoch at last use
    last_used: AtomicU64,
}

impl Slot {
    fn new(now_ms: u64) -> Self {
        Self {
            limiter: OnceCell::new(),
            last_used: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_used.store(now_ms, Ordering::Relaxed);
    }
}

/// Thread-safe get-or-create cache of limiters.
///
/// For every key at most one construction is in flight at a time, and once
/// one succeeds every caller observes that same instance. Failed
/// constructions leave the slot empty so the next caller retries.
///
/// Entries live until removed by [`LimiterCache::evict_idle`] or
/// [`LimiterCache::clear`]. A key evicted while in use may be constructed
/// again by a later caller.
pub struct LimiterCache {
    slots: DashMap<ConfigKey, Arc<Slot>>,
    epoch: Instant,
    constructions: AtomicU64,
}

impl LimiterCache {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            epoch: Instant::now(),
            constructions: AtomicU64::new(0),
        }
    }

    /// Return the limiter for `key`, building it with `factory` on a miss.
    ///
    /// `factory` runs without any map lock held. If the calling task is
    /// cancelled mid-construction the slot is released for the next caller.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &ConfigKey,
        factory: F,
    ) -> Result<SharedLimiter, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedLimiter, EngineError>>,
    {
        if let Some(limiter) = self.lookup(key) {
            trace!(key = %key, "Limiter cache hit");
            return Ok(limiter);
        }

        let slot = self.reserve(key);

        let limiter = slot
            .limiter
            .get_or_try_init(|| async move {
                debug!(key = %key, "Limiter cache miss, constructing limiter");
                let limiter = factory().await?;
                self.constructions.fetch_add(1, Ordering::Relaxed);
                Ok::<_, EngineError>(limiter)
            })
            .await
            .map_err(|err| {
                warn!(key = %key, error = %err, "Limiter construction failed");
                err
            })?
            .clone();

        slot.touch(self.now_ms());
        Ok(limiter)
    }

    /// Return the limiter for `key` if one has been constructed.
    pub fn get(&self, key: &ConfigKey) -> Option<SharedLimiter> {
        self.lookup(key)
    }

    fn lookup(&self, key: &ConfigKey) -> Option<SharedLimiter> {
        let slot = self.slots.get(key)?;
        let limiter = slot.limiter.get().cloned()?;
        slot.touch(self.now_ms());
        Some(limiter)
    }

    fn reserve(&self, key: &ConfigKey) -> Arc<Slot> {
        let now_ms = self.now_ms();
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new(now_ms)))
            .value()
            .clone();
        slot
    }

    /// Remove limiters unused for at least `max_idle`, returning how many
    /// entries were dropped.
    ///
    /// Empty slots are removed only when no caller is constructing into them.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now_ms = self.now_ms();
        let max_idle_ms = max_idle.as_millis() as u64;
        let mut evicted = 0;

        self.slots.retain(|key, slot| {
            let idle_ms = now_ms.saturating_sub(slot.last_used.load(Ordering::Relaxed));
            if idle_ms < max_idle_ms {
                return true;
            }

            let in_flight = slot.limiter.get().is_none() && Arc::strong_count(slot) > 1;
            if in_flight {
                return true;
            }

            debug!(key = %key, idle_ms, "Evicting idle limiter");
            evicted += 1;
            false
        });

        evicted
    }

    /// Ask every constructed limiter to release per-key state it no longer
    /// needs, returning the total number of keys released.
    pub fn sweep_limiters(&self) -> usize {
        let limiters: Vec<SharedLimiter> = self
            .slots
            .iter()
            .filter_map(|slot| slot.limiter.get().cloned())
            .collect();

        limiters.iter().map(|limiter| limiter.sweep()).sum()
    }

    /// Number of keys with a slot, constructed or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total successful constructions since the cache was created.
    pub fn constructions(&self) -> u64 {
        self.constructions.load(Ordering::Relaxed)
    }

    /// Drop every cached limiter.
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for LimiterCache {
    fn default() -> Self {
        Self::new()
    }
}
