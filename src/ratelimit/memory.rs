//! In-process reference limiter engine.
//!
//! Keeps one counter per discriminator key in a [`DashMap`] inside each
//! limiter, namespaced by the rule's `key_by`. Counting state is local to
//! this process and the shard address is ignored, which makes it suitable for
//! single-node deployments and tests.
//!
//! State for a key is dropped once it is indistinguishable from a fresh
//! entry (window elapsed, bucket refilled), either by [`Limiter::sweep`] or
//! opportunistically every [`SWEEP_EVERY`] calls.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::engine::{EngineError, Limiter, LimiterEngine, SharedLimiter};
use super::resolver::RateLimitConfig;
use crate::store::{KeyBy, Strategy};

/// Number of `allow` calls between opportunistic sweeps of expired state.
pub const SWEEP_EVERY: u64 = 1024;

/// Engine producing [`MemoryLimiter`]s.
#[derive(Debug, Default, Clone)]
pub struct MemoryEngine;

impl MemoryEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LimiterEngine for MemoryEngine {
    async fn construct(
        &self,
        config: &RateLimitConfig,
        shard: &str,
    ) -> Result<SharedLimiter, EngineError> {
        let limiter =
            MemoryLimiter::new(config.strategy, config.key_by, config.limit, config.window)?;

        debug!(
            strategy = %config.strategy,
            key_by = %config.key_by,
            limit = config.limit,
            window = ?config.window,
            shard,
            "Creating in-memory limiter"
        );

        Ok(Arc::new(limiter))
    }
}

/// Per-key counting state.
#[derive(Debug, Clone, Copy)]
enum KeyState {
    Fixed {
        count: u64,
        window_start: Instant,
    },
    Sliding {
        current: u64,
        previous: u64,
        window_start: Instant,
    },
    Bucket {
        tokens: f64,
        last_refill: Instant,
    },
}

/// A limiter counting requests per discriminator key in process memory.
pub struct MemoryLimiter {
    strategy: Strategy,
    namespace: KeyBy,
    limit: u64,
    window: Duration,
    states: DashMap<String, KeyState>,
    calls: AtomicU64,
}

impl MemoryLimiter {
    /// Create a limiter admitting `limit` requests per `window` for each key.
    ///
    /// Both `limit` and `window` must be positive.
    pub fn new(
        strategy: Strategy,
        key_by: KeyBy,
        limit: u64,
        window: Duration,
    ) -> Result<Self, EngineError> {
        if limit == 0 || window.is_zero() {
            return Err(EngineError::Construction(format!(
                "limit and window must be positive (limit={}, window={:?})",
                limit, window
            )));
        }

        Ok(Self {
            strategy,
            namespace: key_by,
            limit,
            window,
            states: DashMap::new(),
            calls: AtomicU64::new(0),
        })
    }

    /// Number of discriminator keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.states.len()
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn initial_state(&self, now: Instant) -> KeyState {
        match self.strategy {
            Strategy::FixedWindow => KeyState::Fixed {
                count: 0,
                window_start: now,
            },
            Strategy::SlidingWindow => KeyState::Sliding {
                current: 0,
                previous: 0,
                window_start: now,
            },
            Strategy::TokenBucket => KeyState::Bucket {
                tokens: self.limit as f64,
                last_refill: now,
            },
        }
    }

    fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window.as_secs_f64()
    }

    /// Whether `state` would behave exactly like a fresh entry at `now`.
    fn is_expired(&self, state: &KeyState, now: Instant) -> bool {
        match state {
            KeyState::Fixed { window_start, .. } => {
                now.duration_since(*window_start) >= self.window
            }
            // The previous window still weighs in until two have passed
            KeyState::Sliding { window_start, .. } => {
                now.duration_since(*window_start) >= self.window.saturating_mul(2)
            }
            KeyState::Bucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                tokens + elapsed * self.refill_rate() >= self.limit as f64
            }
        }
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut released = 0;
        self.states.retain(|_, state| {
            if self.is_expired(state, now) {
                released += 1;
                false
            } else {
                true
            }
        });

        if released > 0 {
            trace!(released, remaining = self.states.len(), "Released expired key state");
        }
        released
    }

    fn admit(&self, state: &mut KeyState, now: Instant) -> bool {
        match state {
            KeyState::Fixed {
                count,
                window_start,
            } => {
                if now.duration_since(*window_start) >= self.window {
                    *count = 0;
                    *window_start = now;
                }

                if *count < self.limit {
                    *count += 1;
                    true
                } else {
                    false
                }
            }
            KeyState::Sliding {
                current,
                previous,
                window_start,
            } => {
                let elapsed = now.duration_since(*window_start);
                let windows_passed = (elapsed.as_nanos() / self.window.as_nanos()) as u32;
                if windows_passed == 1 {
                    *previous = *current;
                    *current = 0;
                    *window_start += self.window;
                } else if windows_passed > 1 {
                    *previous = 0;
                    *current = 0;
                    *window_start = now;
                }

                // Weight the previous window by how much of it still overlaps
                let into_window = now.duration_since(*window_start).as_secs_f64();
                let overlap = 1.0 - (into_window / self.window.as_secs_f64()).min(1.0);
                let estimate = *previous as f64 * overlap + *current as f64;

                if estimate + 1.0 <= self.limit as f64 {
                    *current += 1;
                    true
                } else {
                    false
                }
            }
            KeyState::Bucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * self.refill_rate()).min(self.limit as f64);
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[async_trait]
impl Limiter for MemoryLimiter {
    async fn allow(&self, key: &str) -> Result<bool, EngineError> {
        let now = Instant::now();
        let allowed = {
            let mut state = self
                .states
                .entry(self.state_key(key))
                .or_insert_with(|| self.initial_state(now));
            self.admit(state.value_mut(), now)
        };

        if self.calls.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_at(now);
        }

        Ok(allowed)
    }

    fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }
}
