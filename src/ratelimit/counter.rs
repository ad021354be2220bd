//! In-process fixed-window counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::WindowCounter;
use super::clock::{duration_millis, Clock, SystemClock};
use super::decision::{Decision, DecisionSource};
use super::identity::IdentityKey;
use super::policy::Policy;
use crate::error::StoreError;

/// Default number of keys the local counter tracks before evicting.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// A full counter frees `capacity / EVICTION_DIVISOR` slots at once.
const EVICTION_DIVISOR: usize = 10;

/// Per-key window state.
#[derive(Debug, Clone, Copy)]
struct WindowState {
    /// Admitted events in the current window
    count: u64,
    /// When the current window started (ms)
    window_start: u64,
    /// Length of the current window (ms)
    window: u64,
    /// Last time the key was checked (ms), for eviction
    last_seen: u64,
}

impl WindowState {
    fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window
    }
}

/// A fixed-window counter that resets each key's count at window boundaries.
///
/// Admission for one key is serialized through the map's entry lock, so the
/// `(max+1)`-th attempt in a window is always denied. Up to twice the ceiling
/// can pass across a window seam; that is inherent to fixed windows.
///
/// Memory is bounded by `capacity`: when a new key arrives at capacity,
/// expired windows are dropped first and then the least recently seen keys,
/// a tenth of the capacity at a time.
pub struct FixedWindowCounter {
    windows: DashMap<IdentityKey, WindowState>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl FixedWindowCounter {
    /// Create a counter on the system clock with the default capacity.
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_CAPACITY, Arc::new(SystemClock))
    }

    /// Create a counter with an explicit capacity and clock.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Count one attempt for `key` under `policy`.
    pub fn check_local(&self, policy: &Policy, key: &IdentityKey) -> Decision {
        let now = self.clock.now_millis();
        let window = duration_millis(policy.window());
        let max = policy.max_events();

        if !self.windows.contains_key(key) && self.windows.len() >= self.capacity {
            self.make_room(now);
        }

        let decision = {
            let mut state = self.windows.entry(key.clone()).or_insert(WindowState {
                count: 0,
                window_start: now,
                window,
                last_seen: now,
            });
            state.last_seen = now;

            if state.count == 0 || now.saturating_sub(state.window_start) >= window {
                state.count = 1;
                state.window_start = now;
                state.window = window;
                Decision::admitted(max, max - 1, policy.window(), now, DecisionSource::Local)
            } else {
                let until_reset = Duration::from_millis(
                    state.window_start.saturating_add(window).saturating_sub(now),
                );
                if state.count < max {
                    state.count += 1;
                    Decision::admitted(
                        max,
                        max - state.count,
                        until_reset,
                        now,
                        DecisionSource::Local,
                    )
                } else {
                    Decision::rejected(max, until_reset, now, DecisionSource::Local)
                }
            }
        };

        trace!(
            policy = policy.name(),
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Local window check"
        );
        if !decision.allowed {
            debug!(
                policy = policy.name(),
                key = %key,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Local rate limit exceeded"
            );
        }
        decision
    }

    /// Drop every key whose window has elapsed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.purge_expired_at(now)
    }

    fn purge_expired_at(&self, now: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| !state.expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Free at least one eviction batch worth of slots.
    ///
    /// Expired windows go first, then the least recently seen keys.
    fn make_room(&self, now: u64) {
        let purged = self.purge_expired_at(now);
        if purged > 0 {
            trace!(purged, "Purged expired local windows");
        }

        let target = self.capacity.saturating_sub(self.eviction_batch());
        let excess = self.windows.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut seen: Vec<(u64, IdentityKey)> = self
            .windows
            .iter()
            .map(|entry| (entry.value().last_seen, entry.key().clone()))
            .collect();
        if excess < seen.len() {
            seen.select_nth_unstable_by_key(excess, |(last_seen, _)| *last_seen);
            seen.truncate(excess);
        }
        for (_, key) in &seen {
            self.windows.remove(key);
        }
        debug!(
            evicted = seen.len(),
            capacity = self.capacity,
            "Evicted least recently seen windows"
        );
    }

    fn eviction_batch(&self) -> usize {
        (self.capacity / EVICTION_DIVISOR).max(1)
    }

    /// Admitted events in the current window for `key`, if tracked.
    pub fn count(&self, key: &IdentityKey) -> Option<u64> {
        let now = self.clock.now_millis();
        self.windows
            .get(key)
            .map(|state| if state.expired(now) { 0 } else { state.count })
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear all windows.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Default for FixedWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowCounter for FixedWindowCounter {
    async fn check(&self, policy: &Policy, key: &IdentityKey) -> Result<Decision, StoreError> {
        Ok(self.check_local(policy, key))
    }
}
