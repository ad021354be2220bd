//! Shared ordered-set store used by the sliding-window counter.
//!
//! The store keeps one ordered set per identity key whose members are
//! admitted events scored by their timestamp in milliseconds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Parameters of a single-round-trip compare-and-add.
#[derive(Debug, Clone, Copy)]
pub struct AtomicAdmit<'a> {
    /// Score of the new event
    pub now: u64,
    /// Events scored below this are trimmed first
    pub window_start: u64,
    /// Ceiling checked after the trim
    pub max_events: u64,
    /// Unique member value for the new event
    pub member: &'a str,
    /// Key expiry to set when the event is added
    pub ttl_secs: u64,
}

/// Result of an atomic compare-and-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOutcome {
    /// The event was added; `count` includes it
    Added { count: u64 },
    /// The set was full; `earliest` is the oldest surviving score
    Full { earliest: u64 },
}

/// A network-accessible store with ordered-set primitives.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Remove members scored strictly below `min_score`, returning how many.
    async fn remove_before(&self, key: &str, min_score: u64) -> Result<u64, StoreError>;

    /// Number of members in the set.
    async fn cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Lowest score in the set.
    async fn earliest(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Add `member` with `score`.
    async fn add(&self, key: &str, score: u64, member: &str) -> Result<(), StoreError>;

    /// Set the key's expiry in seconds.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Add `member` and set the key's expiry as one write.
    ///
    /// Either both take effect or neither does, so an added event never
    /// leaves a key without expiry.
    async fn add_expiring(
        &self,
        key: &str,
        score: u64,
        member: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    /// Remaining expiry in seconds, if the key exists and has one.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Trim, count, and add-if-below-ceiling in one indivisible step.
    async fn admit_atomic(
        &self,
        key: &str,
        request: AtomicAdmit<'_>,
    ) -> Result<AtomicOutcome, StoreError>;
}

#[derive(Debug, Default)]
struct OrderedSet {
    members: BTreeSet<(u64, String)>,
    expires_at: Option<u64>,
}

impl OrderedSet {
    fn remove_before(&mut self, min_score: u64) -> u64 {
        let kept = self.members.split_off(&(min_score, String::new()));
        let removed = self.members.len() as u64;
        self.members = kept;
        removed
    }

    fn insert(&mut self, score: u64, member: &str) {
        self.members.retain(|(_, m)| m != member);
        self.members.insert((score, member.to_string()));
    }

    fn earliest(&self) -> Option<u64> {
        self.members.first().map(|(score, _)| *score)
    }

    fn live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Store calls between full sweeps of expired keys.
pub const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Default)]
struct Sets {
    map: HashMap<String, OrderedSet>,
    calls_since_sweep: u64,
}

impl Sets {
    /// Drop every expired key once every [`SWEEP_INTERVAL`] calls.
    fn maybe_sweep(&mut self, now: u64) {
        self.calls_since_sweep += 1;
        if self.calls_since_sweep < SWEEP_INTERVAL {
            return;
        }
        self.calls_since_sweep = 0;
        let before = self.map.len();
        self.map.retain(|_, set| set.live(now));
        let swept = before - self.map.len();
        if swept > 0 {
            trace!(swept, remaining = self.map.len(), "Swept expired store keys");
        }
    }
}

/// Process-local implementation of [`SharedStore`].
///
/// Every counter holding a clone of the same `Arc<InMemoryStore>` shares
/// accounting, which makes it suitable for single-node deployments and for
/// simulating several workers in tests. Expiry follows Redis: a key whose
/// expiry has passed, or whose set became empty, no longer exists. Keys
/// nobody touches again are reclaimed by a sweep every [`SWEEP_INTERVAL`]
/// store calls.
#[derive(Debug)]
pub struct InMemoryStore {
    sets: Mutex<Sets>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sets: Mutex::new(Sets::default()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.sets.lock().map.values().filter(|set| set.live(now)).count()
    }

    /// Number of keys held in memory, including expired ones not yet swept.
    pub fn retained_keys(&self) -> usize {
        self.sets.lock().map.len()
    }

    fn with_set<T>(&self, key: &str, f: impl FnOnce(&mut OrderedSet) -> T) -> T {
        let now = self.clock.now_millis();
        let mut sets = self.sets.lock();
        sets.maybe_sweep(now);

        let expired = sets.map.get(key).is_some_and(|set| !set.live(now));
        if expired {
            sets.map.remove(key);
        }

        let set = sets.map.entry(key.to_string()).or_default();
        let result = f(set);
        if set.members.is_empty() {
            sets.map.remove(key);
        }
        result
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn remove_before(&self, key: &str, min_score: u64) -> Result<u64, StoreError> {
        Ok(self.with_set(key, |set| set.remove_before(min_score)))
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.with_set(key, |set| set.members.len() as u64))
    }

    async fn earliest(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.with_set(key, |set| set.earliest()))
    }

    async fn add(&self, key: &str, score: u64, member: &str) -> Result<(), StoreError> {
        self.with_set(key, |set| set.insert(score, member));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let at = self.clock.now_millis().saturating_add(ttl_secs.saturating_mul(1000));
        self.with_set(key, |set| set.expires_at = Some(at));
        Ok(())
    }

    async fn add_expiring(
        &self,
        key: &str,
        score: u64,
        member: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let at = self.clock.now_millis().saturating_add(ttl_secs.saturating_mul(1000));
        self.with_set(key, |set| {
            set.insert(score, member);
            set.expires_at = Some(at);
        });
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.with_set(key, |set| {
            set.expires_at.map(|at| at.saturating_sub(now).div_ceil(1000))
        }))
    }

    async fn admit_atomic(
        &self,
        key: &str,
        request: AtomicAdmit<'_>,
    ) -> Result<AtomicOutcome, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.with_set(key, |set| {
            set.remove_before(request.window_start);
            let count = set.members.len() as u64;
            if count >= request.max_events {
                let earliest = set.earliest().unwrap_or(request.now);
                return AtomicOutcome::Full { earliest };
            }
            set.insert(request.now, request.member);
            set.expires_at = Some(now.saturating_add(request.ttl_secs.saturating_mul(1000)));
            AtomicOutcome::Added { count: count + 1 }
        }))
    }
}
