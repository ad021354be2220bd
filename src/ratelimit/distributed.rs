//! Distributed sliding-window counter backed by a shared store.
//!
//! Each identity key owns an ordered set of event timestamps in the store.
//! Every check trims events older than the window, counts the survivors and
//! records the new event if there is room, so all processes sharing the
//! store see the same log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::backend::WindowCounter;
use super::clock::{duration_millis, Clock, SystemClock};
use super::decision::{Decision, DecisionSource};
use super::identity::IdentityKey;
use super::policy::Policy;
use super::store::{AtomicAdmit, AtomicOutcome, SharedStore};
use crate::error::StoreError;

/// Default bound on one admission round trip to the store.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Default prefix prepended to identity keys in the store.
pub const DEFAULT_KEY_PREFIX: &str = "admission:";

/// How the trim/count/add sequence is issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlidingWindowMode {
    /// Separate store calls. Concurrent checks for one key can admit a few
    /// more than the ceiling.
    #[default]
    Sequential,
    /// One server-side compare-and-add. Holds the ceiling exactly.
    Atomic,
}

/// Current usage of a key, read without recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    /// Events still inside the window
    pub count: u64,
    /// Seconds until the store drops the key
    pub ttl_secs: Option<u64>,
}

/// A sliding-window (log based) counter over a [`SharedStore`].
pub struct SlidingWindowCounter<S: SharedStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    timeout: Duration,
    mode: SlidingWindowMode,
}

impl<S: SharedStore> SlidingWindowCounter<S> {
    /// Create a counter on the system clock with default settings.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
            mode: SlidingWindowMode::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: SlidingWindowMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> SlidingWindowMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn store_key(&self, key: &IdentityKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Count one attempt for `key` under `policy`.
    ///
    /// The whole exchange with the store is bounded by the configured
    /// timeout; running out of time is reported as [`StoreError::Timeout`].
    pub async fn check_distributed(
        &self,
        policy: &Policy,
        key: &IdentityKey,
    ) -> Result<Decision, StoreError> {
        let store_key = self.store_key(key);
        let attempt = async {
            match self.mode {
                SlidingWindowMode::Sequential => self.check_sequential(policy, &store_key).await,
                SlidingWindowMode::Atomic => self.check_atomic(policy, &store_key).await,
            }
        };

        let decision = tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        trace!(
            policy = policy.name(),
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Sliding window check"
        );
        if !decision.allowed {
            debug!(
                policy = policy.name(),
                key = %key,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Distributed rate limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn check_sequential(&self, policy: &Policy, store_key: &str) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let window = duration_millis(policy.window());
        let max = policy.max_events();

        self.store.remove_before(store_key, trim_cutoff(now, window)).await?;
        let count = self.store.cardinality(store_key).await?;

        if count >= max {
            let earliest = self.store.earliest(store_key).await?.unwrap_or(now);
            return Ok(Self::full(max, earliest, window, now));
        }

        // Not atomic with the count above: concurrent callers can all pass
        // the check before any of them adds.
        self.store
            .add_expiring(store_key, now, &unique_member(now), ttl_secs(policy.window()))
            .await?;

        Ok(Decision::admitted(
            max,
            max - count - 1,
            policy.window(),
            now,
            DecisionSource::Distributed,
        ))
    }

    async fn check_atomic(&self, policy: &Policy, store_key: &str) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let window = duration_millis(policy.window());
        let max = policy.max_events();
        let member = unique_member(now);

        let request = AtomicAdmit {
            now,
            window_start: trim_cutoff(now, window),
            max_events: max,
            member: &member,
            ttl_secs: ttl_secs(policy.window()),
        };

        Ok(match self.store.admit_atomic(store_key, request).await? {
            AtomicOutcome::Added { count } => Decision::admitted(
                max,
                max.saturating_sub(count),
                policy.window(),
                now,
                DecisionSource::Distributed,
            ),
            AtomicOutcome::Full { earliest } => Self::full(max, earliest, window, now),
        })
    }

    fn full(max: u64, earliest: u64, window: u64, now: u64) -> Decision {
        let retry_after = Duration::from_millis(earliest.saturating_add(window).saturating_sub(now));
        Decision::rejected(max, retry_after, now, DecisionSource::Distributed)
    }

    /// Read the usage of `key` without recording an event.
    pub async fn usage(&self, policy: &Policy, key: &IdentityKey) -> Result<WindowUsage, StoreError> {
        let store_key = self.store_key(key);
        let now = self.clock.now_millis();
        let window_start = trim_cutoff(now, duration_millis(policy.window()));

        let read = async {
            self.store.remove_before(&store_key, window_start).await?;
            let count = self.store.cardinality(&store_key).await?;
            let ttl_secs = self.store.ttl(&store_key).await?;
            Ok::<_, StoreError>(WindowUsage { count, ttl_secs })
        };
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl<S: SharedStore + 'static> WindowCounter for SlidingWindowCounter<S> {
    async fn check(&self, policy: &Policy, key: &IdentityKey) -> Result<Decision, StoreError> {
        self.check_distributed(policy, key).await
    }
}

/// Lowest score still inside the trailing window `(now - window, now]`.
///
/// An event exactly one window old is out, so a caller that waits the
/// reported retry-after finds room.
fn trim_cutoff(now: u64, window: u64) -> u64 {
    now.saturating_add(1).saturating_sub(window)
}

/// Member value for an event at `now`; the score alone is not unique.
fn unique_member(now: u64) -> String {
    format!("{}-{:016x}", now, rand::random::<u64>())
}

/// Key expiry for a window, rounded up to whole seconds.
fn ttl_secs(window: Duration) -> u64 {
    let secs = window.as_secs();
    if window.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs.max(1)
    }
}
