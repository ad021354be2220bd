//! The admission gate: one call per request, one decision out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, trace, warn};

use super::backend::WindowCounter;
use super::clock::{Clock, SystemClock};
use super::counter::FixedWindowCounter;
use super::decision::{Decision, DecisionSource};
use super::distributed::SlidingWindowCounter;
use super::identity::{Identity, IdentityKey};
use super::policy::Policy;
use super::redis_store::RedisStore;
use super::roles::RoleDispatcher;
use crate::config::AdmissionConfig;
use crate::error::Result;

/// Decides whether requests may proceed.
///
/// With a distributed counter configured, every check goes to the shared
/// store first. If the store fails or times out the same check is re-run on
/// the local fixed-window counter, so an unreachable store degrades
/// accuracy instead of availability. Nothing in here returns an error to the
/// caller; the only negative outcome is a rejected [`Decision`].
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct AdmissionGate {
    /// In-process counter, primary when no store is configured
    local: Arc<FixedWindowCounter>,
    /// Shared-store counter, if configured
    distributed: Option<Arc<dyn WindowCounter>>,
    /// Checks answered by the local counter because the store failed
    fallbacks: AtomicU64,
}

impl AdmissionGate {
    /// A gate that only counts in process.
    pub fn local(local: Arc<FixedWindowCounter>) -> Self {
        Self {
            local,
            distributed: None,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// A gate that counts in the shared store and falls back to `local`.
    pub fn distributed(distributed: Arc<dyn WindowCounter>, local: Arc<FixedWindowCounter>) -> Self {
        Self {
            local,
            distributed: Some(distributed),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Build a gate from configuration on the system clock.
    ///
    /// A configured store URL selects the Redis sliding-window counter; the
    /// server is not contacted until the first check.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let local = Arc::new(FixedWindowCounter::with_clock(
            config.local.cache_size,
            clock.clone(),
        ));

        let Some(url) = config.store.url.as_deref() else {
            info!(capacity = local.capacity(), "Admission gate using local counter only");
            return Ok(Self::local(local));
        };

        let store = Arc::new(RedisStore::open(url)?);
        let counter = SlidingWindowCounter::new(store)
            .with_clock(clock)
            .with_key_prefix(config.store.key_prefix.clone())
            .with_timeout(Duration::from_millis(config.store.timeout_ms))
            .with_mode(config.store.mode);
        info!(
            mode = ?config.store.mode,
            timeout_ms = config.store.timeout_ms,
            "Admission gate using shared store with local fallback"
        );
        Ok(Self::distributed(Arc::new(counter), local))
    }

    /// Decide whether `identity` may proceed under `policy`.
    pub async fn admit(&self, policy: &Policy, identity: &Identity) -> Decision {
        let key = policy.identity_key(identity);
        self.admit_key(policy, &key).await
    }

    /// Decide for an already derived identity key.
    pub async fn admit_key(&self, policy: &Policy, key: &IdentityKey) -> Decision {
        trace!(policy = policy.name(), key = %key, "Evaluating admission");

        let Some(distributed) = &self.distributed else {
            return self.local.check_local(policy, key);
        };

        match distributed.check(policy, key).await {
            Ok(decision) => decision,
            Err(error) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    policy = policy.name(),
                    key = %key,
                    error = %error,
                    "Shared store unavailable, falling back to local counter"
                );
                self.local
                    .check_local(policy, key)
                    .with_source(DecisionSource::Fallback)
            }
        }
    }

    /// Select the policy for the identity's role, then admit under it.
    pub async fn admit_for_role(
        &self,
        dispatcher: &RoleDispatcher,
        identity: &Identity,
    ) -> (Arc<Policy>, Decision) {
        let policy = dispatcher.select_for(identity);
        let decision = self.admit(&policy, identity).await;
        (policy, decision)
    }

    /// Number of checks answered by the local counter after a store failure.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn local_counter(&self) -> &Arc<FixedWindowCounter> {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::distributed::SlidingWindowMode;
    use crate::ratelimit::policy::ExceededResponse;
    use crate::ratelimit::registry::{PolicyRegistry, AUTH};
    use crate::ratelimit::store::{AtomicAdmit, AtomicOutcome, InMemoryStore, SharedStore};
    use async_trait::async_trait;
    use futures::future::join_all;

    /// A store whose every call fails.
    struct BrokenStore;

    #[async_trait]
    impl SharedStore for BrokenStore {
        async fn remove_before(&self, _: &str, _: u64) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn cardinality(&self, _: &str) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn earliest(&self, _: &str) -> std::result::Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn add(&self, _: &str, _: u64, _: &str) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn add_expiring(
            &self,
            _: &str,
            _: u64,
            _: &str,
            _: u64,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn ttl(&self, _: &str) -> std::result::Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn admit_atomic(
            &self,
            _: &str,
            _: AtomicAdmit<'_>,
        ) -> std::result::Result<AtomicOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    /// A store that never answers in time.
    struct HangingStore;

    impl HangingStore {
        async fn hang<T>() -> std::result::Result<T, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Unavailable("unreachable".into()))
        }
    }

    #[async_trait]
    impl SharedStore for HangingStore {
        async fn remove_before(&self, _: &str, _: u64) -> std::result::Result<u64, StoreError> {
            Self::hang().await
        }
        async fn cardinality(&self, _: &str) -> std::result::Result<u64, StoreError> {
            Self::hang().await
        }
        async fn earliest(&self, _: &str) -> std::result::Result<Option<u64>, StoreError> {
            Self::hang().await
        }
        async fn add(&self, _: &str, _: u64, _: &str) -> std::result::Result<(), StoreError> {
            Self::hang().await
        }
        async fn expire(&self, _: &str, _: u64) -> std::result::Result<(), StoreError> {
            Self::hang().await
        }
        async fn add_expiring(
            &self,
            _: &str,
            _: u64,
            _: &str,
            _: u64,
        ) -> std::result::Result<(), StoreError> {
            Self::hang().await
        }
        async fn ttl(&self, _: &str) -> std::result::Result<Option<u64>, StoreError> {
            Self::hang().await
        }
        async fn admit_atomic(
            &self,
            _: &str,
            _: AtomicAdmit<'_>,
        ) -> std::result::Result<AtomicOutcome, StoreError> {
            Self::hang().await
        }
    }

    fn scenario_policy() -> Policy {
        Policy::new(
            "scenario",
            Duration::from_secs(60),
            3,
            ExceededResponse::new("Too many requests", "RATE_LIMIT_EXCEEDED"),
        )
        .unwrap()
    }

    fn local_gate(clock: &ManualClock) -> AdmissionGate {
        AdmissionGate::local(Arc::new(FixedWindowCounter::with_clock(
            1_000,
            Arc::new(clock.clone()),
        )))
    }

    fn gate_over<S: SharedStore + 'static>(store: S, clock: &ManualClock) -> AdmissionGate {
        let counter = SlidingWindowCounter::new(Arc::new(store))
            .with_clock(Arc::new(clock.clone()))
            .with_timeout(Duration::from_millis(50));
        AdmissionGate::distributed(
            Arc::new(counter),
            Arc::new(FixedWindowCounter::with_clock(1_000, Arc::new(clock.clone()))),
        )
    }

    async fn run(gate: &AdmissionGate, policy: &Policy, identity: &Identity, n: usize) -> Vec<bool> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(gate.admit(policy, identity).await.allowed);
        }
        results
    }

    #[tokio::test]
    async fn test_scenario_fourth_call_rejected_with_retry_after() {
        let clock = ManualClock::new(1_000_000);
        let gate = local_gate(&clock);
        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");

        for _ in 0..3 {
            assert!(gate.admit(&policy, &identity).await.allowed);
            clock.advance(Duration::from_millis(300));
        }

        let decision = gate.admit(&policy, &identity).await;
        assert!(!decision.allowed);
        let retry = decision.retry_after_secs();
        assert!((59..=60).contains(&retry), "retry_after was {}", retry);

        let rejection = decision.rejection(&policy).unwrap();
        assert_eq!(rejection.status, 429);
        assert_eq!(rejection.retry_after, retry);
    }

    #[tokio::test]
    async fn test_scenario_window_reset_after_wait() {
        let clock = ManualClock::new(1_000_000);
        let gate = local_gate(&clock);
        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");

        assert_eq!(run(&gate, &policy, &identity, 3).await, vec![true, true, true]);
        clock.advance(Duration::from_secs(61));
        assert!(gate.admit(&policy, &identity).await.allowed);
    }

    #[tokio::test]
    async fn test_distributed_window_recovery() {
        let clock = ManualClock::new(1_000_000);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let gate = gate_over(store, &clock);
        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");

        assert_eq!(run(&gate, &policy, &identity, 4).await, vec![true, true, true, false]);
        let decision = gate.admit(&policy, &identity).await;
        assert_eq!(decision.source, DecisionSource::Distributed);

        clock.advance(decision.retry_after);
        assert!(gate.admit(&policy, &identity).await.allowed);
        assert_eq!(gate.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_isolation_between_identities() {
        let clock = ManualClock::new(0);
        let gate = local_gate(&clock);
        let policy = scenario_policy();
        let a = Identity::anonymous().with_principal("a");
        let b = Identity::anonymous().with_principal("b");

        run(&gate, &policy, &a, 4).await;
        let decision = gate.admit(&policy, &b).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_to_local() {
        let clock = ManualClock::new(1_000_000);
        let gate = gate_over(BrokenStore, &clock);
        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");

        let decisions: Vec<Decision> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(gate.admit(&policy, &identity).await);
            }
            out
        };
        let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
        assert_eq!(allowed, vec![true, true, true, false]);
        assert!(decisions.iter().all(|d| d.source == DecisionSource::Fallback));
        assert_eq!(gate.fallback_count(), 4);

        // Fixed-window recovery still applies on the fallback path
        clock.advance(Duration::from_secs(60));
        assert!(gate.admit(&policy, &identity).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_match_local_sequence() {
        let clock = ManualClock::new(1_000_000);
        let timing_out = gate_over(HangingStore, &clock);
        let local_only = local_gate(&clock);
        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");

        let expected = run(&local_only, &policy, &identity, 4).await;
        let actual = run(&timing_out, &policy, &identity, 4).await;
        assert_eq!(expected, vec![true, true, true, false]);
        assert_eq!(actual, expected);
        assert_eq!(timing_out.fallback_count(), 4);
    }

    #[tokio::test]
    async fn test_shared_key_shares_accounting() {
        let clock = ManualClock::new(0);
        let gate = local_gate(&clock);
        let registry = PolicyRegistry::builtin();
        let first = registry.get(AUTH).unwrap();
        let second = registry.get(AUTH).unwrap();
        let identity = Identity::anonymous().with_address("10.9.8.7".parse().unwrap());

        for i in 0..5 {
            let policy = if i % 2 == 0 { &first } else { &second };
            assert!(gate.admit(policy, &identity).await.allowed);
        }
        assert!(!gate.admit(&first, &identity).await.allowed);
        assert!(!gate.admit(&second, &identity).await.allowed);
    }

    #[tokio::test]
    async fn test_catalogue_policies_count_separately() {
        let clock = ManualClock::new(0);
        let gate = local_gate(&clock);
        let registry = PolicyRegistry::builtin();
        let identity = Identity::anonymous()
            .with_principal("u1")
            .with_address("10.0.0.1".parse().unwrap());

        let wallet = registry.get("wallet-topup").unwrap();
        run(&gate, &wallet, &identity, 6).await;
        assert!(!gate.admit(&wallet, &identity).await.allowed);

        let general = registry.general();
        let decision = gate.admit(&general, &identity).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn test_admit_for_role() {
        let clock = ManualClock::new(0);
        let gate = local_gate(&clock);
        let dispatcher = RoleDispatcher::new(&PolicyRegistry::builtin());

        let admin = Identity::anonymous().with_principal("a1").with_role("admin");
        let (policy, decision) = gate.admit_for_role(&dispatcher, &admin).await;
        assert_eq!(policy.max_events(), 1000);
        assert_eq!(decision.remaining, 999);

        let mascot = Identity::anonymous().with_principal("m1").with_role("mascot");
        let (policy, decision) = gate.admit_for_role(&dispatcher, &mascot).await;
        assert_eq!(policy.name(), "general");
        assert_eq!(decision.limit, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_atomic_mode_holds_ceiling_under_concurrency() {
        let clock = ManualClock::new(0);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let counter = SlidingWindowCounter::new(store)
            .with_clock(Arc::new(clock.clone()))
            .with_mode(SlidingWindowMode::Atomic);
        let gate = Arc::new(AdmissionGate::distributed(
            Arc::new(counter),
            Arc::new(FixedWindowCounter::with_clock(10, Arc::new(clock.clone()))),
        ));
        let policy = Arc::new(scenario_policy());

        let tasks = (0..32).map(|_| {
            let gate = gate.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                let identity = Identity::anonymous().with_principal("k");
                gate.admit(&policy, &identity).await.allowed
            })
        });
        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 3);
    }

    /// A store that yields between calls so checks interleave.
    struct InterleavingStore(InMemoryStore);

    #[async_trait]
    impl SharedStore for InterleavingStore {
        async fn remove_before(&self, k: &str, s: u64) -> std::result::Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.remove_before(k, s).await
        }
        async fn cardinality(&self, k: &str) -> std::result::Result<u64, StoreError> {
            let count = self.0.cardinality(k).await;
            tokio::task::yield_now().await;
            count
        }
        async fn earliest(&self, k: &str) -> std::result::Result<Option<u64>, StoreError> {
            self.0.earliest(k).await
        }
        async fn add(&self, k: &str, s: u64, m: &str) -> std::result::Result<(), StoreError> {
            self.0.add(k, s, m).await
        }
        async fn expire(&self, k: &str, t: u64) -> std::result::Result<(), StoreError> {
            self.0.expire(k, t).await
        }
        async fn add_expiring(
            &self,
            k: &str,
            s: u64,
            m: &str,
            t: u64,
        ) -> std::result::Result<(), StoreError> {
            self.0.add_expiring(k, s, m, t).await
        }
        async fn ttl(&self, k: &str) -> std::result::Result<Option<u64>, StoreError> {
            self.0.ttl(k).await
        }
        async fn admit_atomic(
            &self,
            k: &str,
            r: AtomicAdmit<'_>,
        ) -> std::result::Result<AtomicOutcome, StoreError> {
            self.0.admit_atomic(k, r).await
        }
    }

    #[tokio::test]
    async fn test_sequential_mode_can_overshoot_under_concurrency() {
        // Check-then-act race: every check counts before any adds.
        let clock = ManualClock::new(0);
        let store = InterleavingStore(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let gate = gate_over(store, &clock);
        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");

        let checks = (0..6).map(|_| gate.admit(&policy, &identity));
        let admitted = join_all(checks).await.iter().filter(|d| d.allowed).count();
        assert!(admitted > 3, "expected overshoot, admitted {}", admitted);
        assert_eq!(gate.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_from_config_local_only() {
        let config = AdmissionConfig::default();
        let gate = AdmissionGate::from_config(&config).unwrap();
        assert!(!gate.is_distributed());
        assert_eq!(gate.local_counter().capacity(), config.local.cache_size);
    }

    #[tokio::test]
    async fn test_from_config_unreachable_redis_falls_back() {
        let mut config = AdmissionConfig::default();
        config.store.url = Some("redis://127.0.0.1:1/".to_string());
        config.store.timeout_ms = 100;
        let clock = ManualClock::new(0);
        let gate = AdmissionGate::from_config_with_clock(&config, Arc::new(clock)).unwrap();
        assert!(gate.is_distributed());

        let policy = scenario_policy();
        let identity = Identity::anonymous().with_principal("k");
        let decision = gate.admit(&policy, &identity).await;
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Fallback);
    }
}
