//! Immutable rate limit policies.

use std::time::Duration;

use serde::Serialize;

use super::identity::{Identity, IdentityKey, KeyRule};
use crate::error::{AdmissionError, Result};

/// HTTP status conventionally returned for an exceeded policy.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Longest window a policy may use: one year.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How a rejection under a policy is presented to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceededResponse {
    /// Human readable message
    pub message: String,
    /// Machine readable error tag
    pub error: String,
    /// Status code, normally 429
    pub status: u16,
}

impl ExceededResponse {
    pub fn new(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: error.into(),
            status: TOO_MANY_REQUESTS,
        }
    }
}

/// A rate limit policy: at most `max_events` admitted per `window`.
///
/// Policies are built once and shared; there is no way to change the
/// thresholds of a policy in use.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    window: Duration,
    max_events: u64,
    key_rule: KeyRule,
    on_exceeded: ExceededResponse,
}

impl Policy {
    /// Create a policy, rejecting a zero ceiling or a window that is zero or
    /// longer than [`MAX_WINDOW`].
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        max_events: u64,
        on_exceeded: ExceededResponse,
    ) -> Result<Self> {
        let name = name.into();
        if window.is_zero() {
            return Err(AdmissionError::InvalidPolicy {
                name,
                reason: "window must be positive".to_string(),
            });
        }
        if window > MAX_WINDOW {
            return Err(AdmissionError::InvalidPolicy {
                name,
                reason: format!("window must not exceed {}s", MAX_WINDOW.as_secs()),
            });
        }
        if max_events == 0 {
            return Err(AdmissionError::InvalidPolicy {
                name,
                reason: "max_events must be positive".to_string(),
            });
        }
        Ok(Self {
            name,
            window,
            max_events,
            key_rule: KeyRule::default(),
            on_exceeded,
        })
    }

    /// Construct a catalogue policy from known-good constants.
    pub(crate) fn builtin(
        name: &str,
        window: Duration,
        max_events: u64,
        key_rule: KeyRule,
        on_exceeded: ExceededResponse,
    ) -> Self {
        debug_assert!(!window.is_zero() && window <= MAX_WINDOW && max_events > 0);
        Self {
            name: name.to_string(),
            window,
            max_events,
            key_rule,
            on_exceeded,
        }
    }

    /// Replace the key rule, producing a new policy.
    pub fn with_key_rule(mut self, key_rule: KeyRule) -> Self {
        self.key_rule = key_rule;
        self
    }

    /// Derive a copy with different thresholds or message.
    pub(crate) fn with_overrides(
        &self,
        window: Option<Duration>,
        max_events: Option<u64>,
        message: Option<&str>,
    ) -> Result<Self> {
        let mut on_exceeded = self.on_exceeded.clone();
        if let Some(message) = message {
            on_exceeded.message = message.to_string();
        }
        Ok(Policy::new(
            self.name.clone(),
            window.unwrap_or(self.window),
            max_events.unwrap_or(self.max_events),
            on_exceeded,
        )?
        .with_key_rule(self.key_rule.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    pub fn key_rule(&self) -> &KeyRule {
        &self.key_rule
    }

    pub fn on_exceeded(&self) -> &ExceededResponse {
        &self.on_exceeded
    }

    /// Derive the identity key this policy counts `identity` under.
    pub fn identity_key(&self, identity: &Identity) -> IdentityKey {
        self.key_rule.derive(&self.name, identity)
    }
}

/// A serializable view of a policy's thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub name: String,
    pub window_secs: u64,
    pub max_events: u64,
    pub message: String,
}

impl From<&Policy> for PolicySummary {
    fn from(policy: &Policy) -> Self {
        Self {
            name: policy.name.clone(),
            window_secs: policy.window.as_secs(),
            max_events: policy.max_events,
            message: policy.on_exceeded.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> ExceededResponse {
        ExceededResponse::new("slow down", "RATE_LIMIT_EXCEEDED")
    }

    #[test]
    fn test_policy_rejects_zero_window() {
        let err = Policy::new("p", Duration::ZERO, 5, response()).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_policy_rejects_zero_max() {
        let err = Policy::new("p", Duration::from_secs(1), 0, response()).unwrap_err();
        assert!(err.to_string().contains("max_events"));
    }

    #[test]
    fn test_policy_rejects_window_beyond_max() {
        let err = Policy::new("p", MAX_WINDOW + Duration::from_secs(1), 1, response()).unwrap_err();
        assert!(err.to_string().contains("window"));
        assert!(Policy::new("p", MAX_WINDOW, 1, response()).is_ok());

        let err = Policy::new("p", Duration::from_secs(18_446_744_073_709_551), 1, response())
            .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_default_status_is_429() {
        let policy = Policy::new("p", Duration::from_secs(60), 3, response()).unwrap();
        assert_eq!(policy.on_exceeded().status, TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_identity_key_uses_rule() {
        let identity = Identity::anonymous().with_principal("u9");
        let policy = Policy::new("general", Duration::from_secs(60), 3, response()).unwrap();
        assert_eq!(policy.identity_key(&identity).as_str(), "general:u9");

        let policy = policy.with_key_rule(KeyRule::Prefixed("order:".to_string()));
        assert_eq!(policy.identity_key(&identity).as_str(), "order:u9");
    }

    #[test]
    fn test_overrides_keep_key_rule_and_name() {
        let policy = Policy::new("upload", Duration::from_secs(3600), 20, response())
            .unwrap()
            .with_key_rule(KeyRule::Prefixed("upload:".to_string()));

        let tuned = policy
            .with_overrides(None, Some(40), Some("uploads paused"))
            .unwrap();
        assert_eq!(tuned.name(), "upload");
        assert_eq!(tuned.window(), Duration::from_secs(3600));
        assert_eq!(tuned.max_events(), 40);
        assert_eq!(tuned.on_exceeded().message, "uploads paused");
        assert!(matches!(tuned.key_rule(), KeyRule::Prefixed(p) if p == "upload:"));

        // The original is untouched.
        assert_eq!(policy.max_events(), 20);
    }

    #[test]
    fn test_overrides_are_validated() {
        let policy = Policy::new("p", Duration::from_secs(1), 1, response()).unwrap();
        assert!(policy.with_overrides(Some(Duration::ZERO), None, None).is_err());
    }
}
