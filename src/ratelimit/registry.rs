//! Catalogue of named policies.
//!
//! The registry is built once at startup, optionally with configured
//! threshold overrides, and shared read-only afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::identity::KeyRule;
use super::policy::{ExceededResponse, Policy, PolicySummary};
use crate::config::PolicyOverride;
use crate::error::Result;

pub const GENERAL: &str = "general";
pub const AUTH: &str = "auth";
pub const STRICT: &str = "strict";
pub const ORDER_CREATION: &str = "order-creation";
pub const RESERVATION_CREATION: &str = "reservation-creation";
pub const RATING_CREATION: &str = "rating-creation";
pub const NOTIFICATION: &str = "notification";
pub const UPLOAD: &str = "upload";
pub const BUSINESS_REGISTRATION: &str = "business-registration";
pub const WALLET_TOPUP: &str = "wallet-topup";
pub const PASSWORD_RESET: &str = "password-reset";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// How a catalogue entry keys its counters.
enum Keying {
    Namespaced,
    Prefixed(&'static str),
    Address(&'static str),
}

struct Entry {
    name: &'static str,
    window_secs: u64,
    max_events: u64,
    keying: Keying,
    message: &'static str,
    error: &'static str,
}

const CATALOGUE: &[Entry] = &[
    Entry {
        name: GENERAL,
        window_secs: 15 * MINUTE,
        max_events: 100,
        keying: Keying::Namespaced,
        message: "Too many requests from this client, please try again later.",
        error: "RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: AUTH,
        window_secs: 15 * MINUTE,
        max_events: 5,
        keying: Keying::Address("auth:"),
        message: "Too many authentication attempts, please try again after 15 minutes.",
        error: "AUTH_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: STRICT,
        window_secs: 10 * MINUTE,
        max_events: 10,
        keying: Keying::Namespaced,
        message: "Too many requests for this operation, please try again later.",
        error: "STRICT_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: ORDER_CREATION,
        window_secs: HOUR,
        max_events: 50,
        keying: Keying::Prefixed("order:"),
        message: "Too many orders created, please try again later.",
        error: "ORDER_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: RESERVATION_CREATION,
        window_secs: DAY,
        max_events: 10,
        keying: Keying::Prefixed("reservation:"),
        message: "Daily reservation limit reached, please try again tomorrow.",
        error: "RESERVATION_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: RATING_CREATION,
        window_secs: HOUR,
        max_events: 20,
        keying: Keying::Prefixed("rating:"),
        message: "Too many ratings submitted, please try again later.",
        error: "RATING_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: NOTIFICATION,
        window_secs: DAY,
        max_events: 100,
        keying: Keying::Prefixed("notification:"),
        message: "Daily notification limit reached.",
        error: "NOTIFICATION_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: UPLOAD,
        window_secs: HOUR,
        max_events: 20,
        keying: Keying::Prefixed("upload:"),
        message: "Too many uploads, please try again later.",
        error: "UPLOAD_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: BUSINESS_REGISTRATION,
        window_secs: DAY,
        max_events: 3,
        keying: Keying::Prefixed("business:"),
        message: "Too many business registrations, please try again tomorrow.",
        error: "BUSINESS_REGISTRATION_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: WALLET_TOPUP,
        window_secs: HOUR,
        max_events: 5,
        keying: Keying::Prefixed("wallet:"),
        message: "Too many wallet top-ups, please try again later.",
        error: "WALLET_TOPUP_RATE_LIMIT_EXCEEDED",
    },
    Entry {
        name: PASSWORD_RESET,
        window_secs: HOUR,
        max_events: 3,
        keying: Keying::Address("password-reset:"),
        message: "Too many password reset requests, please try again after an hour.",
        error: "PASSWORD_RESET_RATE_LIMIT_EXCEEDED",
    },
];

impl Entry {
    fn to_policy(&self) -> Policy {
        let key_rule = match self.keying {
            Keying::Namespaced => KeyRule::Namespaced,
            Keying::Prefixed(prefix) => KeyRule::Prefixed(prefix.to_string()),
            Keying::Address(prefix) => KeyRule::Address(prefix.to_string()),
        };
        Policy::builtin(
            self.name,
            Duration::from_secs(self.window_secs),
            self.max_events,
            key_rule,
            ExceededResponse::new(self.message, self.error),
        )
    }
}

/// An immutable catalogue of named policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Arc<Policy>>,
    general: Arc<Policy>,
}

impl PolicyRegistry {
    /// The catalogue with its default thresholds.
    pub fn builtin() -> Self {
        let policies: BTreeMap<String, Arc<Policy>> = CATALOGUE
            .iter()
            .map(|entry| (entry.name.to_string(), Arc::new(entry.to_policy())))
            .collect();
        let general = Arc::new(CATALOGUE[0].to_policy());
        Self { policies, general }
    }

    /// The catalogue with configured threshold overrides applied.
    ///
    /// Overrides naming a policy outside the catalogue are logged and skipped.
    pub fn from_overrides(overrides: &HashMap<String, PolicyOverride>) -> Result<Self> {
        let mut registry = Self::builtin();
        for (name, tuning) in overrides {
            let Some(current) = registry.policies.get(name) else {
                warn!(policy = %name, "Ignoring override for unknown policy");
                continue;
            };
            let tuned = Arc::new(current.with_overrides(
                tuning.window(),
                tuning.max_events,
                tuning.message.as_deref(),
            )?);
            info!(
                policy = %name,
                window_secs = tuned.window().as_secs(),
                max_events = tuned.max_events(),
                "Applied policy override"
            );
            if name == GENERAL {
                registry.general = tuned.clone();
            }
            registry.policies.insert(name.clone(), tuned);
        }
        Ok(registry)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    /// The general policy, used wherever no better match exists.
    pub fn general(&self) -> Arc<Policy> {
        self.general.clone()
    }

    /// Look up a policy by name, falling back to the general policy.
    pub fn get_or_general(&self, name: &str) -> Arc<Policy> {
        match self.get(name) {
            Some(policy) => policy,
            None => {
                debug!(policy = %name, "Unknown policy name, using general policy");
                self.general()
            }
        }
    }

    /// Policy names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn summaries(&self) -> Vec<PolicySummary> {
        self.iter().map(|p| PolicySummary::from(p.as_ref())).collect()
    }

    /// Build a standalone policy for one endpoint.
    ///
    /// Each call gets its own namespace, so two endpoints with identical
    /// thresholds still count separately. The catalogue is not touched.
    pub fn make_endpoint_policy(
        window: Duration,
        max_events: u64,
        message: impl Into<String>,
    ) -> Result<Policy> {
        let name = format!("endpoint-{}", uuid::Uuid::new_v4().simple());
        Policy::new(
            name,
            window,
            max_events,
            ExceededResponse::new(message, "RATE_LIMIT_EXCEEDED"),
        )
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
