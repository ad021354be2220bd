//! Role-based policy selection.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::identity::{Identity, KeyRule};
use super::policy::{ExceededResponse, Policy, PolicySummary};
use super::registry::PolicyRegistry;
use crate::config::PolicyOverride;
use crate::error::Result;

/// Caller classes with their own ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Business,
    Driver,
    User,
}

impl Role {
    /// All roles, highest ceiling first.
    pub const ALL: [Role; 4] = [Role::Admin, Role::Business, Role::Driver, Role::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Business => "business",
            Role::Driver => "driver",
            Role::User => "user",
        }
    }

    /// Default per-minute ceiling for the role.
    fn default_max_per_minute(&self) -> u64 {
        match self {
            Role::Admin => 1000,
            Role::Business => 300,
            Role::Driver => 200,
            Role::User => 100,
        }
    }

    fn default_policy(&self) -> Policy {
        let name = format!("role-{}", self.as_str());
        Policy::builtin(
            &name,
            Duration::from_secs(60),
            self.default_max_per_minute(),
            KeyRule::Prefixed(format!("{}:", name)),
            ExceededResponse::new(
                "Too many requests for your account type, please slow down.",
                "ROLE_RATE_LIMIT_EXCEEDED",
            ),
        )
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "business" => Ok(Role::Business),
            "driver" => Ok(Role::Driver),
            "user" => Ok(Role::User),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects a policy from the caller's role.
///
/// Guests, callers without a role and unrecognized roles all get the
/// registry's general policy.
#[derive(Debug, Clone)]
pub struct RoleDispatcher {
    by_role: Vec<(Role, Arc<Policy>)>,
    fallback: Arc<Policy>,
}

impl RoleDispatcher {
    /// Default role ceilings, falling back to `registry`'s general policy.
    pub fn new(registry: &PolicyRegistry) -> Self {
        let by_role = Role::ALL
            .iter()
            .map(|role| (*role, Arc::new(role.default_policy())))
            .collect();
        Self {
            by_role,
            fallback: registry.general(),
        }
    }

    /// Role ceilings with configured overrides keyed by role label.
    pub fn with_overrides(
        registry: &PolicyRegistry,
        overrides: &HashMap<String, PolicyOverride>,
    ) -> Result<Self> {
        let mut dispatcher = Self::new(registry);
        for (label, tuning) in overrides {
            let Ok(role) = label.parse::<Role>() else {
                warn!(role = %label, "Ignoring override for unknown role");
                continue;
            };
            if let Some((_, policy)) = dispatcher.by_role.iter_mut().find(|(r, _)| *r == role) {
                *policy = Arc::new(policy.with_overrides(
                    tuning.window(),
                    tuning.max_events,
                    tuning.message.as_deref(),
                )?);
            }
        }
        Ok(dispatcher)
    }

    /// Pick the policy for a role label.
    pub fn select_policy(&self, role: Option<&str>) -> Arc<Policy> {
        let Some(label) = role else {
            return self.fallback.clone();
        };
        match label.parse::<Role>() {
            Ok(role) => self.policy_for(role),
            Err(()) => {
                debug!(role = %label, "Unrecognized role, using general policy");
                self.fallback.clone()
            }
        }
    }

    /// Pick the policy for the identity's role.
    pub fn select_for(&self, identity: &Identity) -> Arc<Policy> {
        self.select_policy(identity.role.as_deref())
    }

    pub fn policy_for(&self, role: Role) -> Arc<Policy> {
        self.by_role
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, policy)| policy.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn fallback(&self) -> Arc<Policy> {
        self.fallback.clone()
    }

    /// Role labels and their policies, highest ceiling first.
    pub fn summaries(&self) -> Vec<(Role, PolicySummary)> {
        self.by_role
            .iter()
            .map(|(role, policy)| (*role, PolicySummary::from(policy.as_ref())))
            .collect()
    }
}
