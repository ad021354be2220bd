//! Request identities and identity key derivation.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Subject used when a request carries neither a principal nor an address.
pub const UNKNOWN_SUBJECT: &str = "unknown";

/// The caller of a request, as seen by admission control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated principal identifier, if any
    pub principal: Option<String>,
    /// Network address of the caller, if known
    pub address: Option<IpAddr>,
    /// Role label assigned by the authentication layer
    pub role: Option<String>,
}

impl Identity {
    /// An identity with nothing known about the caller.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        let principal = principal.into();
        self.principal = if principal.is_empty() { None } else { Some(principal) };
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_peer(self, peer: SocketAddr) -> Self {
        self.with_address(peer.ip())
    }

    /// Take the address from an `X-Forwarded-For` style header.
    ///
    /// The first entry that parses as an IP address is the client; the rest
    /// are proxies. Unparseable headers leave the identity unchanged.
    pub fn with_forwarded_for(mut self, header: &str) -> Self {
        if let Some(addr) = parse_forwarded_for(header) {
            self.address = Some(addr);
        }
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// The rate-limited subject: principal, else address, else `unknown`.
    pub fn subject(&self) -> String {
        if let Some(principal) = &self.principal {
            return principal.clone();
        }
        self.address_subject()
    }

    /// The caller's address, ignoring any principal.
    pub fn address_subject(&self) -> String {
        match self.address {
            Some(addr) => addr.to_string(),
            None => UNKNOWN_SUBJECT.to_string(),
        }
    }
}

fn parse_forwarded_for(header: &str) -> Option<IpAddr> {
    header
        .split(',')
        .map(str::trim)
        .find_map(|candidate| {
            candidate
                .parse::<IpAddr>()
                .ok()
                .or_else(|| candidate.parse::<SocketAddr>().ok().map(|s| s.ip()))
        })
}

/// Rule deriving an identity key from an identity for one policy.
#[derive(Clone, Default)]
pub enum KeyRule {
    /// `<policy name>:<subject>`
    #[default]
    Namespaced,
    /// `<prefix><subject>`
    Prefixed(String),
    /// `<prefix><address>`, ignoring the principal
    Address(String),
    /// Caller-supplied derivation; the result is used as-is
    Custom(fn(&Identity) -> String),
}

impl std::fmt::Debug for KeyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyRule::Namespaced => f.write_str("Namespaced"),
            KeyRule::Prefixed(prefix) => f.debug_tuple("Prefixed").field(prefix).finish(),
            KeyRule::Address(prefix) => f.debug_tuple("Address").field(prefix).finish(),
            KeyRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl KeyRule {
    /// Derive the key for `identity` under the policy named `policy`.
    pub fn derive(&self, policy: &str, identity: &Identity) -> IdentityKey {
        let key = match self {
            KeyRule::Namespaced => format!("{}:{}", policy, identity.subject()),
            KeyRule::Prefixed(prefix) => format!("{}{}", prefix, identity.subject()),
            KeyRule::Address(prefix) => format!("{}{}", prefix, identity.address_subject()),
            KeyRule::Custom(f) => f(identity),
        };
        IdentityKey(key)
    }
}

/// A key that buckets admitted events for rate counting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
