//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod decision;
mod distributed;
mod gate;
mod identity;
mod policy;
mod redis_store;
mod registry;
mod roles;
mod store;

pub use backend::WindowCounter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{FixedWindowCounter, DEFAULT_CAPACITY};
pub use decision::{Decision, DecisionSource, HeaderStyle, Rejection};
pub use distributed::{
    SlidingWindowCounter, SlidingWindowMode, WindowUsage, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT,
};
pub use gate::AdmissionGate;
pub use identity::{Identity, IdentityKey, KeyRule, UNKNOWN_SUBJECT};
pub use policy::{ExceededResponse, Policy, PolicySummary, MAX_WINDOW, TOO_MANY_REQUESTS};
pub use redis_store::RedisStore;
pub use registry::PolicyRegistry;
pub use roles::{Role, RoleDispatcher};
pub use store::{AtomicAdmit, AtomicOutcome, InMemoryStore, SharedStore, SWEEP_INTERVAL};

/// Names of the catalogue policies.
pub mod names {
    pub use super::registry::{
        AUTH, BUSINESS_REGISTRATION, GENERAL, NOTIFICATION, ORDER_CREATION, PASSWORD_RESET,
        RATING_CREATION, RESERVATION_CREATION, STRICT, UPLOAD, WALLET_TOPUP,
    };
}
