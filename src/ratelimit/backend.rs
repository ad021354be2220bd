//! Window counter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::decision::Decision;
use super::identity::IdentityKey;
use super::policy::Policy;
use crate::error::StoreError;

/// Trait for window counter implementations.
///
/// This trait abstracts over the local `FixedWindowCounter` and the
/// `SlidingWindowCounter` so the admission gate can work with either.
/// An `Err` means the counter could not reach its state, never that the
/// caller is over the limit.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Count one attempt for `key` under `policy`.
    async fn check(&self, policy: &Policy, key: &IdentityKey) -> Result<Decision, StoreError>;
}
