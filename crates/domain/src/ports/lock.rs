use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
    #[error("lock store error: {0}")]
    Store(String),
}

/// Proof of ownership of a named resource until `expires_at_ms`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHandle {
    pub resource: String,
    pub owner: String,
    pub lease_token: String,
    pub expires_at_ms: i64,
}

pub fn group_lock_resource(group_key: &str) -> String {
    format!("group:{group_key}")
}

/// Renewable, time-bounded mutual exclusion. Only the holder of the matching
/// lease token may renew or release.
pub trait ResourceLock: Send + Sync {
    /// `None` when another owner holds an unexpired lease.
    fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<Option<LockHandle>, LockError>>;

    fn renew(&self, handle: &LockHandle, ttl: Duration) -> BoxFuture<'_, Result<bool, LockError>>;

    fn release(&self, handle: &LockHandle) -> BoxFuture<'_, Result<bool, LockError>>;
}
