use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::jobs::{now_ms, ttl_ms};
use crate::ports::BoxFuture;
use crate::ports::lock::{LockError, LockHandle, ResourceLock};
use crate::util::uuid_v7_without_dashes;

#[derive(Clone, Debug, Default)]
pub struct InMemoryResourceLock {
    inner: Arc<Mutex<HashMap<String, LockHandle>>>,
}

impl InMemoryResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, resource: &str) -> Option<LockHandle> {
        let guard = self.inner.lock().expect("resource lock map");
        guard
            .get(resource)
            .filter(|handle| handle.expires_at_ms > now_ms())
            .cloned()
    }
}

impl ResourceLock for InMemoryResourceLock {
    fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<Option<LockHandle>, LockError>> {
        let resource = resource.to_string();
        let owner = owner.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let now = now_ms();
            let mut guard = inner.lock().expect("resource lock map");
            if let Some(current) = guard.get(&resource) {
                if current.expires_at_ms > now {
                    return Ok(None);
                }
            }
            let handle = LockHandle {
                resource: resource.clone(),
                owner,
                lease_token: uuid_v7_without_dashes(),
                expires_at_ms: now.saturating_add(ttl_ms(ttl)),
            };
            guard.insert(resource, handle.clone());
            Ok(Some(handle))
        })
    }

    fn renew(&self, handle: &LockHandle, ttl: Duration) -> BoxFuture<'_, Result<bool, LockError>> {
        let handle = handle.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let now = now_ms();
            let mut guard = inner.lock().expect("resource lock map");
            match guard.get_mut(&handle.resource) {
                Some(current)
                    if current.lease_token == handle.lease_token && current.expires_at_ms > now =>
                {
                    current.expires_at_ms = now.saturating_add(ttl_ms(ttl));
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release(&self, handle: &LockHandle) -> BoxFuture<'_, Result<bool, LockError>> {
        let handle = handle.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("resource lock map");
            let owned = guard
                .get(&handle.resource)
                .is_some_and(|current| current.lease_token == handle.lease_token);
            if owned {
                guard.remove(&handle.resource);
            }
            Ok(owned)
        })
    }
}
