use std::time::Duration;

use catalog_domain::jobs::{now_ms, ttl_ms};
use catalog_domain::ports::BoxFuture;
use catalog_domain::ports::lock::{LockError, LockHandle, ResourceLock};
use catalog_domain::util::uuid_v7_without_dashes;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "catalog:locks";

const RENEW_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Lease lock on a single Redis key holding the holder's token.
#[derive(Clone)]
pub struct RedisResourceLock {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisResourceLock {
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, LockError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| LockError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| LockError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn lock_key(&self, resource: &str) -> String {
        lock_key(&self.prefix, resource)
    }
}

fn lock_key(prefix: &str, resource: &str) -> String {
    format!("{prefix}:{resource}")
}

fn store_error(err: redis::RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        LockError::Unavailable(err.to_string())
    } else {
        LockError::Store(err.to_string())
    }
}

impl ResourceLock for RedisResourceLock {
    fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<Option<LockHandle>, LockError>> {
        let key = self.lock_key(resource);
        let resource = resource.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let token = uuid_v7_without_dashes();
            let ttl_ms = ttl_ms(ttl).max(1);
            let now = now_ms();
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;

            if result.is_none() {
                tracing::debug!(resource = %resource, owner = %owner, "lock held elsewhere");
                return Ok(None);
            }
            Ok(Some(LockHandle {
                resource,
                owner,
                lease_token: token,
                expires_at_ms: now.saturating_add(ttl_ms),
            }))
        })
    }

    fn renew(&self, handle: &LockHandle, ttl: Duration) -> BoxFuture<'_, Result<bool, LockError>> {
        let key = self.lock_key(&handle.resource);
        let token = handle.lease_token.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
                .key(&key)
                .arg(&token)
                .arg(ttl_ms(ttl).max(1))
                .invoke_async(&mut conn)
                .await
                .map_err(store_error)?;
            Ok(renewed == 1)
        })
    }

    fn release(&self, handle: &LockHandle) -> BoxFuture<'_, Result<bool, LockError>> {
        let key = self.lock_key(&handle.resource);
        let token = handle.lease_token.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let released: i32 = redis::Script::new(RELEASE_SCRIPT)
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await
                .map_err(store_error)?;
            Ok(released == 1)
        })
    }
}
