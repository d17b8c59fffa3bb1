use std::time::Duration;

use catalog_domain::ports::BoxFuture;
use catalog_domain::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore, PutOutcome,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "catalog:idem";
const PUT_RETRY_LIMIT: usize = 2;

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn cache_key(&self, key: &IdempotencyKey) -> String {
        key.cache_key(&self.prefix)
    }

    fn serialize_record(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
        serde_json::to_string(record)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }

    fn deserialize_record(value: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        serde_json::from_str(value).map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }
}

/// `SET` with an optional condition and, for non-zero TTLs, a `PX` expiry.
fn set_command(cache_key: &str, payload: &str, condition: Option<&str>, ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(cache_key).arg(payload);
    if let Some(condition) = condition {
        cmd.arg(condition);
    }
    if let Some(ttl_ms) = ttl_ms(ttl) {
        cmd.arg("PX").arg(ttl_ms);
    }
    cmd
}

/// `None` for a zero TTL, which keeps the key until it is removed.
fn ttl_ms(ttl: Duration) -> Option<u64> {
    if ttl.is_zero() {
        None
    } else {
        Some((ttl.as_millis() as u64).max(1))
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn get(
        &self,
        key: &IdempotencyKey,
    ) -> BoxFuture<'_, Result<Option<IdempotencyRecord>, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn
                .get(cache_key)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            value
                .map(|payload| Self::deserialize_record(&payload))
                .transpose()
        })
    }

    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = Self::serialize_record(&record)?;
            for attempt in 0..PUT_RETRY_LIMIT {
                let mut conn = self.manager.clone();
                let result: Option<String> = set_command(&cache_key, &payload, Some("NX"), ttl)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| IdempotencyError::Store(err.to_string()))?;

                if result.is_some() {
                    return Ok(PutOutcome::Stored);
                }

                // The holder may have expired between SET and GET; retry the claim once.
                let existing: Option<String> = conn
                    .get(&cache_key)
                    .await
                    .map_err(|err| IdempotencyError::Store(err.to_string()))?;
                if let Some(payload) = existing {
                    return Ok(PutOutcome::Existing(Self::deserialize_record(&payload)?));
                }

                if attempt + 1 >= PUT_RETRY_LIMIT {
                    break;
                }
            }

            Err(IdempotencyError::Store(
                "failed to claim idempotency key".into(),
            ))
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = Self::serialize_record(&record)?;
            let mut conn = self.manager.clone();
            let result: Option<String> = set_command(&cache_key, &payload, Some("XX"), ttl)
                .query_async(&mut conn)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;

            if result.is_none() {
                let _: String = set_command(&cache_key, &payload, None, ttl)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            }

            Ok(())
        })
    }

    fn remove(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn
                .del(cache_key)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            Ok(())
        })
    }
}
