use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyState, IdempotencyStore,
    PutOutcome,
};

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    pub in_progress_ttl: Duration,
    /// Zero keeps completed records forever.
    pub completed_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            in_progress_ttl: Duration::from_secs(300),
            completed_ttl: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    Started(IdempotencyRecord),
    InProgress,
    Completed(IdempotencyRecord),
}

/// Claims operation keys before a write and seals them after it.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn begin(
        &self,
        key: &IdempotencyKey,
        job_id: &str,
        operation_index: usize,
    ) -> Result<BeginOutcome, IdempotencyError> {
        let record = IdempotencyRecord::in_progress(key, job_id, operation_index);
        match self
            .store
            .put_if_absent(key, &record, self.config.in_progress_ttl)
            .await?
        {
            PutOutcome::Stored => Ok(BeginOutcome::Started(record)),
            PutOutcome::Existing(existing) => match existing.state {
                IdempotencyState::InProgress => Ok(BeginOutcome::InProgress),
                IdempotencyState::Completed => Ok(BeginOutcome::Completed(existing)),
            },
        }
    }

    pub async fn complete(
        &self,
        claimed: IdempotencyRecord,
        change_id: &str,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        let record = claimed.completed(change_id);
        self.store
            .update(&record.key, &record, self.config.completed_ttl)
            .await?;
        Ok(record)
    }

    /// Releases a claim whose operation failed so a retry can run it again.
    pub async fn abandon(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError> {
        self.store.remove(key).await
    }

    pub async fn lookup(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        self.store.get(key).await
    }
}

#[derive(Clone, Debug)]
pub struct InMemoryIdempotencyStore {
    prefix: String,
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    record: IdempotencyRecord,
    expires_at: Option<Instant>,
}

impl InMemoryIdempotencyStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cache_key(&self, key: &IdempotencyKey) -> String {
        key.cache_key(&self.prefix)
    }

    fn is_expired(expires_at: Option<Instant>) -> bool {
        match expires_at {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    fn deadline(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(
        &self,
        key: &IdempotencyKey,
    ) -> crate::ports::BoxFuture<'_, Result<Option<IdempotencyRecord>, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("idempotency store lock");
            if let Some(entry) = guard.get(&cache_key) {
                if Self::is_expired(entry.expires_at) {
                    guard.remove(&cache_key);
                    return Ok(None);
                }
                return Ok(Some(entry.record.clone()));
            }
            Ok(None)
        })
    }

    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> crate::ports::BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        let record = record.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("idempotency store lock");
            if let Some(entry) = guard.get(&cache_key) {
                if Self::is_expired(entry.expires_at) {
                    guard.remove(&cache_key);
                } else {
                    return Ok(PutOutcome::Existing(entry.record.clone()));
                }
            }

            let expires_at = Self::deadline(ttl);
            guard.insert(cache_key, MemoryEntry { record, expires_at });
            Ok(PutOutcome::Stored)
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> crate::ports::BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        let record = record.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("idempotency store lock");
            let expires_at = Self::deadline(ttl);
            guard.insert(cache_key, MemoryEntry { record, expires_at });
            Ok(())
        })
    }

    fn remove(
        &self,
        key: &IdempotencyKey,
    ) -> crate::ports::BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .lock()
                .expect("idempotency store lock")
                .remove(&cache_key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::OpType;

    #[test]
    fn operation_key_is_stable_and_position_sensitive() {
        let targets = vec!["r-1".to_string()];
        let first = IdempotencyKey::for_operation("seed", 0, OpType::PatchFields, &targets);
        let again = IdempotencyKey::for_operation("seed", 0, OpType::PatchFields, &targets);
        let moved = IdempotencyKey::for_operation("seed", 1, OpType::PatchFields, &targets);
        let retyped = IdempotencyKey::for_operation("seed", 0, OpType::RenameRecord, &targets);
        assert_eq!(first, again);
        assert_ne!(first, moved);
        assert_ne!(first, retyped);
        assert_eq!(first.as_str().len(), 64);
        assert_eq!(first.cache_key("catalog:idemp"), format!("catalog:idemp:{first}"));
    }
}
