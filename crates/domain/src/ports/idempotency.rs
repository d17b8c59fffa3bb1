use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;
use crate::plan::OpType;
use crate::util::sha256_hex;

/// Derived key identifying one operation of one plan, stable across retries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct IdempotencyKey {
    pub digest: String,
}

impl IdempotencyKey {
    pub fn for_operation(seed: &str, index: usize, op_type: OpType, targets: &[String]) -> Self {
        let material = format!("{seed}|{index}|{}|{}", op_type.as_str(), targets.join(","));
        Self {
            digest: sha256_hex(material.as_bytes()),
        }
    }

    pub fn cache_key(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.digest)
    }

    pub fn as_str(&self) -> &str {
        &self.digest
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.digest)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress,
    Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub job_id: String,
    pub operation_index: usize,
    pub state: IdempotencyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub recorded_at_ms: i64,
}

impl IdempotencyRecord {
    pub fn in_progress(key: &IdempotencyKey, job_id: &str, operation_index: usize) -> Self {
        Self {
            key: key.clone(),
            job_id: job_id.to_string(),
            operation_index,
            state: IdempotencyState::InProgress,
            change_id: None,
            recorded_at_ms: crate::jobs::now_ms(),
        }
    }

    pub fn completed(mut self, change_id: &str) -> Self {
        self.state = IdempotencyState::Completed;
        self.change_id = Some(change_id.to_string());
        self.recorded_at_ms = crate::jobs::now_ms();
        self
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency serialization error: {0}")]
    Serialization(String),
    #[error("idempotency store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Stored,
    Existing(IdempotencyRecord),
}

pub trait IdempotencyStore: Send + Sync {
    fn get(
        &self,
        key: &IdempotencyKey,
    ) -> BoxFuture<'_, Result<Option<IdempotencyRecord>, IdempotencyError>>;
    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>>;
    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>>;
    fn remove(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>>;
}
