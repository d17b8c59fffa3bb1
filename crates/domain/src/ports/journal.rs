use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::BoxFuture;
use crate::plan::OpType;
use crate::ports::jobs::{JobMode, JobType};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal unavailable: {0}")]
    Unavailable(String),
    #[error("journal serialization error: {0}")]
    Serialization(String),
}

/// One applied mutation, keyed by `(job_id, operation_index)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub change_id: String,
    pub job_id: String,
    pub job_type: JobType,
    pub operation_index: usize,
    pub op_type: OpType,
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub idempotency_key: String,
    #[serde(default)]
    pub rationale: String,
    pub applied_at_ms: i64,
}

impl JournalEntry {
    pub fn entry_key(&self) -> String {
        entry_key(&self.job_id, self.operation_index)
    }
}

pub fn entry_key(job_id: &str, operation_index: usize) -> String {
    format!("{job_id}:{operation_index}")
}

/// Aggregate written once per apply call, referenced by `change_id`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChangeSummary {
    pub change_id: String,
    pub job_id: String,
    pub job_type: JobType,
    pub mode: JobMode,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub recorded_at_ms: i64,
}

pub trait ChangeJournal: Send + Sync {
    /// Writes the entry under its key. A re-executed operation replaces the
    /// entry left by an attempt that never sealed its idempotency key.
    fn append(&self, entry: &JournalEntry) -> BoxFuture<'_, Result<(), JournalError>>;

    fn record_summary(&self, summary: &ChangeSummary) -> BoxFuture<'_, Result<(), JournalError>>;

    /// Entries of one job in operation order.
    fn list_entries(&self, job_id: &str) -> BoxFuture<'_, Result<Vec<JournalEntry>, JournalError>>;

    fn get_summary(
        &self,
        change_id: &str,
    ) -> BoxFuture<'_, Result<Option<ChangeSummary>, JournalError>>;
}
