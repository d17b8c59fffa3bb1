use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

use super::BoxFuture;
use crate::error::{ErrorCode, OperationFault};
use crate::plan::ChangePlan;

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
    #[error("job queue serialization error: {0}")]
    Serialization(String),
    #[error("job queue operation failed: {0}")]
    Operation(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("lease lost for job {0}")]
    LeaseLost(String),
}

impl JobQueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FamilyAudit,
    FamilyNormalize,
    MaintenanceScan,
    PlanApply,
    ContentGeneration,
    QualityEnrichment,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FamilyAudit => "family_audit",
            Self::FamilyNormalize => "family_normalize",
            Self::MaintenanceScan => "maintenance_scan",
            Self::PlanApply => "plan_apply",
            Self::ContentGeneration => "content_generation",
            Self::QualityEnrichment => "quality_enrichment",
        }
    }

    /// Job types that may write to the catalog and therefore take the group lock.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::FamilyNormalize | Self::PlanApply)
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "family_audit" => Ok(Self::FamilyAudit),
            "family_normalize" => Ok(Self::FamilyNormalize),
            "maintenance_scan" => Ok(Self::MaintenanceScan),
            "plan_apply" => Ok(Self::PlanApply),
            "content_generation" => Ok(Self::ContentGeneration),
            "quality_enrichment" => Ok(Self::QualityEnrichment),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    DryRun,
    Apply,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Apply => "apply",
        }
    }

    pub fn is_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Leased,
    Running,
    Succeeded,
    SucceededDryRun,
    Failed,
    NeedsReview,
    Deadletter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::SucceededDryRun => "succeeded_dry_run",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
            Self::Deadletter => "deadletter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Leased | Self::Running)
    }

    pub fn holds_lease(&self) -> bool {
        matches!(self, Self::Leased | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ChangePlan>,
}

impl JobPayload {
    pub fn for_group(group_key: impl Into<String>, mode: JobMode) -> Self {
        Self {
            group_key: Some(group_key.into()),
            mode,
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_plan(mut self, plan: ChangePlan) -> Self {
        self.plan = Some(plan);
        self
    }
}

/// Structured failure handed to the queue; `is_transient` decides retry versus terminal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
    pub is_transient: bool,
}

impl JobFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            is_transient: code.is_transient(),
        }
    }
}

impl From<OperationFault> for JobFailure {
    fn from(fault: OperationFault) -> Self {
        Self::new(fault.code, fault.message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: JobPayload,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Job {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status.holds_lease() && self.lease_owner.as_deref() == Some(worker_id)
    }

    pub fn lease_expired(&self, now_ms: i64) -> bool {
        self.status.holds_lease()
            && self
                .lease_expires_at_ms
                .is_some_and(|expires_at| expires_at <= now_ms)
    }
}

/// Lease-based work distribution. Every transition is atomic for one job.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: &Job) -> BoxFuture<'_, Result<(), JobQueueError>>;

    /// Claims the oldest queued job for `worker_id`, incrementing its attempts.
    fn lease(&self, worker_id: &str) -> BoxFuture<'_, Result<Option<Job>, JobQueueError>>;

    fn mark_running(
        &self,
        job_id: &str,
        worker_id: &str,
    ) -> BoxFuture<'_, Result<Job, JobQueueError>>;

    fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> BoxFuture<'_, Result<Job, JobQueueError>>;

    fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> BoxFuture<'_, Result<Job, JobQueueError>>;

    /// Extends the lease by the queue's TTL. `false` when the worker no longer holds it.
    fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>>;

    /// Watchdog entry point: returns jobs whose lease expired before `now_ms` to the queue.
    fn reclaim_expired(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>>;

    fn get(&self, job_id: &str) -> BoxFuture<'_, Result<Option<Job>, JobQueueError>>;
}
