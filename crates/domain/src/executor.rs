//! Job dispatch: maps a leased job to its handler and the handler's result to
//! a terminal job status.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::apply::{ApplyEngine, ApplyResult};
use crate::catalog::{Snapshot, load_snapshot};
use crate::compiler::{compile, preview_value};
use crate::error::ErrorCode;
use crate::plan::ChangePlan;
use crate::ports::BoxFuture;
use crate::ports::catalog::CatalogStore;
use crate::ports::jobs::{Job, JobFailure, JobMode, JobOutcome, JobStatus, JobType};
use crate::rules::{FindingKind, audit, normalization_operations};

pub const DEFAULT_SCAN_GROUP_LIMIT: usize = 25;

pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &Job) -> BoxFuture<'_, Result<JobOutcome, JobFailure>>;
}

/// Suggested next job for a group surfaced by a maintenance scan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowUp {
    pub group_key: String,
    pub suggested_job_type: JobType,
    pub finding_count: usize,
}

/// Follow-ups carried in a scan outcome; empty for any other result shape.
pub fn follow_ups(outcome: &JobOutcome) -> Vec<FollowUp> {
    outcome
        .result
        .get("follow_ups")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub scan_group_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scan_group_limit: DEFAULT_SCAN_GROUP_LIMIT,
        }
    }
}

pub struct JobExecutor {
    store: Arc<dyn CatalogStore>,
    engine: Arc<ApplyEngine>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn CatalogStore>, engine: Arc<ApplyEngine>, config: ExecutorConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    pub async fn run(&self, job: &Job) -> Result<JobOutcome, JobFailure> {
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, mode = %job.payload.mode, "executing job");
        match job.job_type {
            JobType::FamilyAudit => self.family_audit(job).await,
            JobType::FamilyNormalize => self.family_normalize(job).await,
            JobType::PlanApply => self.plan_apply(job).await,
            JobType::MaintenanceScan => self.maintenance_scan(job).await,
            other => Err(JobFailure::new(
                ErrorCode::UnsupportedJobType,
                format!("no handler for job type '{other}'"),
            )),
        }
    }

    async fn snapshot(&self, job: &Job) -> Result<Snapshot, JobFailure> {
        let group_key = required_group_key(job)?;
        load_snapshot(self.store.as_ref(), group_key)
            .await
            .map_err(|err| {
                JobFailure::new(
                    ErrorCode::Exception,
                    format!("failed to load group '{group_key}': {err}"),
                )
            })
    }

    async fn family_audit(&self, job: &Job) -> Result<JobOutcome, JobFailure> {
        let snapshot = self.snapshot(job).await?;
        let findings = audit(&snapshot);
        let mut plan = ChangePlan::new(job.id.clone(), job.job_type);
        for finding in &findings {
            plan.push(finding.to_operation());
        }

        tracing::info!(job_id = %job.id, group_key = %snapshot.group_key, findings = findings.len(), "audit finished");
        Ok(JobOutcome {
            status: JobStatus::SucceededDryRun,
            result: json!({
                "group_key": snapshot.group_key,
                "finding_count": findings.len(),
                "findings": findings,
                "plan": plan,
            }),
        })
    }

    async fn family_normalize(&self, job: &Job) -> Result<JobOutcome, JobFailure> {
        let snapshot = self.snapshot(job).await?;
        let mut plan = ChangePlan::new(job.id.clone(), job.job_type);
        for operation in normalization_operations(&snapshot) {
            plan.push(operation);
        }
        self.compile_and_apply(job, &snapshot, &plan).await
    }

    async fn plan_apply(&self, job: &Job) -> Result<JobOutcome, JobFailure> {
        let Some(plan) = &job.payload.plan else {
            return Err(JobFailure::new(
                ErrorCode::InvalidPayload,
                "plan_apply job carries no plan",
            ));
        };
        let snapshot = self.snapshot(job).await?;
        let mut plan = plan.clone();
        if plan.job_id.trim().is_empty() {
            plan.job_id = job.id.clone();
        }
        self.compile_and_apply(job, &snapshot, &plan).await
    }

    async fn compile_and_apply(
        &self,
        job: &Job,
        snapshot: &Snapshot,
        plan: &ChangePlan,
    ) -> Result<JobOutcome, JobFailure> {
        let mode = job.payload.mode;
        let compiled = compile(plan, snapshot);
        if !compiled.is_clean() {
            tracing::warn!(
                job_id = %job.id,
                group_key = %snapshot.group_key,
                errors = compiled.errors.len(),
                "plan does not compile; escalating for review"
            );
            return Ok(JobOutcome {
                status: JobStatus::NeedsReview,
                result: json!({
                    "group_key": snapshot.group_key,
                    "mode": mode,
                    "code": ErrorCode::CompileErrors,
                    "compiled": preview_value(&compiled),
                }),
            });
        }

        let applied = self.engine.apply(plan, mode).await;
        if let Some(code) = applied.fatal_code() {
            let message = applied
                .errors
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(JobFailure::new(code, message));
        }

        Ok(JobOutcome {
            status: outcome_status(mode, &applied),
            result: json!({
                "group_key": snapshot.group_key,
                "mode": mode,
                "operation_count": plan.operations.len(),
                "compiled": preview_value(&compiled),
                "apply": applied,
            }),
        })
    }

    async fn maintenance_scan(&self, job: &Job) -> Result<JobOutcome, JobFailure> {
        let limit = job.payload.limit.unwrap_or(self.config.scan_group_limit);
        let group_keys = self.store.list_group_keys(limit).await.map_err(|err| {
            JobFailure::new(ErrorCode::Exception, format!("failed to list groups: {err}"))
        })?;

        let mut follow_ups = Vec::new();
        for group_key in &group_keys {
            let snapshot = load_snapshot(self.store.as_ref(), group_key)
                .await
                .map_err(|err| {
                    JobFailure::new(
                        ErrorCode::Exception,
                        format!("failed to load group '{group_key}': {err}"),
                    )
                })?;
            let findings = audit(&snapshot);
            if findings.is_empty() {
                continue;
            }
            let kinds: BTreeSet<FindingKind> = findings.iter().map(|finding| finding.kind).collect();
            let suggested_job_type = if kinds.contains(&FindingKind::MissingEquipmentQualifier) {
                JobType::FamilyNormalize
            } else {
                JobType::FamilyAudit
            };
            follow_ups.push(FollowUp {
                group_key: group_key.clone(),
                suggested_job_type,
                finding_count: findings.len(),
            });
        }

        tracing::info!(
            job_id = %job.id,
            scanned = group_keys.len(),
            follow_ups = follow_ups.len(),
            "maintenance scan finished"
        );
        Ok(JobOutcome {
            status: JobStatus::SucceededDryRun,
            result: json!({
                "scanned_groups": group_keys.len(),
                "follow_ups": follow_ups,
            }),
        })
    }
}

impl JobHandler for JobExecutor {
    fn execute(&self, job: &Job) -> BoxFuture<'_, Result<JobOutcome, JobFailure>> {
        let job = job.clone();
        Box::pin(async move { self.run(&job).await })
    }
}

fn required_group_key(job: &Job) -> Result<&str, JobFailure> {
    job.payload
        .group_key
        .as_deref()
        .map(str::trim)
        .filter(|group_key| !group_key.is_empty())
        .ok_or_else(|| {
            JobFailure::new(
                ErrorCode::InvalidPayload,
                format!("{} job requires a group_key", job.job_type),
            )
        })
}

pub fn outcome_status(mode: JobMode, applied: &ApplyResult) -> JobStatus {
    if !mode.is_apply() {
        JobStatus::SucceededDryRun
    } else if applied.needs_review() {
        JobStatus::NeedsReview
    } else {
        JobStatus::Succeeded
    }
}

/// Convenience for callers that only need the apply section of a result.
pub fn apply_section(outcome: &JobOutcome) -> Option<ApplyResult> {
    outcome
        .result
        .get("apply")
        .cloned()
        .and_then(|value: Value| serde_json::from_value(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyGate;
    use crate::catalog::Record;
    use crate::catalog_store::InMemoryCatalogStore;
    use crate::idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore};
    use crate::jobs::{JobDefaults, new_job};
    use crate::journal::InMemoryChangeJournal;
    use crate::ports::jobs::JobPayload;

    fn executor(store: Arc<InMemoryCatalogStore>, apply_enabled: bool) -> JobExecutor {
        let engine = ApplyEngine::new(
            store.clone(),
            Arc::new(InMemoryChangeJournal::new()),
            IdempotencyService::new(
                Arc::new(InMemoryIdempotencyStore::new("test")),
                IdempotencyConfig::default(),
            ),
            ApplyGate::new(apply_enabled),
        )
        .with_verification(true);
        JobExecutor::new(store, Arc::new(engine), ExecutorConfig::default())
    }

    async fn seeded_store() -> Arc<InMemoryCatalogStore> {
        let store = Arc::new(InMemoryCatalogStore::new());
        store
            .seed_record(Record::new("bench-press", "Bench Press", vec!["barbell".into()]))
            .await;
        store
            .seed_record(Record::new(
                "bench-press",
                "Dumbbell Bench Press",
                vec!["dumbbell".into()],
            ))
            .await;
        store
    }

    fn job(job_type: JobType, payload: JobPayload) -> Job {
        new_job(format!("job-{job_type}"), job_type, payload, JobDefaults::default())
    }

    #[test]
    fn dry_run_always_maps_to_succeeded_dry_run() {
        let mut applied = serde_json::from_value::<ApplyResult>(json!({
            "success": false, "mode": "apply", "applied_count": 0,
            "skipped_count": 0, "failed_count": 1
        }))
        .expect("result");
        assert_eq!(outcome_status(JobMode::DryRun, &applied), JobStatus::SucceededDryRun);
        assert_eq!(outcome_status(JobMode::Apply, &applied), JobStatus::NeedsReview);
        applied.failed_count = 0;
        assert_eq!(outcome_status(JobMode::Apply, &applied), JobStatus::Succeeded);
        applied.needs_repair = Some(true);
        assert_eq!(outcome_status(JobMode::Apply, &applied), JobStatus::NeedsReview);
    }

    #[tokio::test]
    async fn audit_is_read_only() {
        let store = seeded_store().await;
        let executor = executor(store.clone(), true);
        let outcome = executor
            .run(&job(
                JobType::FamilyAudit,
                JobPayload::for_group("bench-press", JobMode::Apply),
            ))
            .await
            .expect("audit");
        assert_eq!(outcome.status, JobStatus::SucceededDryRun);
        assert_eq!(outcome.result["finding_count"], json!(1));
        assert_eq!(outcome.result["plan"]["operations"][0]["op_type"], json!("NO_OP"));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn normalize_applies_renames_and_redirects() {
        let store = seeded_store().await;
        let executor = executor(store.clone(), true);
        let outcome = executor
            .run(&job(
                JobType::FamilyNormalize,
                JobPayload::for_group("bench-press", JobMode::Apply),
            ))
            .await
            .expect("normalize");
        assert_eq!(outcome.status, JobStatus::Succeeded);

        let applied = apply_section(&outcome).expect("apply section");
        assert_eq!(applied.applied_count, 2);
        assert_eq!(applied.verification_passed, Some(true));
        let renamed = store
            .get_record("bench-press__bench-press")
            .await
            .unwrap()
            .expect("record");
        assert_eq!(renamed.name, "Barbell Bench Press");
        assert_eq!(renamed.name_slug, "barbell-bench-press");
        let alias = store.get_alias("bench-press").await.unwrap().expect("alias");
        assert_eq!(alias.record_id(), Some("bench-press__bench-press"));
    }

    #[tokio::test]
    async fn gate_blocked_normalize_is_a_permanent_failure() {
        let store = seeded_store().await;
        let executor = executor(store.clone(), false);
        let failure = executor
            .run(&job(
                JobType::FamilyNormalize,
                JobPayload::for_group("bench-press", JobMode::Apply),
            ))
            .await
            .expect_err("gate must block");
        assert_eq!(failure.code, ErrorCode::ApplyGateBlocked);
        assert!(!failure.is_transient);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn missing_group_and_unknown_type_are_rejected() {
        let executor = executor(Arc::new(InMemoryCatalogStore::new()), true);
        let failure = executor
            .run(&job(JobType::FamilyAudit, JobPayload::default()))
            .await
            .expect_err("group key required");
        assert_eq!(failure.code, ErrorCode::InvalidPayload);

        let failure = executor
            .run(&job(
                JobType::ContentGeneration,
                JobPayload::for_group("bench-press", JobMode::DryRun),
            ))
            .await
            .expect_err("unsupported");
        assert_eq!(failure.code, ErrorCode::UnsupportedJobType);
        assert!(!failure.is_transient);
    }

    #[tokio::test]
    async fn scan_suggests_follow_ups_for_groups_with_findings() {
        let store = seeded_store().await;
        store
            .seed_record(Record::new("squat", "Back Squat", vec!["barbell".into()]))
            .await;
        let executor = executor(store.clone(), true);
        let outcome = executor
            .run(&job(JobType::MaintenanceScan, JobPayload::default()))
            .await
            .expect("scan");
        let suggested = follow_ups(&outcome);
        assert_eq!(
            suggested,
            vec![FollowUp {
                group_key: "bench-press".into(),
                suggested_job_type: JobType::FamilyNormalize,
                finding_count: 1,
            }]
        );
        assert_eq!(outcome.result["scanned_groups"], json!(2));
        assert_eq!(store.write_count(), 0);
    }
}
