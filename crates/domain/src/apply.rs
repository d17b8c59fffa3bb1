//! Gated, idempotent, journaled execution of a change plan.
//!
//! Order of checks per call: mode, capability gate, plan-wide path validation,
//! then operations in plan order. Only the path validation is all-or-nothing;
//! past it, each operation succeeds or fails on its own and failures are
//! collected into the result. Nothing is rolled back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::Record;
use crate::error::{DomainError, ErrorCode, OperationFault};
use crate::idempotency::{BeginOutcome, IdempotencyService};
use crate::jobs::now_ms;
use crate::mutation::{
    FieldChange, alias_from_upsert, build_created_record, effective_patch, patch_record,
    record_targets, registry_with_patch, single_target,
};
use crate::paths::{PathViolation, REGISTRY_PATH_PREFIX, get_path, validate_plan};
use crate::plan::{ChangePlan, OpType, Operation, Patch, PatchValue};
use crate::ports::catalog::{CatalogStore, CreateOutcome, FieldAction, FieldWrite, NestedUpdate};
use crate::ports::idempotency::IdempotencyKey;
use crate::ports::jobs::JobMode;
use crate::ports::journal::{ChangeJournal, ChangeSummary, JournalEntry};
use crate::util::uuid_v7_without_dashes;
use crate::verify::{ALIAS_FIELD, ExpectedTarget, Expectations, VerificationMismatch, verify};

/// Environment-level capability. `apply` mode is refused unless the gate is open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyGate {
    apply_enabled: bool,
}

impl ApplyGate {
    pub fn new(apply_enabled: bool) -> Self {
        Self { apply_enabled }
    }

    pub fn is_open(&self) -> bool {
        self.apply_enabled
    }

    pub fn permits(&self, mode: JobMode) -> bool {
        !mode.is_apply() || self.apply_enabled
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OperationError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type: Option<OpType>,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl OperationError {
    fn from_violation(violation: PathViolation) -> Self {
        Self {
            operation_index: violation.operation_index,
            op_type: None,
            code: ErrorCode::InvalidPatchPaths,
            target: None,
            message: format!("path '{}': {}", violation.path, violation.reason),
            path: Some(violation.path),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppliedOperation {
    pub index: usize,
    pub op_type: OpType,
    pub targets: Vec<String>,
    pub idempotency_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PreviewEntry {
    pub index: usize,
    pub op_type: OpType,
    pub targets: Vec<String>,
    pub patch: Patch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApplyResult {
    pub success: bool,
    pub mode: JobMode,
    pub applied_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    #[serde(default)]
    pub change_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<OperationError>,
    #[serde(default)]
    pub operations_applied: Vec<AppliedOperation>,
    #[serde(default)]
    pub gate_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_preview: Option<Vec<PreviewEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_errors: Option<Vec<VerificationMismatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_repair: Option<bool>,
}

impl ApplyResult {
    fn empty(mode: JobMode) -> Self {
        Self {
            success: false,
            mode,
            applied_count: 0,
            skipped_count: 0,
            failed_count: 0,
            change_id: None,
            errors: Vec::new(),
            operations_applied: Vec::new(),
            gate_blocked: false,
            dry_run_preview: None,
            verification_passed: None,
            verification_errors: None,
            needs_repair: None,
        }
    }

    pub fn needs_review(&self) -> bool {
        self.failed_count > 0 || self.needs_repair == Some(true)
    }

    /// The first fatal, plan-level error code, if the apply was refused outright.
    pub fn fatal_code(&self) -> Option<ErrorCode> {
        if self.gate_blocked {
            return Some(ErrorCode::ApplyGateBlocked);
        }
        self.errors
            .iter()
            .map(|error| error.code)
            .find(|code| *code == ErrorCode::InvalidPatchPaths)
    }

    fn record_failure(&mut self, index: usize, operation: &Operation, fault: OperationFault) {
        self.failed_count += 1;
        self.errors.push(OperationError {
            operation_index: Some(index),
            op_type: Some(operation.op_type),
            code: fault.code,
            target: fault
                .target
                .or_else(|| operation.first_target().map(str::to_string)),
            path: None,
            message: fault.message,
        });
    }
}

/// Converts a patch into the store's native nested update, mapping deletes to removals.
pub fn nested_update(patch: &Patch) -> NestedUpdate {
    NestedUpdate {
        writes: patch
            .iter()
            .map(|(path, value)| FieldWrite {
                path: path.split('.').map(str::to_string).collect(),
                action: match value {
                    PatchValue::Set(value) => FieldAction::Set(value.clone()),
                    PatchValue::Delete => FieldAction::Remove,
                },
            })
            .collect(),
    }
}

pub fn dry_run_preview(plan: &ChangePlan) -> Vec<PreviewEntry> {
    plan.operations
        .iter()
        .enumerate()
        .filter(|(_, operation)| operation.op_type.is_mutating())
        .map(|(index, operation)| PreviewEntry {
            index,
            op_type: operation.op_type,
            targets: operation.targets.clone(),
            patch: operation.patch.clone(),
            before: operation.before.clone(),
            after: operation.after.clone(),
            rationale: operation.rationale.clone(),
        })
        .collect()
}

fn store_fault(err: DomainError, target: &str) -> OperationFault {
    match err {
        DomainError::NotFound => OperationFault::not_found(target, "document"),
        other => OperationFault::new(ErrorCode::Exception, Some(target), other.to_string()),
    }
}

type Expected = (ExpectedTarget, String, Option<Value>);

enum Effect {
    Applied {
        targets: Vec<ExpectedTarget>,
        expected: Vec<Expected>,
    },
    AlreadyPresent,
}

struct OperationContext<'a> {
    plan: &'a ChangePlan,
    index: usize,
    operation: &'a Operation,
    key: &'a IdempotencyKey,
    change_id: &'a str,
}

pub struct ApplyEngine {
    store: Arc<dyn CatalogStore>,
    journal: Arc<dyn ChangeJournal>,
    idempotency: IdempotencyService,
    gate: ApplyGate,
    verify_after_apply: bool,
}

impl ApplyEngine {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        journal: Arc<dyn ChangeJournal>,
        idempotency: IdempotencyService,
        gate: ApplyGate,
    ) -> Self {
        Self {
            store,
            journal,
            idempotency,
            gate,
            verify_after_apply: false,
        }
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_after_apply = enabled;
        self
    }

    pub fn gate(&self) -> ApplyGate {
        self.gate
    }

    pub async fn apply(&self, plan: &ChangePlan, mode: JobMode) -> ApplyResult {
        let mut result = ApplyResult::empty(mode);

        if !mode.is_apply() {
            result.success = true;
            result.dry_run_preview = Some(dry_run_preview(plan));
            tracing::debug!(job_id = %plan.job_id, operations = plan.operations.len(), "dry run preview");
            return result;
        }

        if !self.gate.permits(mode) {
            tracing::warn!(job_id = %plan.job_id, "apply refused: capability flag is off");
            result.gate_blocked = true;
            result.errors.push(OperationError {
                operation_index: None,
                op_type: None,
                code: ErrorCode::ApplyGateBlocked,
                target: None,
                path: None,
                message: "apply mode requested but catalog apply is not enabled".into(),
            });
            return result;
        }

        let violations = validate_plan(plan);
        if !violations.is_empty() {
            tracing::warn!(
                job_id = %plan.job_id,
                violations = violations.len(),
                "apply refused: invalid patch paths"
            );
            result.errors = violations
                .into_iter()
                .map(OperationError::from_violation)
                .collect();
            return result;
        }

        let change_id = uuid_v7_without_dashes();
        result.change_id = Some(change_id.clone());
        let mut expectations = Expectations::default();

        for (index, operation) in plan.operations.iter().enumerate() {
            if operation.op_type == OpType::NoOp {
                continue;
            }
            self.run_operation(plan, index, operation, &change_id, &mut result, &mut expectations)
                .await;
        }

        let summary = ChangeSummary {
            change_id: change_id.clone(),
            job_id: plan.job_id.clone(),
            job_type: plan.job_type,
            mode,
            applied: result.applied_count,
            skipped: result.skipped_count,
            failed: result.failed_count,
            recorded_at_ms: now_ms(),
        };
        if let Err(err) = self.journal.record_summary(&summary).await {
            tracing::error!(job_id = %plan.job_id, change_id = %change_id, error = %err, "failed to record change summary");
            result.errors.push(OperationError {
                operation_index: None,
                op_type: None,
                code: ErrorCode::Exception,
                target: None,
                path: None,
                message: format!("change summary not recorded: {err}"),
            });
        }

        if self.verify_after_apply {
            let report = verify(self.store.as_ref(), &expectations).await;
            result.verification_passed = Some(report.passed);
            result.needs_repair = Some(!report.passed);
            result.verification_errors = Some(report.mismatches);
        }

        result.success = result.failed_count == 0 && result.errors.is_empty();
        tracing::info!(
            job_id = %plan.job_id,
            change_id = %change_id,
            applied = result.applied_count,
            skipped = result.skipped_count,
            failed = result.failed_count,
            needs_repair = result.needs_repair.unwrap_or(false),
            "apply finished"
        );
        result
    }

    async fn run_operation(
        &self,
        plan: &ChangePlan,
        index: usize,
        operation: &Operation,
        change_id: &str,
        result: &mut ApplyResult,
        expectations: &mut Expectations,
    ) {
        let seed = if operation.idempotency_key_seed.is_empty() {
            plan.job_id.as_str()
        } else {
            operation.idempotency_key_seed.as_str()
        };
        let key = IdempotencyKey::for_operation(seed, index, operation.op_type, &operation.targets);

        let claim = match self.idempotency.begin(&key, &plan.job_id, index).await {
            Ok(BeginOutcome::Started(claim)) => claim,
            Ok(BeginOutcome::Completed(_)) => {
                tracing::debug!(job_id = %plan.job_id, index, key = %key, "operation already applied");
                result.skipped_count += 1;
                return;
            }
            Ok(BeginOutcome::InProgress) => {
                result.record_failure(
                    index,
                    operation,
                    OperationFault::new(
                        ErrorCode::IdempotencyInProgress,
                        operation.first_target(),
                        "operation is claimed by another attempt",
                    ),
                );
                return;
            }
            Err(err) => {
                result.record_failure(
                    index,
                    operation,
                    OperationFault::new(ErrorCode::Exception, operation.first_target(), err.to_string()),
                );
                return;
            }
        };

        let context = OperationContext {
            plan,
            index,
            operation,
            key: &key,
            change_id,
        };
        match self.execute(&context).await {
            Ok(effect) => {
                if let Err(err) = self.idempotency.complete(claim, change_id).await {
                    tracing::warn!(job_id = %plan.job_id, index, error = %err, "failed to seal idempotency key");
                }
                match effect {
                    Effect::Applied { targets, expected } => {
                        result.applied_count += 1;
                        result.operations_applied.push(AppliedOperation {
                            index,
                            op_type: operation.op_type,
                            targets: operation.targets.clone(),
                            idempotency_key: key.to_string(),
                        });
                        for (target, field, value) in expected {
                            expectations.expect(index, target, field, value);
                        }
                        if let Some(Value::Object(overrides)) = &operation.after {
                            for target in &targets {
                                for (field, value) in overrides {
                                    expectations.expect(index, target.clone(), field.clone(), Some(value.clone()));
                                }
                            }
                        }
                    }
                    Effect::AlreadyPresent => result.skipped_count += 1,
                }
            }
            Err(fault) => {
                tracing::warn!(
                    job_id = %plan.job_id,
                    index,
                    op_type = %operation.op_type,
                    code = %fault.code,
                    message = %fault.message,
                    "operation failed"
                );
                if let Err(err) = self.idempotency.abandon(&key).await {
                    tracing::warn!(job_id = %plan.job_id, index, error = %err, "failed to release idempotency claim");
                }
                result.record_failure(index, operation, fault);
            }
        }
    }

    async fn execute(&self, context: &OperationContext<'_>) -> Result<Effect, OperationFault> {
        let operation = context.operation;
        match operation.op_type {
            OpType::RenameRecord
            | OpType::PatchFields
            | OpType::DeprecateRecord
            | OpType::ReassignGroup => self.update_records(context).await,
            OpType::CreateRecord => self.create_record(context).await,
            OpType::UpsertAlias => self.upsert_alias(context).await,
            OpType::DeleteAlias => self.delete_aliases(context).await,
            OpType::UpdateGroupRegistry => self.update_registry(context).await,
            OpType::NoOp => Err(OperationFault::new(
                ErrorCode::UnsupportedOp,
                None,
                "NO_OP operations are never executed",
            )),
        }
    }

    async fn update_records(&self, context: &OperationContext<'_>) -> Result<Effect, OperationFault> {
        let operation = context.operation;
        let patch = effective_patch(operation)?;
        let targets = record_targets(operation)?;

        let mut current = Vec::with_capacity(targets.len());
        for target in targets {
            let record = self
                .store
                .get_record(target)
                .await
                .map_err(|err| store_fault(err, target))?
                .ok_or_else(|| OperationFault::not_found(target, "record"))?;
            current.push(record);
        }

        // Every target is patched in memory first so a bad patch fails before any write.
        let predictions = current
            .into_iter()
            .map(|record| {
                let (predicted, changes) = patch_record(&record, &patch)?;
                Ok((record, predicted, changes))
            })
            .collect::<Result<Vec<_>, OperationFault>>()?;

        let update = nested_update(&patch);
        let mut before = Map::new();
        let mut after = Map::new();
        let mut expected = Vec::new();
        let mut touched = Vec::with_capacity(predictions.len());
        for (record, predicted, changes) in predictions {
            let stored = match self.store.update_record(&record.id, &update).await {
                Ok(stored) => stored,
                Err(err) => {
                    let fault = store_fault(err, &record.id);
                    return Err(self.journal_partial(context, before, after, fault).await);
                }
            };
            before.insert(record.id.clone(), change_values(&changes, |change| &change.before));
            after.insert(record.id.clone(), fields_of(&stored, &patch));
            expected.extend(record_expectations(&predicted, &patch));
            touched.push(ExpectedTarget::Record(record.id));
        }

        self.journal(context, Value::Object(before), Value::Object(after))
            .await?;
        Ok(Effect::Applied {
            targets: touched,
            expected,
        })
    }

    async fn create_record(&self, context: &OperationContext<'_>) -> Result<Effect, OperationFault> {
        let record = build_created_record(&context.operation.patch)?;
        let outcome = self
            .store
            .create_record_if_absent(&record)
            .await
            .map_err(|err| store_fault(err, &record.id))?;
        if outcome == CreateOutcome::AlreadyExists {
            tracing::debug!(record_id = %record.id, "create skipped: record exists");
            return Ok(Effect::AlreadyPresent);
        }

        let document = record.to_document().map_err(|err| store_fault(err, &record.id))?;
        self.journal(context, Value::Null, document).await?;
        Ok(Effect::Applied {
            targets: vec![ExpectedTarget::Record(record.id.clone())],
            expected: record_expectations(&record, &context.operation.patch),
        })
    }

    async fn upsert_alias(&self, context: &OperationContext<'_>) -> Result<Effect, OperationFault> {
        let slug = single_target(context.operation)?;
        // XOR is enforced here, before the store is touched.
        let alias = alias_from_upsert(slug, &context.operation.patch)?;
        let before = self
            .store
            .get_alias(slug)
            .await
            .map_err(|err| store_fault(err, slug))?;
        self.store
            .put_alias(&alias)
            .await
            .map_err(|err| store_fault(err, slug))?;

        let after = alias.to_value();
        self.journal(
            context,
            before.map(|alias| alias.to_value()).unwrap_or(Value::Null),
            after.clone(),
        )
        .await?;
        let target = ExpectedTarget::Alias(slug.to_string());
        Ok(Effect::Applied {
            targets: Vec::new(),
            expected: vec![(target, ALIAS_FIELD.to_string(), Some(after))],
        })
    }

    async fn delete_aliases(&self, context: &OperationContext<'_>) -> Result<Effect, OperationFault> {
        let slugs = record_targets(context.operation)?;
        let mut before = Map::new();
        let mut after = Map::new();
        let mut expected = Vec::with_capacity(slugs.len());
        for slug in slugs {
            let deleted = match self.store.get_alias(slug).await {
                Ok(existing) => self
                    .store
                    .delete_alias(slug)
                    .await
                    .map(|removed| (existing, removed)),
                Err(err) => Err(err),
            };
            let (existing, removed) = match deleted {
                Ok(deleted) => deleted,
                Err(err) => {
                    let fault = store_fault(err, slug);
                    return Err(self.journal_partial(context, before, after, fault).await);
                }
            };
            if !removed {
                tracing::debug!(slug = %slug, "alias already absent");
            }
            before.insert(
                slug.clone(),
                existing.map(|alias| alias.to_value()).unwrap_or(Value::Null),
            );
            after.insert(slug.clone(), Value::Null);
            expected.push((ExpectedTarget::Alias(slug.clone()), ALIAS_FIELD.to_string(), None));
        }

        self.journal(context, Value::Object(before), Value::Object(after))
            .await?;
        Ok(Effect::Applied {
            targets: Vec::new(),
            expected,
        })
    }

    async fn update_registry(&self, context: &OperationContext<'_>) -> Result<Effect, OperationFault> {
        let group_key = single_target(context.operation)?;
        let existing = self
            .store
            .get_registry(group_key)
            .await
            .map_err(|err| store_fault(err, group_key))?;
        let (entry, _) = registry_with_patch(existing.as_ref(), group_key, &context.operation.patch)?;
        self.store
            .put_registry(&entry)
            .await
            .map_err(|err| store_fault(err, group_key))?;

        let document = entry.to_document().map_err(|err| store_fault(err, group_key))?;
        let before = match existing {
            Some(existing) => existing
                .to_document()
                .map_err(|err| store_fault(err, group_key))?,
            None => Value::Null,
        };
        self.journal(context, before, document.clone()).await?;

        let target = ExpectedTarget::Registry(group_key.to_string());
        let expected = context
            .operation
            .patch
            .paths()
            .map(|path| {
                let field = path.strip_prefix(REGISTRY_PATH_PREFIX).unwrap_or(path);
                (target.clone(), path.to_string(), get_path(&document, field).cloned())
            })
            .collect();
        Ok(Effect::Applied {
            targets: vec![target],
            expected,
        })
    }

    /// Journals the targets a multi-target operation already wrote before `fault`
    /// stopped it, then hands the fault back.
    async fn journal_partial(
        &self,
        context: &OperationContext<'_>,
        before: Map<String, Value>,
        after: Map<String, Value>,
        mut fault: OperationFault,
    ) -> OperationFault {
        if before.is_empty() {
            return fault;
        }
        let written = before.len();
        tracing::warn!(
            job_id = %context.plan.job_id,
            index = context.index,
            written,
            targets = context.operation.targets.len(),
            "operation stopped after partial writes"
        );
        if let Err(journal_fault) = self
            .journal(context, Value::Object(before), Value::Object(after))
            .await
        {
            tracing::error!(
                job_id = %context.plan.job_id,
                index = context.index,
                error = %journal_fault,
                "partial writes not journaled"
            );
        }
        fault.message = format!(
            "{} ({written} of {} targets written)",
            fault.message,
            context.operation.targets.len()
        );
        fault
    }

    async fn journal(
        &self,
        context: &OperationContext<'_>,
        before: Value,
        after: Value,
    ) -> Result<(), OperationFault> {
        let operation = context.operation;
        let entry = JournalEntry {
            change_id: context.change_id.to_string(),
            job_id: context.plan.job_id.clone(),
            job_type: context.plan.job_type,
            operation_index: context.index,
            op_type: operation.op_type,
            targets: operation.targets.clone(),
            before: Some(before),
            after: Some(after),
            idempotency_key: context.key.to_string(),
            rationale: operation.rationale.clone(),
            applied_at_ms: now_ms(),
        };
        self.journal.append(&entry).await.map_err(|err| {
            OperationFault::new(
                ErrorCode::Exception,
                operation.first_target(),
                format!("journal append failed after write: {err}"),
            )
        })
    }
}

fn change_values(changes: &[FieldChange], pick: impl Fn(&FieldChange) -> &Option<Value>) -> Value {
    Value::Object(
        changes
            .iter()
            .map(|change| (change.path.clone(), pick(change).clone().unwrap_or(Value::Null)))
            .collect(),
    )
}

fn fields_of(record: &Record, patch: &Patch) -> Value {
    let document = record.to_document().unwrap_or(Value::Null);
    Value::Object(
        patch
            .paths()
            .map(|path| {
                (
                    path.to_string(),
                    get_path(&document, path).cloned().unwrap_or(Value::Null),
                )
            })
            .collect(),
    )
}

/// Expected values for the patched paths, read from the normalised record so
/// defaults (an emptied list, a dropped optional) match what the store returns.
fn record_expectations(record: &Record, patch: &Patch) -> Vec<Expected> {
    let document = record.to_document().unwrap_or(Value::Null);
    patch
        .paths()
        .map(|path| {
            (
                ExpectedTarget::Record(record.id.clone()),
                path.to_string(),
                get_path(&document, path).cloned(),
            )
        })
        .collect()
}
