//! Pre-apply simulation of a change plan against a read-only snapshot.
//!
//! `compile` never performs I/O. It runs the same mutation rules as the apply
//! engine over a copy-on-write clone of the snapshot, so validation and dry-run
//! previews reason about the result of a plan rather than its steps.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{Record, Snapshot};
use crate::error::{ErrorCode, OperationFault};
use crate::mutation::{
    FieldChange, alias_from_upsert, build_created_record, effective_patch, patch_record,
    record_targets, registry_with_patch, single_target,
};
use crate::plan::{ChangePlan, OpType, Operation, PatchValue};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompileError {
    pub index: usize,
    pub op_type: OpType,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OperationDiff {
    pub index: usize,
    pub op_type: OpType,
    pub changes: Vec<FieldChange>,
    /// Set when the operation would not write, e.g. a create whose id exists.
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompiledPlan {
    pub before_state: Snapshot,
    pub post_state: Snapshot,
    pub diffs: Vec<OperationDiff>,
    pub primary_equipment: BTreeSet<String>,
    pub touched_slugs: BTreeSet<String>,
    pub touched_aliases: BTreeSet<String>,
    pub errors: Vec<CompileError>,
}

impl CompiledPlan {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.diffs
            .iter()
            .filter(|diff| !diff.skipped)
            .map(|diff| diff.changes.len())
            .sum()
    }
}

struct Simulated {
    changes: Vec<FieldChange>,
    skipped: bool,
}

impl Simulated {
    fn applied(changes: Vec<FieldChange>) -> Self {
        Self {
            changes,
            skipped: false,
        }
    }
}

pub fn compile(plan: &ChangePlan, snapshot: &Snapshot) -> CompiledPlan {
    let mut post = snapshot.clone();
    let mut diffs = Vec::new();
    let mut errors = Vec::new();
    let mut touched_slugs = BTreeSet::new();
    let mut touched_aliases = BTreeSet::new();

    for (index, operation) in plan.operations.iter().enumerate() {
        if operation.op_type == OpType::NoOp {
            continue;
        }
        match simulate(
            &mut post,
            operation,
            &mut touched_slugs,
            &mut touched_aliases,
        ) {
            Ok(simulated) => diffs.push(OperationDiff {
                index,
                op_type: operation.op_type,
                changes: simulated.changes,
                skipped: simulated.skipped,
            }),
            Err(fault) => {
                tracing::debug!(
                    job_id = %plan.job_id,
                    index,
                    op_type = %operation.op_type,
                    code = %fault.code,
                    "operation skipped during compile"
                );
                errors.push(CompileError {
                    index,
                    op_type: operation.op_type,
                    code: fault.code,
                    target: fault.target,
                    message: fault.message,
                });
            }
        }
    }

    let primary_equipment = post
        .active_records()
        .filter_map(Record::primary_equipment)
        .map(str::to_string)
        .collect();

    CompiledPlan {
        before_state: snapshot.clone(),
        post_state: post,
        diffs,
        primary_equipment,
        touched_slugs,
        touched_aliases,
        errors,
    }
}

fn simulate(
    post: &mut Snapshot,
    operation: &Operation,
    touched_slugs: &mut BTreeSet<String>,
    touched_aliases: &mut BTreeSet<String>,
) -> Result<Simulated, OperationFault> {
    match operation.op_type {
        OpType::RenameRecord
        | OpType::PatchFields
        | OpType::DeprecateRecord
        | OpType::ReassignGroup => {
            let patch = effective_patch(operation)?;
            let targets = record_targets(operation)?;

            // Resolve every target before touching the copy so a bad target
            // leaves the post-state exactly as it was.
            let mut staged = Vec::with_capacity(targets.len());
            for target in targets {
                let record = post
                    .record(target)
                    .ok_or_else(|| OperationFault::not_found(target, "record"))?;
                staged.push(patch_record(record, &patch)?);
            }

            let mut changes = Vec::new();
            for (updated, record_changes) in staged {
                touched_slugs.insert(updated.name_slug.clone());
                changes.extend(record_changes);
                match post.records.get_mut(&updated.id) {
                    Some(slot) => *Arc::make_mut(slot) = updated,
                    None => {
                        post.records.insert(updated.id.clone(), Arc::new(updated));
                    }
                }
            }
            Ok(Simulated::applied(changes))
        }
        OpType::CreateRecord => {
            let record = build_created_record(&operation.patch)?;
            if post.records.contains_key(&record.id) {
                return Ok(Simulated {
                    changes: Vec::new(),
                    skipped: true,
                });
            }
            let changes = operation
                .patch
                .iter()
                .filter_map(|(path, value)| match value {
                    PatchValue::Set(value) => Some(FieldChange {
                        target: record.id.clone(),
                        path: path.to_string(),
                        before: None,
                        after: Some(value.clone()),
                    }),
                    PatchValue::Delete => None,
                })
                .collect();
            touched_slugs.insert(record.name_slug.clone());
            post.records.insert(record.id.clone(), Arc::new(record));
            Ok(Simulated::applied(changes))
        }
        OpType::UpsertAlias => {
            let slug = single_target(operation)?;
            let alias = alias_from_upsert(slug, &operation.patch)?;
            let before = post.aliases.get(slug).map(|alias| alias.to_value());
            let after = alias.to_value();
            touched_aliases.insert(slug.to_string());
            post.aliases.insert(slug.to_string(), alias);
            Ok(Simulated::applied(vec![FieldChange {
                target: slug.to_string(),
                path: "alias".into(),
                before,
                after: Some(after),
            }]))
        }
        OpType::DeleteAlias => {
            let slugs = record_targets(operation)?;
            let mut changes = Vec::new();
            for slug in slugs {
                touched_aliases.insert(slug.clone());
                if let Some(removed) = post.aliases.remove(slug) {
                    changes.push(FieldChange {
                        target: slug.clone(),
                        path: "alias".into(),
                        before: Some(removed.to_value()),
                        after: None,
                    });
                }
            }
            Ok(Simulated::applied(changes))
        }
        OpType::UpdateGroupRegistry => {
            let group_key = single_target(operation)?;
            if group_key != post.group_key {
                return Err(OperationFault::new(
                    ErrorCode::InvalidPayload,
                    Some(group_key),
                    format!(
                        "registry update targets '{group_key}' but the snapshot holds '{}'",
                        post.group_key
                    ),
                ));
            }
            let (entry, changes) =
                registry_with_patch(post.registry.as_ref(), group_key, &operation.patch)?;
            post.registry = Some(entry);
            Ok(Simulated::applied(changes))
        }
        OpType::NoOp => Ok(Simulated {
            changes: Vec::new(),
            skipped: true,
        }),
    }
}

/// Compact JSON view of a compiled plan for job results and dry-run output.
pub fn preview_value(compiled: &CompiledPlan) -> Value {
    serde_json::json!({
        "diffs": compiled.diffs,
        "errors": compiled.errors,
        "primary_equipment": compiled.primary_equipment,
        "touched_slugs": compiled.touched_slugs,
        "touched_aliases": compiled.touched_aliases,
    })
}
