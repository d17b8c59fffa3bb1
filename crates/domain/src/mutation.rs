//! Pure mutation rules shared by the plan compiler and the apply engine.
//!
//! The compiler runs these against a snapshot, the engine against documents it
//! just read from the store, so a predicted post-state and an applied one are
//! produced by the same code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::{Alias, GroupRegistryEntry, Record, RecordStatus, derive_record_id};
use crate::error::{ErrorCode, OperationFault};
use crate::paths::{
    ALIAS_GROUP_PATH, ALIAS_RECORD_PATH, REGISTRY_PATH_PREFIX, get_path, remove_path, set_path,
};
use crate::plan::{OpType, Operation, Patch, PatchValue};
use crate::util::slugify;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub target: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

pub fn single_target(operation: &Operation) -> Result<&str, OperationFault> {
    match operation.targets.as_slice() {
        [target] if !target.trim().is_empty() => Ok(target),
        _ => Err(OperationFault::new(
            ErrorCode::InvalidPayload,
            None,
            format!("{} expects exactly one target", operation.op_type),
        )),
    }
}

pub fn record_targets(operation: &Operation) -> Result<&[String], OperationFault> {
    if operation.targets.is_empty() {
        return Err(OperationFault::new(
            ErrorCode::InvalidPayload,
            None,
            format!("{} requires at least one target", operation.op_type),
        ));
    }
    Ok(&operation.targets)
}

/// Lowers a record-level operation to the field patch it amounts to.
pub fn effective_patch(operation: &Operation) -> Result<Patch, OperationFault> {
    match operation.op_type {
        OpType::PatchFields => {
            if operation.patch.is_empty() {
                return Err(OperationFault::new(
                    ErrorCode::InvalidPayload,
                    operation.first_target(),
                    "patch is empty",
                ));
            }
            Ok(operation.patch.clone())
        }
        OpType::RenameRecord => {
            let name = operation.patch.set_str("name").ok_or_else(|| {
                OperationFault::new(
                    ErrorCode::InvalidPayload,
                    operation.first_target(),
                    "rename requires a new name",
                )
            })?;
            let name_slug = operation
                .patch
                .set_str("name_slug")
                .map(str::to_string)
                .unwrap_or_else(|| slugify(name));
            Ok(Patch::new().set("name", name).set("name_slug", name_slug))
        }
        OpType::DeprecateRecord => {
            Ok(Patch::new().set("status", RecordStatus::Deprecated.as_str()))
        }
        OpType::ReassignGroup => {
            let group_key = operation.patch.set_str("group_key").ok_or_else(|| {
                OperationFault::new(
                    ErrorCode::InvalidPayload,
                    operation.first_target(),
                    "reassign requires a target group_key",
                )
            })?;
            Ok(Patch::new().set("group_key", group_key))
        }
        other => Err(OperationFault::new(
            ErrorCode::UnsupportedOp,
            operation.first_target(),
            format!("{other} is not a record field mutation"),
        )),
    }
}

/// Applies a patch to a record, returning the new record and per-path changes.
pub fn patch_record(
    record: &Record,
    patch: &Patch,
) -> Result<(Record, Vec<FieldChange>), OperationFault> {
    let mut document = record.to_document().map_err(|err| {
        OperationFault::new(ErrorCode::Exception, Some(&record.id), err.to_string())
    })?;
    let mut changes = Vec::with_capacity(patch.len());

    for (path, value) in patch.iter() {
        let before = get_path(&document, path).cloned();
        match value {
            PatchValue::Set(value) => {
                set_path(&mut document, path, value.clone()).map_err(|err| {
                    OperationFault::new(ErrorCode::InvalidPayload, Some(&record.id), err.to_string())
                })?;
            }
            PatchValue::Delete => {
                remove_path(&mut document, path);
            }
        }
        let after = get_path(&document, path).cloned();
        changes.push(FieldChange {
            target: record.id.clone(),
            path: path.to_string(),
            before,
            after,
        });
    }

    let updated = Record::from_document(document).map_err(|err| {
        OperationFault::new(ErrorCode::InvalidPayload, Some(&record.id), err.to_string())
    })?;
    Ok((updated, changes))
}

/// Builds the record a `CREATE_RECORD` operation describes. The id is derived,
/// never supplied.
pub fn build_created_record(patch: &Patch) -> Result<Record, OperationFault> {
    let mut document = Value::Object(Map::new());
    for (path, value) in patch.iter() {
        if let PatchValue::Set(value) = value {
            set_path(&mut document, path, value.clone()).map_err(|err| {
                OperationFault::new(ErrorCode::InvalidPayload, None, err.to_string())
            })?;
        }
    }

    let name = patch
        .set_str("name")
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| OperationFault::new(ErrorCode::InvalidPayload, None, "create requires a name"))?;
    let group_key = patch
        .set_str("group_key")
        .filter(|group_key| !group_key.trim().is_empty())
        .ok_or_else(|| {
            OperationFault::new(ErrorCode::InvalidPayload, None, "create requires a group_key")
        })?;
    let name_slug = patch
        .set_str("name_slug")
        .map(str::to_string)
        .unwrap_or_else(|| slugify(name));
    let record_id = derive_record_id(group_key, &name_slug);

    if let Value::Object(map) = &mut document {
        map.insert("id".into(), Value::String(record_id.clone()));
        map.insert("name_slug".into(), Value::String(name_slug));
    }
    Record::from_document(document).map_err(|err| {
        OperationFault::new(ErrorCode::InvalidPayload, Some(&record_id), err.to_string())
    })
}

/// Builds the alias an `UPSERT_ALIAS` describes, enforcing record XOR group.
pub fn alias_from_upsert(slug: &str, patch: &Patch) -> Result<Alias, OperationFault> {
    let record_id = patch.set_str(ALIAS_RECORD_PATH).map(str::to_string);
    let group_key = patch.set_str(ALIAS_GROUP_PATH).map(str::to_string);
    Alias::new(slug, record_id, group_key)
        .map_err(|err| OperationFault::new(err.code(), Some(slug), err.to_string()))
}

/// Applies `registry.*` paths to an existing (or fresh) registry entry.
pub fn registry_with_patch(
    existing: Option<&GroupRegistryEntry>,
    group_key: &str,
    patch: &Patch,
) -> Result<(GroupRegistryEntry, Vec<FieldChange>), OperationFault> {
    let base = existing
        .cloned()
        .unwrap_or_else(|| GroupRegistryEntry::new(group_key));
    let mut document = base.to_document().map_err(|err| {
        OperationFault::new(ErrorCode::Exception, Some(group_key), err.to_string())
    })?;
    let mut changes = Vec::with_capacity(patch.len());

    for (path, value) in patch.iter() {
        let Some(field) = path.strip_prefix(REGISTRY_PATH_PREFIX) else {
            return Err(OperationFault::new(
                ErrorCode::UnsupportedOp,
                Some(group_key),
                format!("'{path}' is not a registry path"),
            ));
        };
        let before = get_path(&document, field).cloned();
        match value {
            PatchValue::Set(value) => set_path(&mut document, field, value.clone()).map_err(|err| {
                OperationFault::new(ErrorCode::InvalidPayload, Some(group_key), err.to_string())
            })?,
            PatchValue::Delete => {
                remove_path(&mut document, field);
            }
        }
        changes.push(FieldChange {
            target: group_key.to_string(),
            path: path.to_string(),
            before,
            after: get_path(&document, field).cloned(),
        });
    }

    let entry = GroupRegistryEntry::from_document(document).map_err(|err| {
        OperationFault::new(ErrorCode::InvalidPayload, Some(group_key), err.to_string())
    })?;
    Ok((entry, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bench() -> Record {
        Record::new("bench-press", "Bench Press", vec!["barbell".into()]).with_id("r-1")
    }

    #[test]
    fn rename_derives_slug_when_missing() {
        let operation = Operation::rename_record("r-1", "Barbell Bench Press");
        let patch = effective_patch(&operation).expect("patch");
        assert_eq!(patch.set_str("name_slug"), Some("barbell-bench-press"));

        let (renamed, changes) = patch_record(&bench(), &patch).expect("rename");
        assert_eq!(renamed.name, "Barbell Bench Press");
        assert_eq!(renamed.id, "r-1");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].before, Some(json!("Bench Press")));
    }

    #[test]
    fn delete_clears_optional_fields() {
        let mut record = bench();
        record.description = Some("old".into());
        let patch = Patch::new().delete("description").set("metadata.unilateral", true);
        let (updated, changes) = patch_record(&record, &patch).expect("patch");
        assert_eq!(updated.description, None);
        assert_eq!(updated.metadata.unilateral, Some(true));
        assert_eq!(changes[0].after, None);
    }

    #[test]
    fn created_record_id_is_deterministic() {
        let patch = Patch::new()
            .set("group_key", "bench-press")
            .set("name", "Incline Dumbbell Bench Press")
            .set("equipment", json!(["dumbbell"]));
        let first = build_created_record(&patch).expect("create");
        let second = build_created_record(&patch).expect("create again");
        assert_eq!(first.id, "bench-press__incline-dumbbell-bench-press");
        assert_eq!(first, second);

        let missing_group = Patch::new().set("name", "Orphan");
        let fault = build_created_record(&missing_group).expect_err("needs group");
        assert_eq!(fault.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn alias_upsert_enforces_xor() {
        let both = Patch::new()
            .set(ALIAS_RECORD_PATH, "r-1")
            .set(ALIAS_GROUP_PATH, "bench-press");
        assert_eq!(
            alias_from_upsert("bp", &both).expect_err("both").code,
            ErrorCode::AliasBothFields
        );
        let neither = Patch::new().delete(ALIAS_RECORD_PATH);
        assert_eq!(
            alias_from_upsert("bp", &neither).expect_err("neither").code,
            ErrorCode::AliasNoTarget
        );
    }

    #[test]
    fn registry_patch_strips_prefix() {
        let patch = Patch::new()
            .set("registry.equipment_variants", json!(["barbell", "dumbbell"]))
            .set("registry.display_name", "Bench Press");
        let (entry, changes) = registry_with_patch(None, "bench-press", &patch).expect("registry");
        assert_eq!(entry.group_key, "bench-press");
        assert!(entry.spans_multiple_variants());
        assert_eq!(changes.len(), 2);
    }
}
