//! Field path allow-list and dotted-path helpers for JSON documents.
//!
//! Every patch in a plan is checked here before the apply engine performs a
//! single write. The same helpers drive both simulated and real mutations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DomainResult;
use crate::catalog::{CONTRIBUTION_TOLERANCE, RecordStatus};
use crate::error::DomainError;
use crate::plan::{ChangePlan, OpType, Patch, PatchValue};

pub const ALIAS_PATH_PREFIX: &str = "alias.";
pub const ALIAS_RECORD_PATH: &str = "alias.record_id";
pub const ALIAS_GROUP_PATH: &str = "alias.group_key";
pub const REGISTRY_PATH_PREFIX: &str = "registry.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FieldKind {
    RequiredText,
    Text,
    TextList,
    Flag,
    Contribution,
    Status,
    Object,
}

const RECORD_PATHS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::RequiredText),
    ("name_slug", FieldKind::RequiredText),
    ("group_key", FieldKind::RequiredText),
    ("equipment", FieldKind::TextList),
    ("category", FieldKind::Text),
    ("description", FieldKind::Text),
    ("muscles", FieldKind::Object),
    ("muscles.primary", FieldKind::TextList),
    ("muscles.secondary", FieldKind::TextList),
    ("muscles.category", FieldKind::TextList),
    ("muscles.contribution", FieldKind::Contribution),
    ("metadata.level", FieldKind::Text),
    ("metadata.plane_of_motion", FieldKind::Text),
    ("metadata.unilateral", FieldKind::Flag),
    ("movement.type", FieldKind::Text),
    ("movement.split", FieldKind::Text),
    ("status", FieldKind::Status),
];

const REGISTRY_PATHS: &[(&str, FieldKind)] = &[
    ("registry.display_name", FieldKind::Text),
    ("registry.equipment_variants", FieldKind::TextList),
    ("registry.primary_equipment", FieldKind::Text),
];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathViolation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_index: Option<usize>,
    pub path: String,
    pub reason: String,
}

impl PathViolation {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            operation_index: None,
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

pub fn is_allowed_path(path: &str) -> bool {
    is_alias_field(path) || lookup_kind(path).is_some()
}

fn is_alias_field(path: &str) -> bool {
    path == ALIAS_RECORD_PATH || path == ALIAS_GROUP_PATH
}

fn lookup_kind(path: &str) -> Option<FieldKind> {
    RECORD_PATHS
        .iter()
        .chain(REGISTRY_PATHS.iter())
        .find(|(allowed, _)| *allowed == path)
        .map(|(_, kind)| *kind)
}

/// Checks every path of a patch against the allow-list and its value type.
pub fn validate_patch(patch: &Patch) -> Vec<PathViolation> {
    let mut violations = Vec::new();
    for (path, value) in patch.iter() {
        if path.starts_with(ALIAS_PATH_PREFIX) {
            if !is_alias_field(path) {
                violations.push(PathViolation::new(path, "unknown alias field"));
            } else if let PatchValue::Set(value) = value {
                if !(value.is_string() || value.is_null()) {
                    violations.push(PathViolation::new(path, "alias target must be a string"));
                }
            }
            continue;
        }

        let Some(kind) = lookup_kind(path) else {
            violations.push(PathViolation::new(path, "path is not in the allow-list"));
            continue;
        };

        match value {
            PatchValue::Delete => {
                if kind == FieldKind::RequiredText {
                    violations.push(PathViolation::new(path, "required field cannot be deleted"));
                }
            }
            PatchValue::Set(value) => {
                if let Some(reason) = type_violation(kind, value) {
                    violations.push(PathViolation::new(path, reason));
                } else if kind == FieldKind::Object {
                    violations.extend(object_member_violations(path, value));
                }
            }
        }
    }
    violations
}

/// A whole-object write gets the same checks as writing each member path.
fn object_member_violations(path: &str, value: &Value) -> Vec<PathViolation> {
    let Some(members) = value.as_object() else {
        return Vec::new();
    };
    members
        .iter()
        .filter_map(|(key, member)| {
            let member_path = format!("{path}.{key}");
            let reason = match lookup_kind(&member_path) {
                Some(kind) => type_violation(kind, member)?,
                None => "path is not in the allow-list".to_string(),
            };
            Some(PathViolation::new(&member_path, reason))
        })
        .collect()
}

fn type_violation(kind: FieldKind, value: &Value) -> Option<String> {
    match kind {
        FieldKind::RequiredText => match value.as_str() {
            Some(text) if !text.trim().is_empty() => None,
            _ => Some("expected a non-empty string".into()),
        },
        FieldKind::Text => (!value.is_string()).then(|| "expected a string".into()),
        FieldKind::TextList => match value.as_array() {
            Some(items) if items.iter().all(Value::is_string) => None,
            _ => Some("expected a list of strings".into()),
        },
        FieldKind::Flag => (!value.is_boolean()).then(|| "expected a boolean".into()),
        FieldKind::Object => (!value.is_object()).then(|| "expected an object".into()),
        FieldKind::Status => match value.as_str().map(str::parse::<RecordStatus>) {
            Some(Ok(_)) => None,
            _ => Some("expected one of active, deprecated, legacy".into()),
        },
        FieldKind::Contribution => {
            let Some(shares) = value.as_object() else {
                return Some("expected a muscle to share map".into());
            };
            let mut total = 0.0;
            for share in shares.values() {
                match share.as_f64() {
                    Some(share) if share >= 0.0 => total += share,
                    _ => return Some("contribution shares must be non-negative numbers".into()),
                }
            }
            if !shares.is_empty() && (total - 1.0).abs() > CONTRIBUTION_TOLERANCE {
                return Some(format!("contribution shares sum to {total:.3}, expected 1.0"));
            }
            None
        }
    }
}

fn path_fits_operation(op_type: OpType, path: &str) -> bool {
    let is_alias = path.starts_with(ALIAS_PATH_PREFIX);
    let is_registry = path.starts_with(REGISTRY_PATH_PREFIX);
    match op_type {
        OpType::UpsertAlias | OpType::DeleteAlias => is_alias,
        OpType::UpdateGroupRegistry => is_registry,
        OpType::NoOp => true,
        OpType::RenameRecord => path == "name" || path == "name_slug",
        OpType::ReassignGroup => path == "group_key",
        OpType::PatchFields | OpType::CreateRecord | OpType::DeprecateRecord => {
            !is_alias && !is_registry
        }
    }
}

/// Validates every operation of a plan; any violation aborts the whole apply.
pub fn validate_plan(plan: &ChangePlan) -> Vec<PathViolation> {
    let mut violations = Vec::new();
    for (index, operation) in plan.operations.iter().enumerate() {
        let mut found = validate_patch(&operation.patch);
        for path in operation.patch.paths() {
            if is_allowed_path(path) && !path_fits_operation(operation.op_type, path) {
                found.push(PathViolation::new(
                    path,
                    format!("path is not valid for {}", operation.op_type),
                ));
            }
        }
        violations.extend(found.into_iter().map(|mut violation| {
            violation.operation_index = Some(index);
            violation
        }));
    }
    violations
}

pub fn get_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

/// Writes `value` at `path`, creating intermediate objects as needed.
pub fn set_path(document: &mut Value, path: &str, value: Value) -> DomainResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(DomainError::Validation("empty field path".into()));
    };

    let mut current = document;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(DomainError::Validation(format!(
                "cannot descend into non-object at '{segment}' of '{path}'"
            )));
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    let Value::Object(map) = current else {
        return Err(DomainError::Validation(format!(
            "cannot set '{path}' on a non-object"
        )));
    };
    map.insert(last.to_string(), value);
    Ok(())
}

/// Removes the field at `path`, returning the previous value.
pub fn remove_path(document: &mut Value, path: &str) -> Option<Value> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let container = match parent {
        Some(parent) => parent
            .split('.')
            .try_fold(document, |current, segment| current.get_mut(segment))?,
        None => document,
    };
    container.as_object_mut()?.remove(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Operation;
    use crate::ports::jobs::JobType;
    use serde_json::json;

    #[test]
    fn unknown_paths_are_rejected() {
        let patch = Patch::new()
            .set("description", "ok")
            .set("muscles.primary", json!(["chest"]))
            .set("owner", "someone")
            .set("id", "forged");
        let violations = validate_patch(&patch);
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["id", "owner"]);
    }

    #[test]
    fn only_alias_target_fields_pass_the_alias_prefix() {
        let patch = Patch::new().set(ALIAS_RECORD_PATH, "r-1");
        assert!(validate_patch(&patch).is_empty());
        assert!(!is_allowed_path("alias.note"));

        let unknown = Patch::new()
            .set(ALIAS_GROUP_PATH, "squat")
            .set("alias.note", "legacy redirect");
        let violations = validate_patch(&unknown);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "alias.note");

        let bad = Patch::new().set(ALIAS_GROUP_PATH, 42);
        assert_eq!(validate_patch(&bad).len(), 1);
    }

    #[test]
    fn whole_muscles_object_is_checked_like_its_members() {
        let unbalanced = Patch::new().set(
            "muscles",
            json!({"primary": ["chest"], "contribution": {"chest": 0.5, "triceps": 0.2}}),
        );
        let violations = validate_patch(&unbalanced);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "muscles.contribution");

        let stray = Patch::new().set("muscles", json!({"primary": "chest", "grip": "wide"}));
        let paths: Vec<_> = validate_patch(&stray).into_iter().map(|v| v.path).collect();
        assert_eq!(paths, vec!["muscles.grip", "muscles.primary"]);

        let balanced = Patch::new().set(
            "muscles",
            json!({"primary": ["chest"], "contribution": {"chest": 0.8, "triceps": 0.2}}),
        );
        assert!(validate_patch(&balanced).is_empty());
    }

    #[test]
    fn value_types_are_checked() {
        let patch = Patch::new()
            .set("metadata.unilateral", "yes")
            .set("equipment", json!(["barbell", 3]))
            .set("status", "retired")
            .set("muscles.contribution", json!({"chest": 0.5, "triceps": 0.2}))
            .delete("name");
        let violations = validate_patch(&patch);
        assert_eq!(violations.len(), 5);
    }

    #[test]
    fn balanced_contribution_passes() {
        let patch = Patch::new().set(
            "muscles.contribution",
            json!({"chest": 0.7, "triceps": 0.2, "front_delts": 0.1}),
        );
        assert!(validate_patch(&patch).is_empty());
    }

    #[test]
    fn plan_validation_tags_operation_index_and_scope() {
        let plan = ChangePlan::new("job-1", JobType::PlanApply)
            .with_operation(Operation::patch_fields("r-1", Patch::new().set("description", "ok")))
            .with_operation(Operation::patch_fields(
                "r-1",
                Patch::new().set("registry.display_name", "Bench"),
            ))
            .with_operation(Operation::patch_fields("r-2", Patch::new().set("bogus", 1)));
        let violations = validate_plan(&plan);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].operation_index, Some(1));
        assert_eq!(violations[1].operation_index, Some(2));
    }

    #[test]
    fn dotted_paths_set_get_and_remove() {
        let mut document = json!({"name": "Squat", "metadata": null});
        set_path(&mut document, "metadata.level", json!("beginner")).expect("set nested");
        set_path(&mut document, "movement.type", json!("squat")).expect("create parents");
        assert_eq!(get_path(&document, "metadata.level"), Some(&json!("beginner")));
        assert_eq!(get_path(&document, "movement.type"), Some(&json!("squat")));

        assert_eq!(remove_path(&mut document, "metadata.level"), Some(json!("beginner")));
        assert_eq!(get_path(&document, "metadata.level"), None);
        assert_eq!(remove_path(&mut document, "missing.path"), None);

        assert!(set_path(&mut document, "name.first", json!("x")).is_err());
    }
}
