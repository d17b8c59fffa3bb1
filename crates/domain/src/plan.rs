use std::collections::BTreeMap;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ports::jobs::JobType;

/// Wire marker for "remove this field". Only recognised at deserialisation.
pub const DELETE_MARKER: &str = "$delete";

#[derive(Clone, Debug, PartialEq)]
pub enum PatchValue {
    Set(Value),
    Delete,
}

impl PatchValue {
    fn from_wire(value: Value) -> Self {
        match &value {
            Value::Object(map)
                if map.len() == 1 && map.get(DELETE_MARKER) == Some(&Value::Bool(true)) =>
            {
                Self::Delete
            }
            _ => Self::Set(value),
        }
    }

    pub fn as_set(&self) -> Option<&Value> {
        match self {
            Self::Set(value) => Some(value),
            Self::Delete => None,
        }
    }
}

impl Serialize for PatchValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Set(value) => value.serialize(serializer),
            Self::Delete => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(DELETE_MARKER, &true)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PatchValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Self::from_wire)
    }
}

/// Dotted field path to value map. Iteration is in path order, so a parent path
/// is always written before its children.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Patch {
    entries: BTreeMap<String, PatchValue>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries
            .insert(path.into(), PatchValue::Set(value.into()));
        self
    }

    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.entries.insert(path.into(), PatchValue::Delete);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, value: PatchValue) {
        self.entries.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&PatchValue> {
        self.entries.get(path)
    }

    /// The value for `path` when it is set to a non-null value.
    pub fn set_value(&self, path: &str) -> Option<&Value> {
        self.get(path)
            .and_then(PatchValue::as_set)
            .filter(|value| !value.is_null())
    }

    pub fn set_str(&self, path: &str) -> Option<&str> {
        self.set_value(path).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PatchValue)> {
        self.entries
            .iter()
            .map(|(path, value)| (path.as_str(), value))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    RenameRecord,
    PatchFields,
    UpsertAlias,
    DeleteAlias,
    CreateRecord,
    DeprecateRecord,
    ReassignGroup,
    UpdateGroupRegistry,
    NoOp,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RenameRecord => "RENAME_RECORD",
            Self::PatchFields => "PATCH_FIELDS",
            Self::UpsertAlias => "UPSERT_ALIAS",
            Self::DeleteAlias => "DELETE_ALIAS",
            Self::CreateRecord => "CREATE_RECORD",
            Self::DeprecateRecord => "DEPRECATE_RECORD",
            Self::ReassignGroup => "REASSIGN_GROUP",
            Self::UpdateGroupRegistry => "UPDATE_GROUP_REGISTRY",
            Self::NoOp => "NO_OP",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Operations that rewrite fields of existing records.
    pub fn mutates_records(&self) -> bool {
        matches!(
            self,
            Self::RenameRecord | Self::PatchFields | Self::DeprecateRecord | Self::ReassignGroup
        )
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub op_type: OpType,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub patch: Patch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default)]
    pub idempotency_key_seed: String,
    #[serde(default)]
    pub rationale: String,
}

impl Operation {
    pub fn new(op_type: OpType, targets: Vec<String>, patch: Patch) -> Self {
        Self {
            op_type,
            targets,
            patch,
            before: None,
            after: None,
            idempotency_key_seed: String::new(),
            rationale: String::new(),
        }
    }

    pub fn no_op(rationale: impl Into<String>) -> Self {
        Self::new(OpType::NoOp, Vec::new(), Patch::new()).with_rationale(rationale)
    }

    pub fn rename_record(record_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            OpType::RenameRecord,
            vec![record_id.into()],
            Patch::new().set("name", Value::String(name.into())),
        )
    }

    pub fn patch_fields(record_id: impl Into<String>, patch: Patch) -> Self {
        Self::new(OpType::PatchFields, vec![record_id.into()], patch)
    }

    pub fn create_record(patch: Patch) -> Self {
        Self::new(OpType::CreateRecord, Vec::new(), patch)
    }

    pub fn upsert_alias_to_record(slug: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::new(
            OpType::UpsertAlias,
            vec![slug.into()],
            Patch::new().set(crate::paths::ALIAS_RECORD_PATH, Value::String(record_id.into())),
        )
    }

    pub fn upsert_alias_to_group(slug: impl Into<String>, group_key: impl Into<String>) -> Self {
        Self::new(
            OpType::UpsertAlias,
            vec![slug.into()],
            Patch::new().set(crate::paths::ALIAS_GROUP_PATH, Value::String(group_key.into())),
        )
    }

    pub fn delete_alias(slug: impl Into<String>) -> Self {
        Self::new(OpType::DeleteAlias, vec![slug.into()], Patch::new())
    }

    pub fn deprecate_record(record_id: impl Into<String>) -> Self {
        Self::new(OpType::DeprecateRecord, vec![record_id.into()], Patch::new())
    }

    pub fn reassign_group(record_ids: Vec<String>, group_key: impl Into<String>) -> Self {
        Self::new(
            OpType::ReassignGroup,
            record_ids,
            Patch::new().set("group_key", Value::String(group_key.into())),
        )
    }

    pub fn update_group_registry(group_key: impl Into<String>, patch: Patch) -> Self {
        Self::new(OpType::UpdateGroupRegistry, vec![group_key.into()], patch)
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.idempotency_key_seed = seed.into();
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn first_target(&self) -> Option<&str> {
        self.targets.first().map(String::as_str)
    }
}

/// Ordered proposal of mutations. Recompiled per execution, never stored.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChangePlan {
    pub job_id: String,
    pub job_type: JobType,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl ChangePlan {
    pub fn new(job_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            operations: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn mutating_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|operation| operation.op_type.is_mutating())
            .count()
    }

    pub fn is_read_only(&self) -> bool {
        self.mutating_count() == 0
    }
}
