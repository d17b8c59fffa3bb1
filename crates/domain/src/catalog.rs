use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::DomainResult;
use crate::error::{DomainError, ErrorCode};
use crate::ports::catalog::CatalogStore;

pub const ID_SEPARATOR: &str = "__";
pub const CONTRIBUTION_TOLERANCE: f64 = 0.02;

/// Deterministic id for a record created inside a group.
pub fn derive_record_id(group_key: &str, name_slug: &str) -> String {
    format!("{group_key}{ID_SEPARATOR}{name_slug}")
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Deprecated,
    Legacy,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Legacy => "legacy",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            "legacy" => Ok(Self::Legacy),
            _ => Err("unknown record status"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MuscleInvolvement {
    #[serde(default)]
    pub primary: Vec<String>,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub contribution: BTreeMap<String, f64>,
}

impl MuscleInvolvement {
    pub fn contribution_total(&self) -> f64 {
        self.contribution.values().sum()
    }

    /// An empty map is allowed; otherwise the shares must add up to one.
    pub fn contribution_is_balanced(&self) -> bool {
        self.contribution.is_empty()
            || (self.contribution_total() - 1.0).abs() <= CONTRIBUTION_TOLERANCE
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plane_of_motion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unilateral: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Movement {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub name: String,
    pub name_slug: String,
    pub group_key: String,
    #[serde(default)]
    pub equipment: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub muscles: MuscleInvolvement,
    #[serde(default)]
    pub metadata: RecordMetadata,
    #[serde(default)]
    pub movement: Movement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
}

impl Record {
    pub fn new(
        group_key: impl Into<String>,
        name: impl Into<String>,
        equipment: Vec<String>,
    ) -> Self {
        let group_key = group_key.into();
        let name = name.into();
        let name_slug = crate::util::slugify(&name);
        Self {
            id: derive_record_id(&group_key, &name_slug),
            name,
            name_slug,
            group_key,
            equipment,
            category: None,
            description: None,
            muscles: MuscleInvolvement::default(),
            metadata: RecordMetadata::default(),
            movement: Movement::default(),
            status: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.status, Some(RecordStatus::Deprecated))
    }

    pub fn primary_equipment(&self) -> Option<&str> {
        self.equipment.first().map(String::as_str)
    }

    pub fn to_document(&self) -> DomainResult<Value> {
        serde_json::to_value(self)
            .map_err(|err| DomainError::Validation(format!("invalid record document: {err}")))
    }

    pub fn from_document(document: Value) -> DomainResult<Self> {
        serde_json::from_value(document)
            .map_err(|err| DomainError::Validation(format!("invalid record document: {err}")))
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AliasError {
    #[error("alias must not set both record_id and group_key")]
    BothFields,
    #[error("alias must set exactly one of record_id or group_key")]
    NoTarget,
}

impl AliasError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BothFields => ErrorCode::AliasBothFields,
            Self::NoTarget => ErrorCode::AliasNoTarget,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AliasTarget {
    Record(String),
    Group(String),
}

/// Lookup slug resolving to exactly one record or one whole group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "AliasDocument", into = "AliasDocument")]
pub struct Alias {
    pub slug: String,
    pub target: AliasTarget,
}

/// Stored form of an alias. Only converted into [`Alias`] through the XOR check.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasDocument {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

impl Alias {
    pub fn new(
        slug: impl Into<String>,
        record_id: Option<String>,
        group_key: Option<String>,
    ) -> Result<Self, AliasError> {
        let record_id = record_id.filter(|value| !value.trim().is_empty());
        let group_key = group_key.filter(|value| !value.trim().is_empty());
        let target = match (record_id, group_key) {
            (Some(_), Some(_)) => return Err(AliasError::BothFields),
            (None, None) => return Err(AliasError::NoTarget),
            (Some(record_id), None) => AliasTarget::Record(record_id),
            (None, Some(group_key)) => AliasTarget::Group(group_key),
        };
        Ok(Self {
            slug: slug.into(),
            target,
        })
    }

    pub fn to_record(slug: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            target: AliasTarget::Record(record_id.into()),
        }
    }

    pub fn to_group(slug: impl Into<String>, group_key: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            target: AliasTarget::Group(group_key.into()),
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        match &self.target {
            AliasTarget::Record(record_id) => Some(record_id),
            AliasTarget::Group(_) => None,
        }
    }

    pub fn group_key(&self) -> Option<&str> {
        match &self.target {
            AliasTarget::Group(group_key) => Some(group_key),
            AliasTarget::Record(_) => None,
        }
    }

    pub fn to_document(&self) -> AliasDocument {
        AliasDocument::from(self.clone())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_document()).unwrap_or(Value::Null)
    }
}

impl TryFrom<AliasDocument> for Alias {
    type Error = AliasError;

    fn try_from(document: AliasDocument) -> Result<Self, Self::Error> {
        Alias::new(document.slug, document.record_id, document.group_key)
    }
}

impl From<Alias> for AliasDocument {
    fn from(alias: Alias) -> Self {
        let (record_id, group_key) = match alias.target {
            AliasTarget::Record(record_id) => (Some(record_id), None),
            AliasTarget::Group(group_key) => (None, Some(group_key)),
        };
        Self {
            slug: alias.slug,
            record_id,
            group_key,
        }
    }
}

/// Group-level metadata describing which equipment variants a family spans.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupRegistryEntry {
    pub group_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub equipment_variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_equipment: Option<String>,
}

impl GroupRegistryEntry {
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            display_name: None,
            equipment_variants: Vec::new(),
            primary_equipment: None,
        }
    }

    pub fn spans_multiple_variants(&self) -> bool {
        self.equipment_variants.len() > 1
    }

    pub fn to_document(&self) -> DomainResult<Value> {
        serde_json::to_value(self)
            .map_err(|err| DomainError::Validation(format!("invalid registry document: {err}")))
    }

    pub fn from_document(document: Value) -> DomainResult<Self> {
        serde_json::from_value(document)
            .map_err(|err| DomainError::Validation(format!("invalid registry document: {err}")))
    }
}

/// Point-in-time copy of everything relevant to one group.
///
/// Records are shared, so cloning a snapshot copies pointers and a simulated
/// mutation only clones the record it touches.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub group_key: String,
    pub records: BTreeMap<String, Arc<Record>>,
    pub aliases: BTreeMap<String, Alias>,
    pub registry: Option<GroupRegistryEntry>,
}

impl Snapshot {
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            ..Self::default()
        }
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.records.insert(record.id.clone(), Arc::new(record));
        self
    }

    pub fn with_alias(mut self, alias: Alias) -> Self {
        self.aliases.insert(alias.slug.clone(), alias);
        self
    }

    pub fn with_registry(mut self, registry: GroupRegistryEntry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn record(&self, record_id: &str) -> Option<&Record> {
        self.records.get(record_id).map(Arc::as_ref)
    }

    pub fn active_records(&self) -> impl Iterator<Item = &Record> {
        self.records
            .values()
            .map(Arc::as_ref)
            .filter(|record| record.is_active())
    }

    /// Records that still carry the snapshot's group key.
    pub fn group_records(&self) -> impl Iterator<Item = &Record> {
        self.records
            .values()
            .map(Arc::as_ref)
            .filter(|record| record.group_key == self.group_key)
    }
}

pub async fn load_snapshot(store: &dyn CatalogStore, group_key: &str) -> DomainResult<Snapshot> {
    let records = store.list_records_by_group(group_key).await?;
    let record_ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
    let aliases = store.list_aliases(group_key, &record_ids).await?;
    let registry = store.get_registry(group_key).await?;

    let mut snapshot = Snapshot::new(group_key);
    for record in records {
        snapshot.records.insert(record.id.clone(), Arc::new(record));
    }
    for alias in aliases {
        snapshot.aliases.insert(alias.slug.clone(), alias);
    }
    snapshot.registry = registry;

    tracing::debug!(
        group_key,
        records = snapshot.records.len(),
        aliases = snapshot.aliases.len(),
        has_registry = snapshot.registry.is_some(),
        "snapshot loaded"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derived_id_joins_group_and_slug() {
        assert_eq!(derive_record_id("bench-press", "dumbbell-bench-press"), "bench-press__dumbbell-bench-press");
        let record = Record::new("bench-press", "Dumbbell Bench Press", vec!["dumbbell".into()]);
        assert_eq!(record.id, "bench-press__dumbbell-bench-press");
        assert_eq!(record.name_slug, "dumbbell-bench-press");
    }

    #[test]
    fn alias_rejects_both_and_neither_targets() {
        assert_eq!(
            Alias::new("db-bench", Some("r-1".into()), Some("bench".into())),
            Err(AliasError::BothFields)
        );
        assert_eq!(Alias::new("db-bench", None, None), Err(AliasError::NoTarget));
        assert_eq!(
            Alias::new("db-bench", Some("  ".into()), None),
            Err(AliasError::NoTarget)
        );
        let alias = Alias::new("db-bench", Some("r-1".into()), None).expect("valid alias");
        assert_eq!(alias.record_id(), Some("r-1"));
        assert_eq!(alias.group_key(), None);
    }

    #[test]
    fn alias_document_is_checked_on_read() {
        let both = json!({"slug": "x", "record_id": "r-1", "group_key": "g"});
        assert!(serde_json::from_value::<Alias>(both).is_err());
        let neither = json!({"slug": "x"});
        assert!(serde_json::from_value::<Alias>(neither).is_err());
        let group = json!({"slug": "x", "group_key": "g"});
        let alias: Alias = serde_json::from_value(group).expect("group alias");
        assert_eq!(alias.target, AliasTarget::Group("g".into()));
        assert_eq!(alias.to_value(), json!({"slug": "x", "group_key": "g"}));
    }

    #[test]
    fn contribution_balance_tolerates_rounding() {
        let mut muscles = MuscleInvolvement::default();
        assert!(muscles.contribution_is_balanced());
        muscles.contribution.insert("chest".into(), 0.6);
        muscles.contribution.insert("triceps".into(), 0.39);
        assert!(muscles.contribution_is_balanced());
        muscles.contribution.insert("front_delts".into(), 0.2);
        assert!(!muscles.contribution_is_balanced());
    }

    #[test]
    fn record_document_omits_unset_optionals() {
        let record = Record::new("squat", "Goblet Squat", vec!["kettlebell".into()]);
        let document = record.to_document().expect("document");
        assert!(document.get("description").is_none());
        assert!(document.get("status").is_none());
        assert_eq!(Record::from_document(document).expect("roundtrip"), record);
    }
}
