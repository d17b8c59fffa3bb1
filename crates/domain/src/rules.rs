//! Deterministic audit rules over a group snapshot, and the rename plan that
//! normalisation derives from them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::catalog::{Record, Snapshot};
use crate::plan::{OpType, Operation, Patch};
use crate::util::slugify;

/// Non-canonical spellings found in names, as slug tokens.
const NAME_SPELLINGS: &[(&str, &str)] = &[
    ("db", "Dumbbell"),
    ("dumbell", "Dumbbell"),
    ("dumbel", "Dumbbell"),
    ("dumbells", "Dumbbell"),
    ("bb", "Barbell"),
    ("barbel", "Barbell"),
    ("kb", "Kettlebell"),
    ("kettelbell", "Kettlebell"),
];

/// Canonical display qualifier per equipment key.
const EQUIPMENT_QUALIFIERS: &[(&str, &str)] = &[
    ("dumbbell", "Dumbbell"),
    ("barbell", "Barbell"),
    ("kettlebell", "Kettlebell"),
    ("smith_machine", "Smith Machine"),
    ("smith-machine", "Smith Machine"),
    ("smith", "Smith Machine"),
    ("cable", "Cable"),
    ("machine", "Machine"),
    ("band", "Band"),
    ("resistance_band", "Band"),
    ("ez_bar", "EZ Bar"),
    ("ez-bar", "EZ Bar"),
    ("bodyweight", "Bodyweight"),
    ("trap_bar", "Trap Bar"),
];

/// Slug tokens that only carry equipment, stripped to compare base names.
const EQUIPMENT_TOKENS: &[&str] = &[
    "dumbbell", "db", "dumbell", "dumbel", "barbell", "bb", "barbel", "kettlebell", "kb",
    "smith", "machine", "cable", "band", "ez", "bodyweight", "trap",
];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    EquipmentNaming,
    MissingEquipmentQualifier,
    SlugMismatch,
    DuplicateEquipment,
    ContributionSum,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EquipmentNaming => "equipment_naming",
            Self::MissingEquipmentQualifier => "missing_equipment_qualifier",
            Self::SlugMismatch => "slug_mismatch",
            Self::DuplicateEquipment => "duplicate_equipment",
            Self::ContributionSum => "contribution_sum",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub kind: FindingKind,
    pub record_ids: Vec<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Finding {
    fn new(kind: FindingKind, record_ids: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            record_ids,
            message: message.into(),
            suggestion: None,
        }
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Informational plan entry for this finding. Never mutates.
    pub fn to_operation(&self) -> Operation {
        let mut after = json!({ "finding": self.kind.as_str() });
        if let Some(suggestion) = &self.suggestion {
            after["suggestion"] = json!(suggestion);
        }
        Operation::new(OpType::NoOp, self.record_ids.clone(), Patch::new())
            .with_rationale(format!("{}: {}", self.kind.as_str(), self.message))
            .with_after(after)
    }
}

/// Display qualifier for an equipment key, title-casing keys not in the table.
pub fn equipment_qualifier(equipment: &str) -> String {
    let key = equipment.trim().to_ascii_lowercase();
    if let Some((_, qualifier)) = EQUIPMENT_QUALIFIERS.iter().find(|(known, _)| *known == key) {
        return (*qualifier).to_string();
    }
    key.split(['_', '-', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the name already contains the equipment's qualifier as whole words,
/// counting known variant spellings ("DB") as the qualifier.
pub fn has_equipment_qualifier(name: &str, equipment: &str) -> bool {
    let qualifier = slugify(&equipment_qualifier(equipment));
    if qualifier.is_empty() {
        return true;
    }
    format!("-{}-", slugify(&spelled_name(name))).contains(&format!("-{qualifier}-"))
}

/// Canonically spelled name, qualified with the equipment unless it already is.
pub fn qualified_name(name: &str, equipment: &str) -> String {
    let spelled = spelled_name(name);
    if has_equipment_qualifier(&spelled, equipment) {
        return spelled.trim().to_string();
    }
    format!("{} {}", equipment_qualifier(equipment), spelled.trim())
}

fn spelled_name(name: &str) -> String {
    canonical_spelling(name).unwrap_or_else(|| name.to_string())
}

/// Name with non-canonical equipment spellings replaced, if any were found.
pub fn canonical_spelling(name: &str) -> Option<String> {
    let mut changed = false;
    let words: Vec<String> = name
        .split_whitespace()
        .map(|word| {
            let token = slugify(word);
            match NAME_SPELLINGS.iter().find(|(variant, _)| *variant == token) {
                Some((_, canonical)) => {
                    changed = true;
                    (*canonical).to_string()
                }
                None => word.to_string(),
            }
        })
        .collect();
    changed.then(|| words.join(" "))
}

fn base_name(name: &str) -> String {
    slugify(name)
        .split('-')
        .filter(|token| !token.is_empty() && !EQUIPMENT_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join("-")
}

/// Distinct equipment variants of a group: the registry when it lists any,
/// otherwise the primary equipment of its active records.
pub fn equipment_variants(snapshot: &Snapshot) -> BTreeSet<String> {
    if let Some(registry) = &snapshot.registry
        && !registry.equipment_variants.is_empty()
    {
        return registry
            .equipment_variants
            .iter()
            .map(|variant| variant.to_ascii_lowercase())
            .collect();
    }
    snapshot
        .active_records()
        .filter_map(Record::primary_equipment)
        .map(str::to_ascii_lowercase)
        .collect()
}

pub fn audit(snapshot: &Snapshot) -> Vec<Finding> {
    let multi_variant = equipment_variants(snapshot).len() > 1;
    let mut findings = Vec::new();

    for record in snapshot.active_records() {
        if let Some(canonical) = canonical_spelling(&record.name) {
            findings.push(
                Finding::new(
                    FindingKind::EquipmentNaming,
                    vec![record.id.clone()],
                    format!("'{}' uses a non-canonical equipment spelling", record.name),
                )
                .with_suggestion(canonical),
            );
        }

        if multi_variant
            && let Some(equipment) = record.primary_equipment()
            && !has_equipment_qualifier(&record.name, equipment)
        {
            findings.push(
                Finding::new(
                    FindingKind::MissingEquipmentQualifier,
                    vec![record.id.clone()],
                    format!(
                        "'{}' lacks the '{}' qualifier in a multi-equipment group",
                        record.name,
                        equipment_qualifier(equipment)
                    ),
                )
                .with_suggestion(qualified_name(&record.name, equipment)),
            );
        }

        let expected_slug = slugify(&record.name);
        if record.name_slug != expected_slug {
            findings.push(
                Finding::new(
                    FindingKind::SlugMismatch,
                    vec![record.id.clone()],
                    format!("slug '{}' does not match name '{}'", record.name_slug, record.name),
                )
                .with_suggestion(expected_slug),
            );
        }

        let mut seen = BTreeSet::new();
        let repeated: BTreeSet<String> = record
            .equipment
            .iter()
            .map(|equipment| equipment.to_ascii_lowercase())
            .filter(|equipment| !seen.insert(equipment.clone()))
            .collect();
        if !repeated.is_empty() {
            findings.push(Finding::new(
                FindingKind::DuplicateEquipment,
                vec![record.id.clone()],
                format!(
                    "equipment listed more than once: {}",
                    repeated.into_iter().collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        if !record.muscles.contribution_is_balanced() {
            findings.push(Finding::new(
                FindingKind::ContributionSum,
                vec![record.id.clone()],
                format!(
                    "muscle contributions sum to {:.3}, expected 1.0",
                    record.muscles.contribution_total()
                ),
            ));
        }
    }

    let mut by_variant: BTreeMap<(String, BTreeSet<String>), Vec<String>> = BTreeMap::new();
    for record in snapshot.active_records() {
        let equipment = record
            .equipment
            .iter()
            .map(|equipment| equipment.to_ascii_lowercase())
            .collect();
        by_variant
            .entry((base_name(&record.name), equipment))
            .or_default()
            .push(record.id.clone());
    }
    for ((base, _), record_ids) in by_variant {
        if record_ids.len() > 1 {
            findings.push(Finding::new(
                FindingKind::DuplicateEquipment,
                record_ids,
                format!("records share the base name '{base}' and the same equipment"),
            ));
        }
    }

    tracing::debug!(
        group_key = %snapshot.group_key,
        findings = findings.len(),
        multi_variant,
        "audit rules evaluated"
    );
    findings
}

/// Renames for unqualified records in a multi-equipment group, each followed by
/// an alias redirecting the old slug to the record.
pub fn normalization_operations(snapshot: &Snapshot) -> Vec<Operation> {
    if equipment_variants(snapshot).len() <= 1 {
        return Vec::new();
    }

    let mut taken: BTreeSet<String> = snapshot
        .active_records()
        .map(|record| record.name_slug.clone())
        .chain(snapshot.aliases.keys().cloned())
        .collect();
    let mut operations = Vec::new();
    for record in snapshot.active_records() {
        let Some(equipment) = record.primary_equipment() else {
            continue;
        };
        let new_name = qualified_name(&record.name, equipment);
        if new_name == record.name.trim() {
            continue;
        }
        let new_slug = slugify(&new_name);
        if new_slug != record.name_slug && !taken.insert(new_slug.clone()) {
            tracing::warn!(
                group_key = %snapshot.group_key,
                record_id = %record.id,
                slug = %new_slug,
                "rename skipped: slug already in use"
            );
            operations.push(
                Operation::new(OpType::NoOp, vec![record.id.clone()], Patch::new())
                    .with_rationale(format!(
                        "slug_collision: renaming '{}' to '{}' would reuse slug '{}'",
                        record.name, new_name, new_slug
                    ))
                    .with_after(json!({ "finding": "slug_collision", "suggestion": new_name })),
            );
            continue;
        }
        operations.push(
            Operation::rename_record(record.id.clone(), new_name.clone())
                .with_before(json!({ "name": record.name, "name_slug": record.name_slug }))
                .with_after(json!({ "name": new_name, "name_slug": new_slug }))
                .with_rationale(format!(
                    "group spans several equipment variants; rename '{}' to '{}'",
                    record.name, new_name
                )),
        );
        let redirect_free = snapshot
            .aliases
            .get(&record.name_slug)
            .is_none_or(|alias| alias.record_id() == Some(record.id.as_str()));
        if new_slug != record.name_slug && !record.name_slug.is_empty() && redirect_free {
            operations.push(
                Operation::upsert_alias_to_record(record.name_slug.clone(), record.id.clone())
                    .with_rationale(format!("redirect '{}' after rename", record.name_slug)),
            );
        }
    }
    operations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GroupRegistryEntry, RecordStatus};

    fn record(name: &str, equipment: &[&str]) -> Record {
        Record::new(
            "bench-press",
            name,
            equipment.iter().map(|item| item.to_string()).collect(),
        )
    }

    #[test]
    fn qualifiers_match_whole_words() {
        assert!(has_equipment_qualifier("Dumbbell Bench Press", "dumbbell"));
        assert!(has_equipment_qualifier("Smith Machine Squat", "smith_machine"));
        assert!(!has_equipment_qualifier("Bench Press", "barbell"));
        assert!(!has_equipment_qualifier("Barbellish Press", "barbell"));
        assert_eq!(equipment_qualifier("landmine_attachment"), "Landmine Attachment");
        assert_eq!(qualified_name(" Bench Press ", "ez_bar"), "EZ Bar Bench Press");
    }

    #[test]
    fn non_canonical_spellings_are_rewritten() {
        assert_eq!(
            canonical_spelling("DB Bench Press").as_deref(),
            Some("Dumbbell Bench Press")
        );
        assert_eq!(canonical_spelling("Dumbell Fly").as_deref(), Some("Dumbbell Fly"));
        assert_eq!(canonical_spelling("Barbell Row"), None);
    }

    #[test]
    fn audit_reports_each_rule() {
        let mut unbalanced = record("Dumbbell Bench Press", &["dumbbell", "dumbbell"]);
        unbalanced.muscles.contribution.insert("chest".into(), 0.5);
        let mut drifted = record("BB Bench Press", &["barbell"]);
        drifted.name_slug = "bench".into();
        let snapshot = Snapshot::new("bench-press")
            .with_record(unbalanced)
            .with_record(drifted)
            .with_record(record("Close Grip Press", &["barbell"]));

        let findings = audit(&snapshot);
        let kinds: BTreeSet<FindingKind> = findings.iter().map(|finding| finding.kind).collect();
        assert!(kinds.contains(&FindingKind::EquipmentNaming));
        assert!(kinds.contains(&FindingKind::MissingEquipmentQualifier));
        assert!(kinds.contains(&FindingKind::SlugMismatch));
        assert!(kinds.contains(&FindingKind::DuplicateEquipment));
        assert!(kinds.contains(&FindingKind::ContributionSum));

        let operation = findings[0].to_operation();
        assert_eq!(operation.op_type, OpType::NoOp);
        assert!(operation.patch.is_empty());
    }

    #[test]
    fn single_variant_group_needs_no_normalisation() {
        let snapshot = Snapshot::new("bench-press")
            .with_record(record("Bench Press", &["barbell"]))
            .with_record(record("Incline Bench Press", &["barbell"]));
        assert!(normalization_operations(&snapshot).is_empty());
        assert!(audit(&snapshot).is_empty());
    }

    #[test]
    fn normalisation_renames_and_redirects() {
        let mut deprecated = record("Old Press", &["machine"]);
        deprecated.status = Some(RecordStatus::Deprecated);
        let snapshot = Snapshot::new("bench-press")
            .with_registry(GroupRegistryEntry {
                equipment_variants: vec!["barbell".into(), "dumbbell".into()],
                ..GroupRegistryEntry::new("bench-press")
            })
            .with_record(record("Bench Press", &["barbell"]))
            .with_record(record("Dumbbell Bench Press", &["dumbbell"]))
            .with_record(deprecated);

        let operations = normalization_operations(&snapshot);
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0].op_type, OpType::RenameRecord);
        assert_eq!(operations[0].targets, vec!["bench-press__bench-press".to_string()]);
        assert_eq!(operations[0].patch.set_str("name"), Some("Barbell Bench Press"));
        assert_eq!(operations[1].op_type, OpType::UpsertAlias);
        assert_eq!(operations[1].targets, vec!["bench-press".to_string()]);
    }

    #[test]
    fn variant_spelling_counts_as_the_qualifier() {
        assert!(has_equipment_qualifier("DB Bench Press", "dumbbell"));
        assert_eq!(qualified_name("DB Bench Press", "dumbbell"), "Dumbbell Bench Press");

        let snapshot = Snapshot::new("bench-press")
            .with_record(record("DB Bench Press", &["dumbbell"]).with_id("R1"))
            .with_record(record("Barbell Bench Press", &["barbell"]).with_id("R2"));
        let findings = audit(&snapshot);
        assert!(
            findings
                .iter()
                .all(|finding| finding.kind != FindingKind::MissingEquipmentQualifier)
        );

        let operations = normalization_operations(&snapshot);
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0].targets, vec!["R1".to_string()]);
        assert_eq!(operations[0].patch.set_str("name"), Some("Dumbbell Bench Press"));
        assert_eq!(operations[1].targets, vec!["db-bench-press".to_string()]);
    }

    #[test]
    fn rename_onto_a_used_slug_is_skipped() {
        let snapshot = Snapshot::new("bench-press")
            .with_record(record("Bench Press", &["barbell"]).with_id("R1"))
            .with_record(record("BB Bench Press", &["barbell"]).with_id("R2"))
            .with_record(record("Dumbbell Bench Press", &["dumbbell"]).with_id("R3"))
            .with_alias(crate::catalog::Alias::to_record("dumbbell-close-grip-press", "R3"))
            .with_record(record("Close Grip Press", &["dumbbell"]).with_id("R4"));

        let operations = normalization_operations(&snapshot);
        let renames: Vec<_> = operations
            .iter()
            .filter(|operation| operation.op_type == OpType::RenameRecord)
            .collect();
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].targets, vec!["R1".to_string()]);
        assert_eq!(renames[0].patch.set_str("name"), Some("Barbell Bench Press"));

        let skipped: Vec<_> = operations
            .iter()
            .filter(|operation| operation.op_type == OpType::NoOp)
            .map(|operation| operation.targets[0].as_str())
            .collect();
        assert_eq!(skipped, vec!["R2", "R4"]);
        assert!(
            operations
                .iter()
                .filter(|operation| operation.op_type == OpType::NoOp)
                .all(|operation| operation.rationale.starts_with("slug_collision"))
        );
        let aliases: Vec<_> = operations
            .iter()
            .filter(|operation| operation.op_type == OpType::UpsertAlias)
            .collect();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].targets, vec!["bench-press".to_string()]);
    }

    #[test]
    fn redirect_never_takes_over_another_records_alias() {
        let snapshot = Snapshot::new("bench-press")
            .with_record(record("Press", &["barbell"]).with_id("R1"))
            .with_record(record("Dumbbell Press", &["dumbbell"]).with_id("R2"))
            .with_alias(crate::catalog::Alias::to_record("press", "R2"));

        let operations = normalization_operations(&snapshot);
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].op_type, OpType::RenameRecord);
        assert_eq!(operations[0].patch.set_str("name"), Some("Barbell Press"));
    }
}
