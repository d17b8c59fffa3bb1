use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::paths::{REGISTRY_PATH_PREFIX, get_path};
use crate::ports::catalog::CatalogStore;

const NUMBER_TOLERANCE: f64 = 1e-9;

/// Field path used for whole-alias expectations.
pub const ALIAS_FIELD: &str = "alias";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExpectedTarget {
    Record(String),
    Alias(String),
    Registry(String),
}

impl ExpectedTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::Record(id) | Self::Alias(id) | Self::Registry(id) => id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VerificationMismatch {
    pub operation_index: usize,
    pub target: String,
    pub field: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
}

/// Expected post-apply values, in plan order. A later operation touching the
/// same target and field replaces the earlier expectation.
#[derive(Clone, Debug, Default)]
pub struct Expectations {
    entries: BTreeMap<(ExpectedTarget, String), (usize, Option<Value>)>,
}

impl Expectations {
    pub fn expect(
        &mut self,
        operation_index: usize,
        target: ExpectedTarget,
        field: impl Into<String>,
        value: Option<Value>,
    ) {
        self.entries
            .insert((target, field.into()), (operation_index, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VerificationReport {
    pub passed: bool,
    pub mismatches: Vec<VerificationMismatch>,
}

/// Re-reads every expected target and reports each field that differs.
/// A target that cannot be read is treated as absent.
pub async fn verify(store: &dyn CatalogStore, expectations: &Expectations) -> VerificationReport {
    let mut documents: BTreeMap<ExpectedTarget, Option<Value>> = BTreeMap::new();
    for (target, _) in expectations.entries.keys() {
        if documents.contains_key(target) {
            continue;
        }
        let document = read_target(store, target).await;
        documents.insert(target.clone(), document);
    }

    let mut mismatches = Vec::new();
    for ((target, field), (operation_index, expected)) in &expectations.entries {
        let document = documents.get(target).and_then(Option::as_ref);
        let actual = document.and_then(|document| actual_field(target, document, field));
        let matches = match (expected, &actual) {
            (None, None) => true,
            (Some(expected), Some(actual)) => values_match(expected, actual),
            (Some(Value::Null), None) | (None, Some(Value::Null)) => true,
            _ => false,
        };
        if !matches {
            mismatches.push(VerificationMismatch {
                operation_index: *operation_index,
                target: target.id().to_string(),
                field: field.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    if !mismatches.is_empty() {
        tracing::warn!(mismatches = mismatches.len(), "post-apply verification failed");
    }
    VerificationReport {
        passed: mismatches.is_empty(),
        mismatches,
    }
}

async fn read_target(store: &dyn CatalogStore, target: &ExpectedTarget) -> Option<Value> {
    let read = match target {
        ExpectedTarget::Record(id) => store
            .get_record(id)
            .await
            .map(|record| record.and_then(|record| record.to_document().ok())),
        ExpectedTarget::Alias(slug) => store
            .get_alias(slug)
            .await
            .map(|alias| alias.map(|alias| alias.to_value())),
        ExpectedTarget::Registry(group_key) => store
            .get_registry(group_key)
            .await
            .map(|entry| entry.and_then(|entry| entry.to_document().ok())),
    };
    match read {
        Ok(document) => document,
        Err(err) => {
            tracing::warn!(resource = target.id(), error = %err, "verification read failed");
            None
        }
    }
}

fn actual_field(target: &ExpectedTarget, document: &Value, field: &str) -> Option<Value> {
    match target {
        ExpectedTarget::Alias(_) if field == ALIAS_FIELD => Some(document.clone()),
        ExpectedTarget::Registry(_) => {
            let field = field.strip_prefix(REGISTRY_PATH_PREFIX).unwrap_or(field);
            get_path(document, field).cloned()
        }
        _ => get_path(document, field).cloned(),
    }
}

/// Structural equality with a tolerance on numbers, so `1` matches `1.0`.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(expected), Value::Number(actual)) => {
            match (expected.as_f64(), actual.as_f64()) {
                (Some(expected), Some(actual)) => (expected - actual).abs() <= NUMBER_TOLERANCE,
                _ => expected == actual,
            }
        }
        (Value::Array(expected), Value::Array(actual)) => {
            expected.len() == actual.len()
                && expected
                    .iter()
                    .zip(actual)
                    .all(|(expected, actual)| values_match(expected, actual))
        }
        (Value::Object(expected), Value::Object(actual)) => {
            expected.len() == actual.len()
                && expected.iter().all(|(key, expected)| {
                    actual
                        .get(key)
                        .is_some_and(|actual| values_match(expected, actual))
                })
        }
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Alias, Record};
    use crate::catalog_store::InMemoryCatalogStore;
    use serde_json::json;

    #[test]
    fn numbers_match_across_representations() {
        assert!(values_match(&json!(1), &json!(1.0)));
        assert!(values_match(
            &json!({"chest": 0.7, "triceps": 0.3}),
            &json!({"triceps": 0.3, "chest": 0.7})
        ));
        assert!(!values_match(&json!(["a", "b"]), &json!(["b", "a"])));
        assert!(!values_match(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn later_expectations_win_and_mismatches_are_reported() {
        let store = InMemoryCatalogStore::new();
        let mut record = Record::new("row", "Barbell Row", vec!["barbell".into()]).with_id("r-1");
        record.description = Some("pull".into());
        store.seed_record(record).await;
        store.seed_alias(Alias::to_record("bb-row", "r-1")).await;

        let mut expectations = Expectations::default();
        let target = ExpectedTarget::Record("r-1".into());
        expectations.expect(0, target.clone(), "description", Some(json!("stale")));
        expectations.expect(2, target.clone(), "description", Some(json!("pull")));
        expectations.expect(3, target, "metadata.level", Some(json!("advanced")));
        expectations.expect(
            4,
            ExpectedTarget::Alias("bb-row".into()),
            ALIAS_FIELD,
            Some(json!({"slug": "bb-row", "record_id": "r-1"})),
        );
        expectations.expect(5, ExpectedTarget::Alias("gone".into()), ALIAS_FIELD, None);

        let report = verify(&store, &expectations).await;
        assert!(!report.passed);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].operation_index, 3);
        assert_eq!(report.mismatches[0].field, "metadata.level");
        assert_eq!(report.mismatches[0].actual, None);
    }
}
