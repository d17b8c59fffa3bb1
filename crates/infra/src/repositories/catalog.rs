use std::collections::BTreeSet;
use std::sync::Arc;

use catalog_domain::DomainResult;
use catalog_domain::catalog::{Alias, AliasDocument, GroupRegistryEntry, Record};
use catalog_domain::error::DomainError;
use catalog_domain::ports::BoxFuture;
use catalog_domain::ports::catalog::{CatalogStore, CreateOutcome, FieldAction, NestedUpdate};
use serde::Deserialize;
use serde_json::{Value, to_value};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

use crate::db::{self, DbConfig};

#[derive(Debug, Deserialize)]
struct SurrealRecordRow {
    record_id: String,
    document: Value,
}

#[derive(Debug, Deserialize)]
struct SurrealGroupKeyRow {
    group_key: String,
}

/// Catalog documents in SurrealDB. Records are stored as
/// `catalog_record:{id}` rows wrapping the record document, so nested writes
/// address `document.<path>`.
#[derive(Clone)]
pub struct SurrealCatalogStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealCatalogStore {
    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let db = db::connect(db_config).await?;
        Ok(Self {
            client: Arc::new(db),
        })
    }

    fn map_surreal_error(err: surrealdb::Error) -> DomainError {
        let error_message = err.to_string().to_lowercase();
        if error_message.contains("already exists")
            || error_message.contains("duplicate")
            || error_message.contains("unique")
            || error_message.contains("conflict")
        {
            return DomainError::Conflict;
        }
        if error_message.contains("connection")
            || error_message.contains("timed out")
            || error_message.contains("websocket")
        {
            return DomainError::Unavailable(error_message);
        }
        DomainError::Validation(format!("surreal query failed: {error_message}"))
    }

    fn decode_record_rows(rows: Vec<Value>) -> DomainResult<Vec<Record>> {
        rows.into_iter()
            .map(|row| {
                let row = serde_json::from_value::<SurrealRecordRow>(row).map_err(|err| {
                    DomainError::Validation(format!("invalid catalog record row: {err}"))
                })?;
                let record = Record::from_document(row.document)?;
                if record.id != row.record_id {
                    return Err(DomainError::Validation(format!(
                        "catalog record row {} holds document {}",
                        row.record_id, record.id
                    )));
                }
                Ok(record)
            })
            .collect()
    }

    fn decode_alias_rows(rows: Vec<Value>) -> DomainResult<Vec<Alias>> {
        rows.into_iter()
            .map(|row| {
                let document = serde_json::from_value::<AliasDocument>(row).map_err(|err| {
                    DomainError::Validation(format!("invalid alias row: {err}"))
                })?;
                Alias::try_from(document)
                    .map_err(|err| DomainError::Validation(format!("invalid alias row: {err}")))
            })
            .collect()
    }

    fn record_payload(record: &Record) -> DomainResult<Value> {
        let document = record.to_document()?;
        Ok(serde_json::json!({
            "record_id": record.id,
            "group_key": record.group_key,
            "document": document,
        }))
    }
}

/// Builds the `SET` clause for a nested update against `document.*`.
///
/// Paths are inlined, so every segment must be a plain lowercase identifier;
/// values always travel as bindings. Removal assigns `NONE`.
fn update_assignments(update: &NestedUpdate) -> DomainResult<(String, Vec<(String, Value)>)> {
    let mut assignments = Vec::with_capacity(update.writes.len() + 1);
    let mut bindings = Vec::new();
    for (index, write) in update.writes.iter().enumerate() {
        if write.path.is_empty() || !write.path.iter().all(|segment| is_field_segment(segment)) {
            return Err(DomainError::Validation(format!(
                "unsupported field path '{}'",
                write.dotted_path()
            )));
        }
        let field = format!("document.{}", write.path.join("."));
        match &write.action {
            FieldAction::Set(value) => {
                let name = format!("w{index}");
                assignments.push(format!("{field} = ${name}"));
                bindings.push((name, value.clone()));
            }
            FieldAction::Remove => assignments.push(format!("{field} = NONE")),
        }
    }
    assignments.push("group_key = document.group_key".to_string());
    Ok((assignments.join(", "), bindings))
}

fn is_field_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
        && !segment.starts_with(|ch: char| ch.is_ascii_digit())
}

impl CatalogStore for SurrealCatalogStore {
    fn get_record(&self, record_id: &str) -> BoxFuture<'_, DomainResult<Option<Record>>> {
        let record_id = record_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT record_id, document FROM catalog_record \
                     WHERE record_id = $record_id LIMIT 1",
                )
                .bind(("record_id", record_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Ok(Self::decode_record_rows(rows)?.pop())
        })
    }

    fn list_records_by_group(&self, group_key: &str) -> BoxFuture<'_, DomainResult<Vec<Record>>> {
        let group_key = group_key.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT record_id, document FROM catalog_record \
                     WHERE group_key = $group_key ORDER BY record_id ASC",
                )
                .bind(("group_key", group_key))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Self::decode_record_rows(rows)
        })
    }

    fn create_record_if_absent(
        &self,
        record: &Record,
    ) -> BoxFuture<'_, DomainResult<CreateOutcome>> {
        let record_id = record.id.clone();
        let payload = Self::record_payload(record);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let mut response = client
                .query("CREATE type::record('catalog_record', $record_id) CONTENT $payload")
                .bind(("record_id", record_id.clone()))
                .bind(("payload", payload))
                .await
                .map_err(Self::map_surreal_error)?;
            let created: Result<Vec<Value>, _> = response.take(0);
            match created.map_err(Self::map_surreal_error) {
                Ok(rows) if rows.is_empty() => Err(DomainError::Validation(
                    "create catalog record returned no row".to_string(),
                )),
                Ok(_) => Ok(CreateOutcome::Created),
                Err(DomainError::Conflict) => {
                    tracing::debug!(record_id = %record_id, "catalog record already present");
                    Ok(CreateOutcome::AlreadyExists)
                }
                Err(err) => Err(err),
            }
        })
    }

    fn update_record(
        &self,
        record_id: &str,
        update: &NestedUpdate,
    ) -> BoxFuture<'_, DomainResult<Record>> {
        let record_id = record_id.to_string();
        let assignments = update_assignments(update);
        let client = self.client.clone();
        Box::pin(async move {
            let (assignments, bindings) = assignments?;
            let statement = format!(
                "UPDATE type::record('catalog_record', $record_id) SET {assignments} \
                 RETURN record_id, document"
            );
            let mut query = client
                .query(statement)
                .bind(("record_id", record_id.clone()));
            for binding in bindings {
                query = query.bind(binding);
            }
            let mut response = query.await.map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            let updated = Self::decode_record_rows(rows)?
                .pop()
                .ok_or(DomainError::NotFound)?;
            if updated.id != record_id {
                return Err(DomainError::Validation("record id is immutable".into()));
            }
            Ok(updated)
        })
    }

    fn get_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<Option<Alias>>> {
        let slug = slug.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT slug, record_id, group_key FROM catalog_alias \
                     WHERE slug = $slug LIMIT 1",
                )
                .bind(("slug", slug))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Ok(Self::decode_alias_rows(rows)?.pop())
        })
    }

    fn list_aliases(
        &self,
        group_key: &str,
        record_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<Alias>>> {
        let group_key = group_key.to_string();
        let record_ids = record_ids.to_vec();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT slug, record_id, group_key FROM catalog_alias \
                     WHERE group_key = $group_key OR record_id IN $record_ids \
                     ORDER BY slug ASC",
                )
                .bind(("group_key", group_key))
                .bind(("record_ids", record_ids))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Self::decode_alias_rows(rows)
        })
    }

    fn put_alias(&self, alias: &Alias) -> BoxFuture<'_, DomainResult<()>> {
        let slug = alias.slug.clone();
        let payload = to_value(alias.to_document());
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload
                .map_err(|err| DomainError::Validation(format!("invalid alias payload: {err}")))?;
            let mut response = client
                .query("UPSERT type::record('catalog_alias', $slug) CONTENT $payload")
                .bind(("slug", slug))
                .bind(("payload", payload))
                .await
                .map_err(Self::map_surreal_error)?;
            let _: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            Ok(())
        })
    }

    fn delete_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let slug = slug.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("DELETE type::record('catalog_alias', $slug) RETURN BEFORE")
                .bind(("slug", slug))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            Ok(!rows.is_empty())
        })
    }

    fn get_registry(
        &self,
        group_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<GroupRegistryEntry>>> {
        let group_key = group_key.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT group_key, display_name, equipment_variants, primary_equipment \
                     FROM group_registry WHERE group_key = $group_key LIMIT 1",
                )
                .bind(("group_key", group_key))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            rows.into_iter()
                .next()
                .map(GroupRegistryEntry::from_document)
                .transpose()
        })
    }

    fn put_registry(&self, entry: &GroupRegistryEntry) -> BoxFuture<'_, DomainResult<()>> {
        let group_key = entry.group_key.clone();
        let payload = entry.to_document();
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let mut response = client
                .query("UPSERT type::record('group_registry', $group_key) CONTENT $payload")
                .bind(("group_key", group_key))
                .bind(("payload", payload))
                .await
                .map_err(Self::map_surreal_error)?;
            let _: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            Ok(())
        })
    }

    fn list_group_keys(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT group_key FROM catalog_record GROUP BY group_key; \
                     SELECT group_key FROM group_registry",
                )
                .await
                .map_err(Self::map_surreal_error)?;
            let mut keys = BTreeSet::new();
            for index in 0..2 {
                let rows: Vec<Value> = response.take(index).map_err(|err| {
                    DomainError::Validation(format!("invalid query result: {err}"))
                })?;
                for row in rows {
                    let row = serde_json::from_value::<SurrealGroupKeyRow>(row).map_err(|err| {
                        DomainError::Validation(format!("invalid group key row: {err}"))
                    })?;
                    keys.insert(row.group_key);
                }
            }
            Ok(keys.into_iter().take(limit).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_domain::ports::catalog::FieldWrite;
    use serde_json::json;

    fn write(path: &[&str], action: FieldAction) -> FieldWrite {
        FieldWrite {
            path: path.iter().map(|segment| segment.to_string()).collect(),
            action,
        }
    }

    #[test]
    fn nested_writes_bind_values_and_unset_removals() {
        let update = NestedUpdate {
            writes: vec![
                write(&["metadata", "level"], FieldAction::Set(json!("advanced"))),
                write(&["description"], FieldAction::Remove),
            ],
        };
        let (assignments, bindings) = update_assignments(&update).unwrap();
        assert_eq!(
            assignments,
            "document.metadata.level = $w0, document.description = NONE, \
             group_key = document.group_key"
        );
        assert_eq!(bindings, vec![("w0".to_string(), json!("advanced"))]);
    }

    #[test]
    fn unsafe_segments_never_reach_the_statement() {
        let paths: [&[&str]; 5] = [&["name; DELETE catalog_record"], &["Name"], &[""], &["2x"], &[]];
        for path in paths {
            let update = NestedUpdate {
                writes: vec![write(path, FieldAction::Remove)],
            };
            assert!(
                matches!(update_assignments(&update), Err(DomainError::Validation(_))),
                "{path:?}"
            );
        }
    }

    #[test]
    fn record_rows_must_match_their_document() {
        let record = Record::new("squat", "Back Squat", vec!["barbell".into()]);
        let row = SurrealCatalogStore::record_payload(&record).unwrap();
        let decoded = SurrealCatalogStore::decode_record_rows(vec![row.clone()]).unwrap();
        assert_eq!(decoded, vec![record]);

        let mut mismatched = row;
        mismatched["record_id"] = json!("other");
        assert!(SurrealCatalogStore::decode_record_rows(vec![mismatched]).is_err());
    }

    #[test]
    fn alias_rows_pass_the_target_check() {
        let rows = vec![
            json!({"slug": "bench", "record_id": "r-1"}),
            json!({"slug": "bench-all", "group_key": "bench-press"}),
        ];
        let aliases = SurrealCatalogStore::decode_alias_rows(rows).unwrap();
        assert_eq!(aliases[0], Alias::to_record("bench", "r-1"));
        assert_eq!(aliases[1], Alias::to_group("bench-all", "bench-press"));

        let both = json!({"slug": "x", "record_id": "r-1", "group_key": "g"});
        assert!(SurrealCatalogStore::decode_alias_rows(vec![both]).is_err());
    }
}
