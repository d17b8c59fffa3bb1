use std::sync::Arc;

use catalog_domain::ports::BoxFuture;
use catalog_domain::ports::journal::{ChangeJournal, ChangeSummary, JournalEntry, JournalError};
use serde_json::{Value, to_value};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

use crate::db::{self, DbConfig};

/// Change journal tables: `change_journal:{job_id}:{index}` and
/// `change_summary:{change_id}`.
#[derive(Clone)]
pub struct SurrealChangeJournal {
    client: Arc<Surreal<Client>>,
}

impl SurrealChangeJournal {
    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let db = db::connect(db_config).await?;
        Ok(Self {
            client: Arc::new(db),
        })
    }

    fn map_surreal_error(err: surrealdb::Error) -> JournalError {
        JournalError::Unavailable(format!("surreal query failed: {err}"))
    }

    fn entry_payload(entry: &JournalEntry) -> Result<Value, JournalError> {
        let mut payload =
            to_value(entry).map_err(|err| JournalError::Serialization(err.to_string()))?;
        if let Value::Object(fields) = &mut payload {
            fields.insert("entry_key".to_string(), Value::String(entry.entry_key()));
        }
        Ok(payload)
    }

    fn decode_entries(rows: Vec<Value>) -> Result<Vec<JournalEntry>, JournalError> {
        let mut entries = rows
            .into_iter()
            .map(|row| {
                serde_json::from_value::<JournalEntry>(row)
                    .map_err(|err| JournalError::Serialization(format!("invalid journal row: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.operation_index);
        Ok(entries)
    }
}

impl ChangeJournal for SurrealChangeJournal {
    fn append(&self, entry: &JournalEntry) -> BoxFuture<'_, Result<(), JournalError>> {
        let entry_key = entry.entry_key();
        let payload = Self::entry_payload(entry);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload?;
            let mut response = client
                .query("UPSERT type::record('change_journal', $entry_key) CONTENT $payload")
                .bind(("entry_key", entry_key))
                .bind(("payload", payload))
                .await
                .map_err(Self::map_surreal_error)?;
            let _: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            Ok(())
        })
    }

    fn record_summary(&self, summary: &ChangeSummary) -> BoxFuture<'_, Result<(), JournalError>> {
        let change_id = summary.change_id.clone();
        let payload = to_value(summary);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = payload.map_err(|err| JournalError::Serialization(err.to_string()))?;
            let mut response = client
                .query("UPSERT type::record('change_summary', $change_id) CONTENT $payload")
                .bind(("change_id", change_id))
                .bind(("payload", payload))
                .await
                .map_err(Self::map_surreal_error)?;
            let _: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            Ok(())
        })
    }

    fn list_entries(&self, job_id: &str) -> BoxFuture<'_, Result<Vec<JournalEntry>, JournalError>> {
        let job_id = job_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(
                    "SELECT * OMIT id, entry_key FROM change_journal \
                     WHERE job_id = $job_id ORDER BY operation_index ASC",
                )
                .bind(("job_id", job_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            Self::decode_entries(rows)
        })
    }

    fn get_summary(
        &self,
        change_id: &str,
    ) -> BoxFuture<'_, Result<Option<ChangeSummary>, JournalError>> {
        let change_id = change_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("SELECT * OMIT id FROM change_summary WHERE change_id = $change_id LIMIT 1")
                .bind(("change_id", change_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response.take(0).map_err(Self::map_surreal_error)?;
            rows.into_iter()
                .next()
                .map(|row| {
                    serde_json::from_value::<ChangeSummary>(row).map_err(|err| {
                        JournalError::Serialization(format!("invalid summary row: {err}"))
                    })
                })
                .transpose()
        })
    }
}
