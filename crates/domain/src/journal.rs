use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::ports::BoxFuture;
use crate::ports::journal::{ChangeJournal, ChangeSummary, JournalEntry, JournalError};

#[derive(Default)]
pub struct InMemoryChangeJournal {
    entries: Arc<RwLock<BTreeMap<(String, usize), JournalEntry>>>,
    summaries: Arc<RwLock<HashMap<String, ChangeSummary>>>,
}

impl InMemoryChangeJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn summaries(&self) -> Vec<ChangeSummary> {
        let mut summaries: Vec<_> = self.summaries.read().await.values().cloned().collect();
        summaries.sort_by(|a, b| {
            a.recorded_at_ms
                .cmp(&b.recorded_at_ms)
                .then_with(|| a.change_id.cmp(&b.change_id))
        });
        summaries
    }
}

impl ChangeJournal for InMemoryChangeJournal {
    fn append(&self, entry: &JournalEntry) -> BoxFuture<'_, Result<(), JournalError>> {
        let entry = entry.clone();
        let entries = self.entries.clone();
        Box::pin(async move {
            let key = (entry.job_id.clone(), entry.operation_index);
            entries.write().await.insert(key, entry);
            Ok(())
        })
    }

    fn record_summary(&self, summary: &ChangeSummary) -> BoxFuture<'_, Result<(), JournalError>> {
        let summary = summary.clone();
        let summaries = self.summaries.clone();
        Box::pin(async move {
            summaries
                .write()
                .await
                .insert(summary.change_id.clone(), summary);
            Ok(())
        })
    }

    fn list_entries(&self, job_id: &str) -> BoxFuture<'_, Result<Vec<JournalEntry>, JournalError>> {
        let job_id = job_id.to_string();
        let entries = self.entries.clone();
        Box::pin(async move {
            let entries = entries.read().await;
            Ok(entries
                .iter()
                .filter(|((entry_job, _), _)| *entry_job == job_id)
                .map(|(_, entry)| entry.clone())
                .collect())
        })
    }

    fn get_summary(
        &self,
        change_id: &str,
    ) -> BoxFuture<'_, Result<Option<ChangeSummary>, JournalError>> {
        let change_id = change_id.to_string();
        let summaries = self.summaries.clone();
        Box::pin(async move { Ok(summaries.read().await.get(&change_id).cloned()) })
    }
}
