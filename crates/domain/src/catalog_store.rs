use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::RwLock;

use crate::DomainResult;
use crate::catalog::{Alias, GroupRegistryEntry, Record};
use crate::error::DomainError;
use crate::paths::{remove_path, set_path};
use crate::ports::BoxFuture;
use crate::ports::catalog::{CatalogStore, CreateOutcome, FieldAction, NestedUpdate};

/// Process-local catalog. Counts every mutating call so tests can assert that
/// a code path never wrote.
#[derive(Default)]
pub struct InMemoryCatalogStore {
    records: Arc<RwLock<BTreeMap<String, Record>>>,
    aliases: Arc<RwLock<BTreeMap<String, Alias>>>,
    registry: Arc<RwLock<BTreeMap<String, GroupRegistryEntry>>>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn seed_record(&self, record: Record) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn seed_alias(&self, alias: Alias) {
        self.aliases.write().await.insert(alias.slug.clone(), alias);
    }

    pub async fn seed_registry(&self, entry: GroupRegistryEntry) {
        self.registry
            .write()
            .await
            .insert(entry.group_key.clone(), entry);
    }

    pub async fn all_records(&self) -> Vec<Record> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn all_aliases(&self) -> Vec<Alias> {
        self.aliases.read().await.values().cloned().collect()
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn apply_nested_update(record: &Record, update: &NestedUpdate) -> DomainResult<Record> {
    let mut document = record.to_document()?;
    for write in &update.writes {
        let path = write.dotted_path();
        match &write.action {
            FieldAction::Set(value) => set_path(&mut document, &path, value.clone())?,
            FieldAction::Remove => {
                remove_path(&mut document, &path);
            }
        }
    }
    Record::from_document(document)
}

impl CatalogStore for InMemoryCatalogStore {
    fn get_record(&self, record_id: &str) -> BoxFuture<'_, DomainResult<Option<Record>>> {
        let record_id = record_id.to_string();
        let records = self.records.clone();
        Box::pin(async move { Ok(records.read().await.get(&record_id).cloned()) })
    }

    fn list_records_by_group(&self, group_key: &str) -> BoxFuture<'_, DomainResult<Vec<Record>>> {
        let group_key = group_key.to_string();
        let records = self.records.clone();
        Box::pin(async move {
            let records = records.read().await;
            Ok(records
                .values()
                .filter(|record| record.group_key == group_key)
                .cloned()
                .collect())
        })
    }

    fn create_record_if_absent(
        &self,
        record: &Record,
    ) -> BoxFuture<'_, DomainResult<CreateOutcome>> {
        let record = record.clone();
        let records = self.records.clone();
        Box::pin(async move {
            let mut records = records.write().await;
            if records.contains_key(&record.id) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            records.insert(record.id.clone(), record);
            self.count_write();
            Ok(CreateOutcome::Created)
        })
    }

    fn update_record(
        &self,
        record_id: &str,
        update: &NestedUpdate,
    ) -> BoxFuture<'_, DomainResult<Record>> {
        let record_id = record_id.to_string();
        let update = update.clone();
        let records = self.records.clone();
        Box::pin(async move {
            let mut records = records.write().await;
            let current = records.get(&record_id).ok_or(DomainError::NotFound)?;
            let updated = apply_nested_update(current, &update)?;
            if updated.id != record_id {
                return Err(DomainError::Validation("record id is immutable".into()));
            }
            records.insert(record_id, updated.clone());
            self.count_write();
            Ok(updated)
        })
    }

    fn get_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<Option<Alias>>> {
        let slug = slug.to_string();
        let aliases = self.aliases.clone();
        Box::pin(async move { Ok(aliases.read().await.get(&slug).cloned()) })
    }

    fn list_aliases(
        &self,
        group_key: &str,
        record_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<Alias>>> {
        let group_key = group_key.to_string();
        let record_ids: BTreeSet<String> = record_ids.iter().cloned().collect();
        let aliases = self.aliases.clone();
        Box::pin(async move {
            let aliases = aliases.read().await;
            Ok(aliases
                .values()
                .filter(|alias| {
                    alias.group_key() == Some(group_key.as_str())
                        || alias.record_id().is_some_and(|id| record_ids.contains(id))
                })
                .cloned()
                .collect())
        })
    }

    fn put_alias(&self, alias: &Alias) -> BoxFuture<'_, DomainResult<()>> {
        let alias = alias.clone();
        let aliases = self.aliases.clone();
        Box::pin(async move {
            aliases.write().await.insert(alias.slug.clone(), alias);
            self.count_write();
            Ok(())
        })
    }

    fn delete_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<bool>> {
        let slug = slug.to_string();
        let aliases = self.aliases.clone();
        Box::pin(async move {
            let removed = aliases.write().await.remove(&slug).is_some();
            if removed {
                self.count_write();
            }
            Ok(removed)
        })
    }

    fn get_registry(
        &self,
        group_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<GroupRegistryEntry>>> {
        let group_key = group_key.to_string();
        let registry = self.registry.clone();
        Box::pin(async move { Ok(registry.read().await.get(&group_key).cloned()) })
    }

    fn put_registry(&self, entry: &GroupRegistryEntry) -> BoxFuture<'_, DomainResult<()>> {
        let entry = entry.clone();
        let registry = self.registry.clone();
        Box::pin(async move {
            registry
                .write()
                .await
                .insert(entry.group_key.clone(), entry);
            self.count_write();
            Ok(())
        })
    }

    fn list_group_keys(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let records = self.records.clone();
        let registry = self.registry.clone();
        Box::pin(async move {
            let mut keys: BTreeSet<String> = records
                .read()
                .await
                .values()
                .map(|record| record.group_key.clone())
                .collect();
            keys.extend(registry.read().await.keys().cloned());
            Ok(keys.into_iter().take(limit).collect())
        })
    }
}
