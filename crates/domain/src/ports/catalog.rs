use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::catalog::{Alias, GroupRegistryEntry, Record};
use crate::ports::BoxFuture;

/// Native field write understood by every store: a nested path and what to do there.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum FieldAction {
    Set(Value),
    Remove,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FieldWrite {
    pub path: Vec<String>,
    pub action: FieldAction,
}

impl FieldWrite {
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NestedUpdate {
    pub writes: Vec<FieldWrite>,
}

impl NestedUpdate {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Document store holding catalog records, aliases and the group registry.
///
/// Every call is atomic for the single document it touches; nothing spans
/// documents.
pub trait CatalogStore: Send + Sync {
    fn get_record(&self, record_id: &str) -> BoxFuture<'_, DomainResult<Option<Record>>>;

    fn list_records_by_group(&self, group_key: &str) -> BoxFuture<'_, DomainResult<Vec<Record>>>;

    fn create_record_if_absent(&self, record: &Record)
    -> BoxFuture<'_, DomainResult<CreateOutcome>>;

    /// Applies the nested update in place. Fails with `NotFound` when the record is absent.
    fn update_record(
        &self,
        record_id: &str,
        update: &NestedUpdate,
    ) -> BoxFuture<'_, DomainResult<Record>>;

    fn get_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<Option<Alias>>>;

    /// Aliases pointing at the group key or at any of the given records.
    fn list_aliases(
        &self,
        group_key: &str,
        record_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<Alias>>>;

    fn put_alias(&self, alias: &Alias) -> BoxFuture<'_, DomainResult<()>>;

    fn delete_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<bool>>;

    fn get_registry(&self, group_key: &str)
    -> BoxFuture<'_, DomainResult<Option<GroupRegistryEntry>>>;

    fn put_registry(&self, entry: &GroupRegistryEntry) -> BoxFuture<'_, DomainResult<()>>;

    fn list_group_keys(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<String>>>;
}
