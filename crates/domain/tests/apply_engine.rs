use std::sync::Arc;

use catalog_domain::apply::{ApplyEngine, ApplyGate};
use catalog_domain::DomainResult;
use catalog_domain::catalog::{Alias, GroupRegistryEntry, Record, load_snapshot};
use catalog_domain::catalog_store::InMemoryCatalogStore;
use catalog_domain::compiler::compile;
use catalog_domain::error::{DomainError, ErrorCode};
use catalog_domain::idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore};
use catalog_domain::journal::InMemoryChangeJournal;
use catalog_domain::paths::{ALIAS_GROUP_PATH, ALIAS_RECORD_PATH};
use catalog_domain::plan::{ChangePlan, OpType, Operation, Patch};
use catalog_domain::ports::BoxFuture;
use catalog_domain::ports::catalog::{CatalogStore, CreateOutcome, NestedUpdate};
use catalog_domain::ports::jobs::{JobMode, JobType};
use catalog_domain::ports::journal::ChangeJournal;
use serde_json::json;

struct Harness {
    store: Arc<InMemoryCatalogStore>,
    journal: Arc<InMemoryChangeJournal>,
    idempotency: Arc<InMemoryIdempotencyStore>,
    engine: ApplyEngine,
}

fn harness(apply_enabled: bool) -> Harness {
    let store = Arc::new(InMemoryCatalogStore::new());
    let journal = Arc::new(InMemoryChangeJournal::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new("test"));
    let engine = ApplyEngine::new(
        store.clone(),
        journal.clone(),
        IdempotencyService::new(idempotency.clone(), IdempotencyConfig::default()),
        ApplyGate::new(apply_enabled),
    )
    .with_verification(true);
    Harness {
        store,
        journal,
        idempotency,
        engine,
    }
}

/// Delegates to the in-memory store but fails writes aimed at one id.
struct FailingStore {
    inner: Arc<InMemoryCatalogStore>,
    fail_id: &'static str,
}

impl FailingStore {
    fn refuse(&self, id: &str) -> bool {
        id == self.fail_id
    }
}

impl CatalogStore for FailingStore {
    fn get_record(&self, record_id: &str) -> BoxFuture<'_, DomainResult<Option<Record>>> {
        self.inner.get_record(record_id)
    }

    fn list_records_by_group(&self, group_key: &str) -> BoxFuture<'_, DomainResult<Vec<Record>>> {
        self.inner.list_records_by_group(group_key)
    }

    fn create_record_if_absent(
        &self,
        record: &Record,
    ) -> BoxFuture<'_, DomainResult<CreateOutcome>> {
        self.inner.create_record_if_absent(record)
    }

    fn update_record(
        &self,
        record_id: &str,
        update: &NestedUpdate,
    ) -> BoxFuture<'_, DomainResult<Record>> {
        if self.refuse(record_id) {
            return Box::pin(async { Err(DomainError::Unavailable("write timed out".into())) });
        }
        self.inner.update_record(record_id, update)
    }

    fn get_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<Option<Alias>>> {
        self.inner.get_alias(slug)
    }

    fn list_aliases(
        &self,
        group_key: &str,
        record_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<Alias>>> {
        self.inner.list_aliases(group_key, record_ids)
    }

    fn put_alias(&self, alias: &Alias) -> BoxFuture<'_, DomainResult<()>> {
        self.inner.put_alias(alias)
    }

    fn delete_alias(&self, slug: &str) -> BoxFuture<'_, DomainResult<bool>> {
        if self.refuse(slug) {
            return Box::pin(async { Err(DomainError::Unavailable("write timed out".into())) });
        }
        self.inner.delete_alias(slug)
    }

    fn get_registry(
        &self,
        group_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<GroupRegistryEntry>>> {
        self.inner.get_registry(group_key)
    }

    fn put_registry(&self, entry: &GroupRegistryEntry) -> BoxFuture<'_, DomainResult<()>> {
        self.inner.put_registry(entry)
    }

    fn list_group_keys(&self, limit: usize) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        self.inner.list_group_keys(limit)
    }
}

fn failing_engine(
    inner: Arc<InMemoryCatalogStore>,
    journal: Arc<InMemoryChangeJournal>,
    fail_id: &'static str,
) -> ApplyEngine {
    ApplyEngine::new(
        Arc::new(FailingStore { inner, fail_id }),
        journal,
        IdempotencyService::new(
            Arc::new(InMemoryIdempotencyStore::new("test")),
            IdempotencyConfig::default(),
        ),
        ApplyGate::new(true),
    )
}

async fn seed(store: &InMemoryCatalogStore) {
    store
        .seed_record(Record::new("bench-press", "Barbell Bench Press", vec!["barbell".into()]).with_id("R1"))
        .await;
    store
        .seed_record(Record::new("bench-press", "Incline Bench Press", vec!["barbell".into()]).with_id("R2"))
        .await;
}

fn scenario_plan() -> ChangePlan {
    ChangePlan::new("job-e2e", JobType::PlanApply)
        .with_operation(
            Operation::patch_fields(
                "R1",
                Patch::new().set("description", "Press the bar from the chest."),
            )
            .with_seed("seed-describe"),
        )
        .with_operation(
            Operation::create_record(
                Patch::new()
                    .set("name", "Dumbbell Bench Press")
                    .set("group_key", "bench-press")
                    .set("equipment", json!(["dumbbell"])),
            )
            .with_seed("seed-create"),
        )
}

#[tokio::test]
async fn patch_and_create_apply_once_then_skip() {
    let h = harness(true);
    seed(&h.store).await;
    let plan = scenario_plan();

    let first = h.engine.apply(&plan, JobMode::Apply).await;
    assert!(first.success, "{:?}", first.errors);
    assert_eq!(first.applied_count, 2);
    assert_eq!(first.skipped_count, 0);
    assert_eq!(first.verification_passed, Some(true));
    assert_eq!(first.needs_repair, Some(false));
    assert_eq!(h.journal.entry_count().await, 2);

    let created = h
        .store
        .get_record("bench-press__dumbbell-bench-press")
        .await
        .unwrap()
        .expect("created record");
    assert_eq!(created.name_slug, "dumbbell-bench-press");
    let described = h.store.get_record("R1").await.unwrap().expect("R1");
    assert_eq!(described.description.as_deref(), Some("Press the bar from the chest."));

    let entries = h.journal.list_entries("job-e2e").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].operation_index, 0);
    assert_eq!(entries[0].before, Some(json!({"R1": {"description": null}})));
    assert_eq!(entries[1].after.as_ref().and_then(|after| after.get("id")), Some(&json!("bench-press__dumbbell-bench-press")));
    assert_eq!(entries[0].change_id, first.change_id.clone().unwrap());

    let writes = h.store.write_count();
    let second = h.engine.apply(&plan, JobMode::Apply).await;
    assert!(second.success);
    assert_eq!(second.applied_count, 0);
    assert_eq!(second.skipped_count, plan.mutating_count());
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.journal.entry_count().await, 2);
    assert_eq!(h.journal.summaries().await.len(), 2);
}

#[tokio::test]
async fn dry_run_never_writes() {
    let h = harness(true);
    seed(&h.store).await;
    let plan = scenario_plan()
        .with_operation(Operation::upsert_alias_to_record("bbp", "R1"))
        .with_operation(Operation::deprecate_record("R2"))
        .with_operation(Operation::no_op("informational"));

    let result = h.engine.apply(&plan, JobMode::DryRun).await;
    assert!(result.success);
    assert_eq!(result.applied_count, 0);
    assert_eq!(result.change_id, None);
    let preview = result.dry_run_preview.expect("preview");
    assert_eq!(preview.len(), 4);
    assert_eq!(preview[3].index, 3);

    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.journal.entry_count().await, 0);
    assert!(h.journal.summaries().await.is_empty());
    assert!(h.idempotency.is_empty());
}

#[tokio::test]
async fn closed_gate_blocks_every_plan() {
    let h = harness(false);
    seed(&h.store).await;

    let result = h.engine.apply(&scenario_plan(), JobMode::Apply).await;
    assert!(!result.success);
    assert!(result.gate_blocked);
    assert_eq!(result.errors[0].code, ErrorCode::ApplyGateBlocked);
    assert_eq!(result.applied_count, 0);
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.journal.entry_count().await, 0);
    assert!(h.idempotency.is_empty());
}

#[tokio::test]
async fn invalid_path_in_third_operation_blocks_all_five() {
    let h = harness(true);
    seed(&h.store).await;
    let plan = ChangePlan::new("job-paths", JobType::PlanApply)
        .with_operation(Operation::patch_fields("R1", Patch::new().set("description", "a")))
        .with_operation(Operation::rename_record("R2", "Barbell Incline Bench Press"))
        .with_operation(Operation::patch_fields("R1", Patch::new().set("owner.password", "x")))
        .with_operation(Operation::upsert_alias_to_record("bbp", "R1"))
        .with_operation(Operation::deprecate_record("R2"));

    let result = h.engine.apply(&plan, JobMode::Apply).await;
    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].code, ErrorCode::InvalidPatchPaths);
    assert_eq!(result.errors[0].operation_index, Some(2));
    assert_eq!(result.errors[0].path.as_deref(), Some("owner.password"));
    assert_eq!(result.applied_count, 0);
    assert_eq!(result.change_id, None);
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.journal.entry_count().await, 0);
}

#[tokio::test]
async fn alias_xor_is_rejected_before_any_write() {
    let h = harness(true);
    seed(&h.store).await;
    let both = Operation::upsert_alias_to_record("bbp", "R1").with_seed("both");
    let both = Operation {
        patch: both.patch.clone().set(ALIAS_GROUP_PATH, "bench-press"),
        ..both
    };
    let neither = Operation::upsert_alias_to_record("empty", "R1").with_seed("neither");
    let neither = Operation {
        patch: Patch::new().set(ALIAS_RECORD_PATH, json!(null)),
        ..neither
    };
    let plan = ChangePlan::new("job-alias", JobType::PlanApply)
        .with_operation(both)
        .with_operation(neither);

    let result = h.engine.apply(&plan, JobMode::Apply).await;
    assert!(!result.success);
    assert_eq!(result.failed_count, 2);
    let codes: Vec<ErrorCode> = result.errors.iter().map(|error| error.code).collect();
    assert_eq!(codes, vec![ErrorCode::AliasBothFields, ErrorCode::AliasNoTarget]);
    assert_eq!(result.errors[0].target.as_deref(), Some("bbp"));
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.journal.entry_count().await, 0);
    // Failed claims are released so a corrected plan can run.
    assert!(h.idempotency.is_empty());
}

#[tokio::test]
async fn missing_target_fails_alone_and_later_operations_still_apply() {
    let h = harness(true);
    seed(&h.store).await;
    let plan = ChangePlan::new("job-partial", JobType::PlanApply)
        .with_operation(Operation::deprecate_record("missing"))
        .with_operation(Operation::deprecate_record("R2"));

    let result = h.engine.apply(&plan, JobMode::Apply).await;
    assert!(!result.success);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.applied_count, 1);
    assert_eq!(result.errors[0].code, ErrorCode::DocNotFound);
    assert_eq!(result.errors[0].operation_index, Some(0));
    assert_eq!(result.errors[0].target.as_deref(), Some("missing"));
    assert!(result.needs_review());

    let record = h.store.get_record("R2").await.unwrap().expect("R2");
    assert!(!record.is_active());
}

#[tokio::test]
async fn compiler_prediction_matches_applied_state() {
    let h = harness(true);
    seed(&h.store).await;
    h.store
        .seed_alias(catalog_domain::catalog::Alias::to_record("incline", "R2"))
        .await;
    let plan = scenario_plan()
        .with_operation(Operation::rename_record("R2", "Barbell Incline Bench Press"))
        .with_operation(Operation::upsert_alias_to_record("incline-bench-press", "R2"))
        .with_operation(Operation::delete_alias("incline"))
        .with_operation(Operation::patch_fields(
            "R1",
            Patch::new()
                .set("muscles.contribution", json!({"chest": 0.7, "triceps": 0.3}))
                .set("metadata.level", "intermediate"),
        ))
        .with_operation(Operation::update_group_registry(
            "bench-press",
            Patch::new().set("registry.equipment_variants", json!(["barbell", "dumbbell"])),
        ));

    let snapshot = load_snapshot(h.store.as_ref(), "bench-press").await.unwrap();
    let compiled = compile(&plan, &snapshot);
    assert!(compiled.is_clean(), "{:?}", compiled.errors);

    let result = h.engine.apply(&plan, JobMode::Apply).await;
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.verification_passed, Some(true));

    let actual = load_snapshot(h.store.as_ref(), "bench-press").await.unwrap();
    assert_eq!(actual.records, compiled.post_state.records);
    assert_eq!(actual.aliases, compiled.post_state.aliases);
    assert_eq!(actual.registry, compiled.post_state.registry);
    assert!(compiled.post_state.records.contains_key("bench-press__dumbbell-bench-press"));
}

#[tokio::test]
async fn deterministic_id_is_shared_by_compiler_and_engine() {
    let h = harness(true);
    let plan = ChangePlan::new("job-ids", JobType::PlanApply).with_operation(Operation::create_record(
        Patch::new()
            .set("name", "Kettlebell Swing")
            .set("group_key", "swing"),
    ));

    let snapshot = load_snapshot(h.store.as_ref(), "swing").await.unwrap();
    let first = compile(&plan, &snapshot);
    let second = compile(&plan, &snapshot);
    assert_eq!(first.post_state.records, second.post_state.records);
    assert!(first.post_state.records.contains_key("swing__kettlebell-swing"));

    let result = h.engine.apply(&plan, JobMode::Apply).await;
    assert_eq!(result.applied_count, 1);
    assert!(h.store.get_record("swing__kettlebell-swing").await.unwrap().is_some());

    // A differently seeded retry of the same create is absorbed by create-if-absent.
    let retry = ChangePlan::new("job-ids-retry", JobType::PlanApply)
        .with_operation(plan.operations[0].clone());
    let result = h.engine.apply(&retry, JobMode::Apply).await;
    assert!(result.success);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(h.store.all_records().await.len(), 1);
}

#[tokio::test]
async fn journal_summary_records_counts() {
    let h = harness(true);
    seed(&h.store).await;
    let result = h.engine.apply(&scenario_plan(), JobMode::Apply).await;
    let change_id = result.change_id.expect("change id");
    let summary = h
        .journal
        .get_summary(&change_id)
        .await
        .unwrap()
        .expect("summary");
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.mode, JobMode::Apply);
    assert_eq!(summary.job_type, JobType::PlanApply);
}

#[tokio::test]
async fn writes_before_a_failing_target_are_journaled() {
    let store = Arc::new(InMemoryCatalogStore::new());
    let journal = Arc::new(InMemoryChangeJournal::new());
    seed(&store).await;
    let engine = failing_engine(store.clone(), journal.clone(), "R2");
    let plan = ChangePlan::new("job-multi", JobType::PlanApply).with_operation(Operation::new(
        OpType::PatchFields,
        vec!["R1".into(), "R2".into()],
        Patch::new().set("description", "changed"),
    ));

    let result = engine.apply(&plan, JobMode::Apply).await;
    assert_eq!(result.applied_count, 0);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.errors[0].target.as_deref(), Some("R2"));
    assert!(result.errors[0].message.contains("1 of 2 targets written"));

    let r1 = store.get_record("R1").await.unwrap().expect("R1");
    assert_eq!(r1.description.as_deref(), Some("changed"));
    let entries = journal.list_entries("job-multi").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].before, Some(json!({"R1": {"description": null}})));
    assert_eq!(entries[0].after, Some(json!({"R1": {"description": "changed"}})));
}

#[tokio::test]
async fn alias_deletes_before_a_failing_slug_are_journaled() {
    let store = Arc::new(InMemoryCatalogStore::new());
    let journal = Arc::new(InMemoryChangeJournal::new());
    seed(&store).await;
    store.seed_alias(Alias::to_record("bbp", "R1")).await;
    store.seed_alias(Alias::to_record("incline", "R2")).await;
    let engine = failing_engine(store.clone(), journal.clone(), "incline");
    let plan = ChangePlan::new("job-aliases", JobType::PlanApply).with_operation(Operation::new(
        OpType::DeleteAlias,
        vec!["bbp".into(), "incline".into()],
        Patch::new(),
    ));

    let result = engine.apply(&plan, JobMode::Apply).await;
    assert_eq!(result.failed_count, 1);
    assert!(store.get_alias("bbp").await.unwrap().is_none());
    assert!(store.get_alias("incline").await.unwrap().is_some());

    let entries = journal.list_entries("job-aliases").await.unwrap();
    assert_eq!(entries.len(), 1);
    let before = entries[0].before.as_ref().expect("before");
    assert!(before.get("bbp").is_some_and(|alias| !alias.is_null()));
    assert!(before.get("incline").is_none());
    assert_eq!(entries[0].after, Some(json!({"bbp": null})));
}
