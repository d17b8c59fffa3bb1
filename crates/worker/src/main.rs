mod heartbeat;
mod observability;
mod worker;

use std::sync::Arc;

use catalog_domain::apply::{ApplyEngine, ApplyGate};
use catalog_domain::catalog_store::InMemoryCatalogStore;
use catalog_domain::executor::{ExecutorConfig, JobExecutor};
use catalog_domain::idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore};
use catalog_domain::jobs::InMemoryJobQueue;
use catalog_domain::journal::InMemoryChangeJournal;
use catalog_domain::lock::InMemoryResourceLock;
use catalog_domain::ports::catalog::CatalogStore;
use catalog_domain::ports::idempotency::IdempotencyStore;
use catalog_domain::ports::jobs::JobQueue;
use catalog_domain::ports::journal::ChangeJournal;
use catalog_domain::ports::lock::ResourceLock;
use catalog_infra::db::{self, DbConfig};
use catalog_infra::idempotency::RedisIdempotencyStore;
use catalog_infra::jobs::RedisJobQueue;
use catalog_infra::lock::RedisResourceLock;
use catalog_infra::repositories::{SurrealCatalogStore, SurrealChangeJournal};
use catalog_domain::util::uuid_v7_without_dashes;
use catalog_infra::config::AppConfig;
use catalog_infra::logging::{init_tracing, run_span};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

use crate::worker::{CatalogWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    if config.metrics_enabled {
        observability::init_metrics()?;
    }

    let worker = build_worker(&config).await?;
    let run_id = uuid_v7_without_dashes();
    let span = run_span(&config, &worker.config().worker_id, &run_id);
    span.in_scope(|| {
        info!(
            apply_enabled = config.catalog_apply_enabled,
            "catalog worker starting"
        )
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop signal received, finishing current job");
            let _ = stop_tx.send(true);
        }
    });

    let summary = worker.run(stop_rx).instrument(span.clone()).await;
    span.in_scope(|| {
        if let Some(rendered) = observability::render_metrics() {
            debug!(metrics = %rendered, "worker metrics");
        }
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            exit_reason = %summary.exit_reason,
            "catalog worker shutdown"
        );
    });

    Ok(())
}

struct Backends {
    store: Arc<dyn CatalogStore>,
    journal: Arc<dyn ChangeJournal>,
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn ResourceLock>,
    idempotency: Arc<dyn IdempotencyStore>,
}

async fn connect_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    if !config.uses_surreal() {
        warn!("memory backend selected; nothing persists past this run");
        return Ok(Backends {
            store: Arc::new(InMemoryCatalogStore::new()),
            journal: Arc::new(InMemoryChangeJournal::new()),
            queue: Arc::new(InMemoryJobQueue::new(config.lease_ttl())),
            locks: Arc::new(InMemoryResourceLock::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new(
                config.worker_idempotency_prefix.clone(),
            )),
        });
    }

    let db_config = DbConfig::from_app_config(config);
    db::health_check(&db_config).await?;
    let queue = RedisJobQueue::connect_with_prefix(
        &config.redis_url,
        config.worker_queue_prefix.clone(),
        config.lease_ttl(),
    )
    .await?;
    match queue.metrics_snapshot().await {
        Ok(snapshot) => {
            observability::set_queue_depth_gauge(
                snapshot.ready,
                snapshot.leased,
                snapshot.deadletter,
            );
            info!(
                ready = snapshot.ready,
                leased = snapshot.leased,
                deadletter = snapshot.deadletter,
                oldest_lease_expiry_ms = ?snapshot.oldest_lease_expiry_ms,
                "job queue depth"
            );
        }
        Err(err) => warn!(error = %err, "job queue depth unavailable"),
    }

    Ok(Backends {
        store: Arc::new(SurrealCatalogStore::new(&db_config).await?),
        journal: Arc::new(SurrealChangeJournal::new(&db_config).await?),
        queue: Arc::new(queue),
        locks: Arc::new(
            RedisResourceLock::connect_with_prefix(
                &config.redis_url,
                config.worker_lock_prefix.clone(),
            )
            .await?,
        ),
        idempotency: Arc::new(
            RedisIdempotencyStore::connect_with_prefix(
                &config.redis_url,
                config.worker_idempotency_prefix.clone(),
            )
            .await?,
        ),
    })
}

async fn build_worker(config: &AppConfig) -> anyhow::Result<CatalogWorker> {
    let backends = connect_backends(config).await?;
    let idempotency = IdempotencyService::new(
        backends.idempotency,
        IdempotencyConfig {
            in_progress_ttl: config.idempotency_in_progress_ttl(),
            completed_ttl: config.idempotency_completed_ttl(),
        },
    );
    let engine = ApplyEngine::new(
        backends.store.clone(),
        backends.journal,
        idempotency,
        ApplyGate::new(config.catalog_apply_enabled),
    )
    .with_verification(config.catalog_verify_after_apply);
    let executor = JobExecutor::new(
        backends.store,
        Arc::new(engine),
        ExecutorConfig {
            scan_group_limit: config.scan_group_limit,
        },
    );

    Ok(CatalogWorker::new(
        backends.queue,
        backends.locks,
        Arc::new(executor),
        WorkerConfig::from_app_config(config),
    ))
}
