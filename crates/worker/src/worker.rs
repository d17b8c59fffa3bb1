//! Bounded-run worker: leases jobs one at a time until the queue is empty, a
//! budget is spent or a stop is requested.

use std::sync::Arc;
use std::time::{Duration, Instant};

use catalog_domain::error::ErrorCode;
use catalog_domain::executor::{JobHandler, follow_ups};
use catalog_domain::jobs::{JobDefaults, backoff_ms, new_job, now_ms};
use catalog_domain::ports::jobs::{
    Job, JobFailure, JobMode, JobOutcome, JobPayload, JobQueue, JobStatus,
};
use catalog_domain::ports::lock::{LockHandle, ResourceLock, group_lock_resource};
use catalog_domain::util::uuid_v7_without_dashes;
use catalog_infra::config::AppConfig;
use tokio::sync::watch;

use crate::heartbeat::{Heartbeat, HeartbeatTarget};
use crate::observability;

const RECLAIM_BATCH: usize = 100;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_jobs_per_run: usize,
    pub max_runtime: Duration,
    pub safety_margin: Duration,
    pub heartbeat_interval: Duration,
    pub lock_ttl: Duration,
    pub queue_retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub enqueue_follow_ups: bool,
    pub max_attempts: u32,
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            worker_id: config.resolved_worker_id(),
            max_jobs_per_run: config.worker_max_jobs_per_run,
            max_runtime: config.max_runtime(),
            safety_margin: config.safety_margin(),
            heartbeat_interval: config.heartbeat_interval(),
            lock_ttl: config.lock_ttl(),
            queue_retry_attempts: config.worker_queue_retry_attempts,
            backoff_base_ms: config.worker_backoff_base_ms,
            backoff_max_ms: config.worker_backoff_max_ms,
            enqueue_follow_ups: config.worker_enqueue_follow_ups,
            max_attempts: config.worker_max_attempts,
        }
    }

    /// Wall-clock time the run may spend before it stops leasing.
    pub fn budget(&self) -> Duration {
        self.max_runtime.saturating_sub(self.safety_margin)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            max_jobs_per_run: 10,
            max_runtime: Duration::from_secs(540),
            safety_margin: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            lock_ttl: Duration::from_secs(120),
            queue_retry_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            enqueue_follow_ups: true,
            max_attempts: JobDefaults::default().max_attempts,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    NoJob,
    JobBudget,
    Deadline,
    StopSignal,
    QueueUnavailable,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoJob => "no_job",
            Self::JobBudget => "job_budget",
            Self::Deadline => "deadline",
            Self::StopSignal => "stop_signal",
            Self::QueueUnavailable => "queue_unavailable",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub exit_reason: ExitReason,
}

enum LeaseAttempt {
    Job(Box<Job>),
    Empty,
    Exit(ExitReason),
}

pub struct CatalogWorker {
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn ResourceLock>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl CatalogWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        locks: Arc<dyn ResourceLock>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn run(&self, stop: watch::Receiver<bool>) -> RunSummary {
        let deadline = Instant::now() + self.config.budget();
        let mut summary = RunSummary {
            processed: 0,
            succeeded: 0,
            failed: 0,
            exit_reason: ExitReason::NoJob,
        };
        tracing::info!(
            worker_id = %self.config.worker_id,
            max_jobs = self.config.max_jobs_per_run,
            budget_ms = self.config.budget().as_millis() as u64,
            "worker run starting"
        );
        self.reclaim_expired().await;

        summary.exit_reason = loop {
            if *stop.borrow() {
                break ExitReason::StopSignal;
            }
            if summary.processed >= self.config.max_jobs_per_run {
                break ExitReason::JobBudget;
            }
            if Instant::now() >= deadline {
                break ExitReason::Deadline;
            }

            let job = match self.poll(deadline).await {
                LeaseAttempt::Job(job) => job,
                LeaseAttempt::Empty => break ExitReason::NoJob,
                LeaseAttempt::Exit(reason) => break reason,
            };
            summary.processed += 1;
            if self.process(*job).await {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        };

        observability::register_run_exit(summary.exit_reason.as_str());
        tracing::info!(
            worker_id = %self.config.worker_id,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            exit_reason = %summary.exit_reason,
            "worker run finished"
        );
        summary
    }

    async fn reclaim_expired(&self) {
        match self.queue.reclaim_expired(now_ms(), RECLAIM_BATCH).await {
            Ok(reclaimed) => {
                observability::set_jobs_reclaimed(reclaimed);
                if reclaimed > 0 {
                    tracing::info!(reclaimed, "returned expired leases to the queue");
                }
            }
            Err(err) => tracing::warn!(error = %err, "expired lease sweep failed"),
        }
    }

    /// Leases the next job, retrying transient queue errors with backoff. A
    /// retry that would sleep past the deadline ends the run instead.
    async fn poll(&self, deadline: Instant) -> LeaseAttempt {
        let mut attempt = 0u32;
        loop {
            match self.queue.lease(&self.config.worker_id).await {
                Ok(Some(job)) => return LeaseAttempt::Job(Box::new(job)),
                Ok(None) => return LeaseAttempt::Empty,
                Err(err) if err.is_transient() && attempt < self.config.queue_retry_attempts => {
                    attempt += 1;
                    let delay = Duration::from_millis(backoff_ms(
                        self.config.backoff_base_ms,
                        attempt,
                        self.config.backoff_max_ms,
                    ));
                    if Instant::now() + delay >= deadline {
                        return LeaseAttempt::Exit(ExitReason::Deadline);
                    }
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "job lease failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, attempts = attempt + 1, "job queue unavailable");
                    return LeaseAttempt::Exit(ExitReason::QueueUnavailable);
                }
            }
        }
    }

    /// Runs one leased job to a queue transition. `true` when the job was
    /// completed by this worker.
    async fn process(&self, job: Job) -> bool {
        let started = Instant::now();
        let job_type = job.job_type.as_str();
        let worker_id = self.config.worker_id.as_str();
        tracing::info!(
            job_id = %job.id,
            job_type,
            attempt = job.attempts,
            "processing job"
        );

        let lock = match self.acquire_lock(&job).await {
            Ok(lock) => lock,
            Err(failure) => {
                self.fail_job(&job, &failure).await;
                observability::register_job_processed(
                    job_type,
                    failure.code.as_str(),
                    started.elapsed().as_secs_f64() * 1000.0,
                );
                return false;
            }
        };

        if let Err(err) = self.queue.mark_running(&job.id, worker_id).await {
            tracing::warn!(job_id = %job.id, error = %err, "could not mark job running");
            self.release_lock(lock.as_ref()).await;
            observability::register_job_processed(
                job_type,
                "lease_lost",
                started.elapsed().as_secs_f64() * 1000.0,
            );
            return false;
        }

        let heartbeat = Heartbeat::spawn(
            self.queue.clone(),
            self.locks.clone(),
            HeartbeatTarget {
                job_id: job.id.clone(),
                worker_id: worker_id.to_string(),
                lock: lock.clone(),
            },
            self.config.heartbeat_interval,
            self.config.lock_ttl,
        );
        let result = self.handler.execute(&job).await;
        let report = heartbeat.stop().await;
        observability::register_heartbeat_failures("lease", report.lease_failures);
        observability::register_heartbeat_failures("lock", report.lock_failures);

        let (completed, label) = match result {
            Ok(outcome) => match self.queue.complete(&job.id, worker_id, &outcome).await {
                Ok(_) => {
                    tracing::info!(
                        job_id = %job.id,
                        status = %outcome.status,
                        heartbeats = report.ticks,
                        "job completed"
                    );
                    if self.config.enqueue_follow_ups && outcome.status != JobStatus::NeedsReview
                    {
                        self.enqueue_follow_ups(&job, &outcome).await;
                    }
                    (true, outcome.status.as_str())
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "job completion rejected");
                    (false, "lease_lost")
                }
            },
            Err(failure) => {
                self.fail_job(&job, &failure).await;
                (false, failure.code.as_str())
            }
        };

        self.release_lock(lock.as_ref()).await;
        observability::register_job_processed(
            job_type,
            label,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        completed
    }

    /// Mutating jobs take the group lock; read-only jobs and jobs without a
    /// group key run unlocked.
    async fn acquire_lock(&self, job: &Job) -> Result<Option<LockHandle>, JobFailure> {
        if !job.job_type.is_mutating() {
            return Ok(None);
        }
        let Some(group_key) = job.payload.group_key.as_deref() else {
            return Ok(None);
        };
        let resource = group_lock_resource(group_key);
        match self
            .locks
            .acquire(&resource, &self.config.worker_id, self.config.lock_ttl)
            .await
        {
            Ok(Some(handle)) => Ok(Some(handle)),
            Ok(None) => {
                observability::register_lock_contention(job.job_type.as_str());
                tracing::info!(job_id = %job.id, resource = %resource, "group lock contended");
                Err(JobFailure::new(
                    ErrorCode::LockContention,
                    format!("{resource} is locked by another worker"),
                ))
            }
            Err(err) => Err(JobFailure::new(
                ErrorCode::Exception,
                format!("lock acquisition failed: {err}"),
            )),
        }
    }

    async fn release_lock(&self, lock: Option<&LockHandle>) {
        let Some(handle) = lock else {
            return;
        };
        match self.locks.release(handle).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(resource = %handle.resource, "group lock expired before release"),
            Err(err) => tracing::warn!(resource = %handle.resource, error = %err, "lock release failed"),
        }
    }

    async fn fail_job(&self, job: &Job, failure: &JobFailure) {
        match self.queue.fail(&job.id, &self.config.worker_id, failure).await {
            Ok(updated) => tracing::warn!(
                job_id = %job.id,
                code = failure.code.as_str(),
                transient = failure.is_transient,
                status = %updated.status,
                message = %failure.message,
                "job failed"
            ),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "queue rejected job failure")
            }
        }
    }

    async fn enqueue_follow_ups(&self, job: &Job, outcome: &JobOutcome) {
        for follow_up in follow_ups(outcome) {
            let next = new_job(
                uuid_v7_without_dashes(),
                follow_up.suggested_job_type,
                JobPayload::for_group(follow_up.group_key.clone(), JobMode::DryRun),
                JobDefaults {
                    max_attempts: self.config.max_attempts,
                },
            );
            match self.queue.enqueue(&next).await {
                Ok(()) => tracing::info!(
                    parent_job_id = %job.id,
                    job_id = %next.id,
                    job_type = %next.job_type,
                    group_key = %follow_up.group_key,
                    "follow-up job enqueued"
                ),
                Err(err) => tracing::warn!(
                    parent_job_id = %job.id,
                    group_key = %follow_up.group_key,
                    error = %err,
                    "follow-up enqueue failed"
                ),
            }
        }
    }
}
