use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ErrorCode;
use crate::ports::BoxFuture;
use crate::ports::jobs::{
    Job, JobFailure, JobOutcome, JobPayload, JobQueue, JobQueueError, JobStatus, JobType,
};

#[derive(Clone, Debug)]
pub struct JobDefaults {
    pub max_attempts: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn backoff_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = base_ms.saturating_mul(pow);
    delay.min(max_ms)
}

pub fn new_job(
    job_id: String,
    job_type: JobType,
    payload: JobPayload,
    defaults: JobDefaults,
) -> Job {
    let now = now_ms();
    Job {
        id: job_id,
        job_type,
        payload,
        status: JobStatus::Queued,
        attempts: 0,
        max_attempts: defaults.max_attempts,
        lease_owner: None,
        lease_expires_at_ms: None,
        last_error: None,
        result: None,
        created_at_ms: now,
        updated_at_ms: now,
    }
}

pub fn ttl_ms(ttl: Duration) -> i64 {
    ttl.as_millis().min(i64::MAX as u128) as i64
}

// Job state transitions shared by every queue adapter. Callers have already
// checked ownership; these only rewrite the document.

pub fn lease_transition(job: &mut Job, worker_id: &str, now_ms: i64, lease_ttl_ms: i64) {
    job.status = JobStatus::Leased;
    job.attempts = job.attempts.saturating_add(1);
    job.lease_owner = Some(worker_id.to_string());
    job.lease_expires_at_ms = Some(now_ms.saturating_add(lease_ttl_ms));
    job.updated_at_ms = now_ms;
}

pub fn running_transition(job: &mut Job, now_ms: i64) {
    job.status = JobStatus::Running;
    job.updated_at_ms = now_ms;
}

pub fn renew_transition(job: &mut Job, now_ms: i64, lease_ttl_ms: i64) {
    job.lease_expires_at_ms = Some(now_ms.saturating_add(lease_ttl_ms));
    job.updated_at_ms = now_ms;
}

pub fn completion_transition(job: &mut Job, outcome: &JobOutcome, now_ms: i64) {
    job.status = outcome.status;
    job.result = Some(outcome.result.clone());
    job.lease_owner = None;
    job.lease_expires_at_ms = None;
    job.updated_at_ms = now_ms;
}

/// Transient failures with attempts left go back to the queue, exhausted ones
/// to the dead letter list, everything else is terminal.
pub fn failure_transition(job: &mut Job, failure: &JobFailure, now_ms: i64) -> JobStatus {
    job.status = if !failure.is_transient {
        JobStatus::Failed
    } else if job.attempts_exhausted() {
        JobStatus::Deadletter
    } else {
        JobStatus::Queued
    };
    job.last_error = Some(failure.clone());
    job.lease_owner = None;
    job.lease_expires_at_ms = None;
    job.updated_at_ms = now_ms;
    job.status
}

pub fn reclaim_transition(job: &mut Job, now_ms: i64) -> JobStatus {
    let failure = JobFailure::new(ErrorCode::Exception, "lease expired before completion");
    failure_transition(job, &failure, now_ms)
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    ready: VecDeque<String>,
    deadletter: Vec<String>,
}

impl QueueState {
    fn owned_job(&mut self, job_id: &str, worker_id: &str) -> Result<&mut Job, JobQueueError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobQueueError::NotFound(job_id.to_string()))?;
        if !job.is_leased_by(worker_id) {
            return Err(JobQueueError::LeaseLost(job_id.to_string()));
        }
        Ok(job)
    }

    fn route(&mut self, job_id: &str, status: JobStatus) {
        match status {
            JobStatus::Queued => self.ready.push_back(job_id.to_string()),
            JobStatus::Deadletter => self.deadletter.push(job_id.to_string()),
            _ => {}
        }
    }
}

/// Process-local queue with the same lease semantics as the Redis adapter.
#[derive(Clone, Debug)]
pub struct InMemoryJobQueue {
    lease_ttl: Duration,
    inner: Arc<Mutex<QueueState>>,
}

impl InMemoryJobQueue {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            lease_ttl,
            inner: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().expect("job queue lock").ready.len()
    }

    pub fn deadletter_ids(&self) -> Vec<String> {
        self.inner.lock().expect("job queue lock").deadletter.clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        let guard = self.inner.lock().expect("job queue lock");
        let mut jobs: Vec<Job> = guard.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        jobs
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: &Job) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("job queue lock");
            if guard.jobs.contains_key(&job.id) {
                return Err(JobQueueError::Operation(format!(
                    "job {} already enqueued",
                    job.id
                )));
            }
            let job_id = job.id.clone();
            let status = job.status;
            guard.jobs.insert(job_id.clone(), job);
            if status == JobStatus::Queued {
                guard.ready.push_back(job_id);
            }
            Ok(())
        })
    }

    fn lease(&self, worker_id: &str) -> BoxFuture<'_, Result<Option<Job>, JobQueueError>> {
        let worker_id = worker_id.to_string();
        let lease_ttl_ms = ttl_ms(self.lease_ttl);
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("job queue lock");
            while let Some(job_id) = guard.ready.pop_front() {
                let Some(job) = guard.jobs.get_mut(&job_id) else {
                    continue;
                };
                if job.status != JobStatus::Queued {
                    continue;
                }
                lease_transition(job, &worker_id, now_ms(), lease_ttl_ms);
                return Ok(Some(job.clone()));
            }
            Ok(None)
        })
    }

    fn mark_running(
        &self,
        job_id: &str,
        worker_id: &str,
    ) -> BoxFuture<'_, Result<Job, JobQueueError>> {
        let job_id = job_id.to_string();
        let worker_id = worker_id.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("job queue lock");
            let job = guard.owned_job(&job_id, &worker_id)?;
            running_transition(job, now_ms());
            Ok(job.clone())
        })
    }

    fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> BoxFuture<'_, Result<Job, JobQueueError>> {
        let job_id = job_id.to_string();
        let worker_id = worker_id.to_string();
        let outcome = outcome.clone();
        Box::pin(async move {
            if !outcome.status.is_terminal() {
                return Err(JobQueueError::Operation(format!(
                    "cannot complete job with status {}",
                    outcome.status
                )));
            }
            let mut guard = self.inner.lock().expect("job queue lock");
            let job = guard.owned_job(&job_id, &worker_id)?;
            completion_transition(job, &outcome, now_ms());
            Ok(job.clone())
        })
    }

    fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> BoxFuture<'_, Result<Job, JobQueueError>> {
        let job_id = job_id.to_string();
        let worker_id = worker_id.to_string();
        let failure = failure.clone();
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("job queue lock");
            let job = guard.owned_job(&job_id, &worker_id)?;
            let status = failure_transition(job, &failure, now_ms());
            let job = job.clone();
            guard.route(&job_id, status);
            Ok(job)
        })
    }

    fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let job_id = job_id.to_string();
        let worker_id = worker_id.to_string();
        let lease_ttl_ms = ttl_ms(self.lease_ttl);
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("job queue lock");
            match guard.owned_job(&job_id, &worker_id) {
                Ok(job) => {
                    renew_transition(job, now_ms(), lease_ttl_ms);
                    Ok(true)
                }
                Err(JobQueueError::LeaseLost(_)) => Ok(false),
                Err(err) => Err(err),
            }
        })
    }

    fn reclaim_expired(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().expect("job queue lock");
            let mut expired: Vec<(i64, String)> = guard
                .jobs
                .values()
                .filter(|job| job.lease_expired(now_ms))
                .map(|job| (job.lease_expires_at_ms.unwrap_or_default(), job.id.clone()))
                .collect();
            expired.sort();
            expired.truncate(limit);

            for (_, job_id) in &expired {
                let Some(job) = guard.jobs.get_mut(job_id) else {
                    continue;
                };
                let status = reclaim_transition(job, now_ms);
                tracing::warn!(job_id = %job_id, status = %status, "reclaimed expired lease");
                guard.route(job_id, status);
            }
            Ok(expired.len())
        })
    }

    fn get(&self, job_id: &str) -> BoxFuture<'_, Result<Option<Job>, JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let guard = self.inner.lock().expect("job queue lock");
            Ok(guard.jobs.get(&job_id).cloned())
        })
    }
}
