use std::time::Duration;

use catalog_domain::jobs::{
    completion_transition, failure_transition, lease_transition, now_ms, reclaim_transition,
    renew_transition, running_transition, ttl_ms,
};
use catalog_domain::ports::BoxFuture;
use catalog_domain::ports::jobs::{
    Job, JobFailure, JobOutcome, JobQueue, JobQueueError, JobStatus,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "catalog:jobs";
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

/// Pops the next ready id and records the claim. Returns `{job_id, document}`.
const LEASE_SCRIPT: &str = r#"
    local jobs_key = KEYS[1]
    local ready_key = KEYS[2]
    local leased_key = KEYS[3]
    local owners_key = KEYS[4]
    local worker_id = ARGV[1]
    local expires_at_ms = tonumber(ARGV[2])

    while true do
        local job_id = redis.call('LPOP', ready_key)
        if not job_id then
            return false
        end
        local payload = redis.call('HGET', jobs_key, job_id)
        if payload and not redis.call('HGET', owners_key, job_id) then
            redis.call('HSET', owners_key, job_id, worker_id)
            redis.call('ZADD', leased_key, expires_at_ms, job_id)
            return { job_id, payload }
        end
    end
"#;

/// Writes a job document only while `owner` still holds the lease, then routes it.
/// With ARGV[6] set, also requires the lease to have expired by that instant.
const COMMIT_SCRIPT: &str = r#"
    local jobs_key = KEYS[1]
    local ready_key = KEYS[2]
    local leased_key = KEYS[3]
    local owners_key = KEYS[4]
    local archive_key = KEYS[5]
    local deadletter_key = KEYS[6]
    local job_id = ARGV[1]
    local owner = ARGV[2]
    local payload = ARGV[3]
    local action = ARGV[4]
    local expires_at_ms = tonumber(ARGV[5])
    local expired_by_ms = tonumber(ARGV[6])

    if redis.call('HGET', owners_key, job_id) ~= owner then
        return 0
    end
    if expired_by_ms then
        local score = redis.call('ZSCORE', leased_key, job_id)
        if not score or tonumber(score) > expired_by_ms then
            return 0
        end
    end

    if action == 'hold' then
        redis.call('HSET', jobs_key, job_id, payload)
        redis.call('ZADD', leased_key, expires_at_ms, job_id)
        return 1
    end

    redis.call('ZREM', leased_key, job_id)
    redis.call('HDEL', owners_key, job_id)
    if action == 'requeue' then
        redis.call('HSET', jobs_key, job_id, payload)
        redis.call('RPUSH', ready_key, job_id)
    else
        redis.call('HDEL', jobs_key, job_id)
        redis.call('HSET', archive_key, job_id, payload)
        if action == 'deadletter' then
            redis.call('RPUSH', deadletter_key, job_id)
        end
    end
    return 1
"#;

/// Drops an expired leased entry whose owner or document is gone.
const DROP_ORPHAN_SCRIPT: &str = r#"
    local jobs_key = KEYS[1]
    local leased_key = KEYS[2]
    local owners_key = KEYS[3]
    local job_id = ARGV[1]
    local expired_by_ms = tonumber(ARGV[2])

    local score = redis.call('ZSCORE', leased_key, job_id)
    if not score or tonumber(score) > expired_by_ms then
        return 0
    end
    if redis.call('HEXISTS', owners_key, job_id) == 1 and redis.call('HEXISTS', jobs_key, job_id) == 1 then
        return 0
    end
    redis.call('ZREM', leased_key, job_id)
    redis.call('HDEL', owners_key, job_id)
    return 1
"#;

/// What an expired entry of the leased set still points at.
#[derive(Debug)]
enum ExpiredLease {
    Orphaned,
    Undecodable {
        owner: String,
        payload: String,
        error: JobQueueError,
    },
    Live {
        owner: String,
        job: Box<Job>,
    },
}

fn classify_expired(owner: Option<String>, payload: Option<String>) -> ExpiredLease {
    let (Some(owner), Some(payload)) = (owner, payload) else {
        return ExpiredLease::Orphaned;
    };
    match RedisJobQueue::deserialize(&payload) {
        Ok(job) => ExpiredLease::Live {
            owner,
            job: Box::new(job),
        },
        Err(error) => ExpiredLease::Undecodable {
            owner,
            payload,
            error,
        },
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Hold,
    Requeue,
    Archive,
    Deadletter,
}

impl Route {
    fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Leased | JobStatus::Running => Self::Hold,
            JobStatus::Queued => Self::Requeue,
            JobStatus::Deadletter => Self::Deadletter,
            _ => Self::Archive,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Requeue => "requeue",
            Self::Archive => "archive",
            Self::Deadletter => "deadletter",
        }
    }
}

#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    lease_ttl: Duration,
    jobs_key: String,
    ready_key: String,
    leased_key: String,
    owners_key: String,
    archive_key: String,
    deadletter_key: String,
}

#[derive(Debug, Clone)]
pub struct JobQueueMetricsSnapshot {
    pub ready: u64,
    pub leased: u64,
    pub deadletter: u64,
    pub oldest_lease_expiry_ms: Option<i64>,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, JobQueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX, DEFAULT_LEASE_TTL).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
        lease_ttl: Duration,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| JobQueueError::Unavailable(err.to_string()))?;
        let prefix = prefix.into();
        Ok(Self {
            manager,
            lease_ttl,
            jobs_key: format!("{prefix}:jobs"),
            ready_key: format!("{prefix}:ready"),
            leased_key: format!("{prefix}:leased"),
            owners_key: format!("{prefix}:owners"),
            archive_key: format!("{prefix}:archive"),
            deadletter_key: format!("{prefix}:deadletter"),
        })
    }

    fn serialize(job: &Job) -> Result<String, JobQueueError> {
        serde_json::to_string(job).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<Job, JobQueueError> {
        serde_json::from_str(payload).map_err(|err| JobQueueError::Serialization(err.to_string()))
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, JobQueueError> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn
            .hget(&self.jobs_key, job_id)
            .await
            .map_err(operation_error)?;
        payload.map(|payload| Self::deserialize(&payload)).transpose()
    }

    async fn is_archived(&self, job_id: &str) -> Result<bool, JobQueueError> {
        let mut conn = self.manager.clone();
        conn.hexists(&self.archive_key, job_id)
            .await
            .map_err(operation_error)
    }

    /// Loads a live job and checks that `worker_id` holds its lease.
    async fn load_owned(&self, job_id: &str, worker_id: &str) -> Result<Job, JobQueueError> {
        match self.load(job_id).await? {
            Some(job) if job.is_leased_by(worker_id) => Ok(job),
            Some(_) => Err(JobQueueError::LeaseLost(job_id.to_string())),
            None if self.is_archived(job_id).await? => {
                Err(JobQueueError::LeaseLost(job_id.to_string()))
            }
            None => Err(JobQueueError::NotFound(job_id.to_string())),
        }
    }

    async fn commit(
        &self,
        job: &Job,
        owner: &str,
        route: Route,
        expired_by_ms: Option<i64>,
    ) -> Result<bool, JobQueueError> {
        let payload = Self::serialize(job)?;
        self.commit_payload(
            &job.id,
            owner,
            &payload,
            route,
            job.lease_expires_at_ms.unwrap_or_default(),
            expired_by_ms,
        )
        .await
    }

    async fn commit_payload(
        &self,
        job_id: &str,
        owner: &str,
        payload: &str,
        route: Route,
        lease_expires_at_ms: i64,
        expired_by_ms: Option<i64>,
    ) -> Result<bool, JobQueueError> {
        let mut conn = self.manager.clone();
        let committed: i32 = redis::Script::new(COMMIT_SCRIPT)
            .key(&self.jobs_key)
            .key(&self.ready_key)
            .key(&self.leased_key)
            .key(&self.owners_key)
            .key(&self.archive_key)
            .key(&self.deadletter_key)
            .arg(job_id)
            .arg(owner)
            .arg(payload)
            .arg(route.as_str())
            .arg(lease_expires_at_ms)
            .arg(expired_by_ms.map(|value| value.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(operation_error)?;
        Ok(committed == 1)
    }

    async fn drop_orphan(&self, job_id: &str, now_ms: i64) -> Result<bool, JobQueueError> {
        let mut conn = self.manager.clone();
        let dropped: i32 = redis::Script::new(DROP_ORPHAN_SCRIPT)
            .key(&self.jobs_key)
            .key(&self.leased_key)
            .key(&self.owners_key)
            .arg(job_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(operation_error)?;
        Ok(dropped == 1)
    }

    async fn commit_owned(
        &self,
        job: &Job,
        worker_id: &str,
        route: Route,
    ) -> Result<Job, JobQueueError> {
        if self.commit(job, worker_id, route, None).await? {
            Ok(job.clone())
        } else {
            Err(JobQueueError::LeaseLost(job.id.clone()))
        }
    }

    pub async fn metrics_snapshot(&self) -> Result<JobQueueMetricsSnapshot, JobQueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = conn.llen(&self.ready_key).await.map_err(operation_error)?;
        let leased: u64 = conn.zcard(&self.leased_key).await.map_err(operation_error)?;
        let deadletter: u64 = conn
            .llen(&self.deadletter_key)
            .await
            .map_err(operation_error)?;

        let oldest_lease_expiry_ms = if leased == 0 {
            None
        } else {
            let result: Vec<(String, f64)> = redis::cmd("ZRANGE")
                .arg(&self.leased_key)
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
                .map_err(operation_error)?;
            result.into_iter().next().map(|(_, score)| score as i64)
        };

        Ok(JobQueueMetricsSnapshot {
            ready,
            leased,
            deadletter,
            oldest_lease_expiry_ms,
        })
    }
}

fn operation_error(err: redis::RedisError) -> JobQueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        JobQueueError::Unavailable(err.to_string())
    } else {
        JobQueueError::Operation(err.to_string())
    }
}

impl JobQueue for RedisJobQueue {
    fn enqueue(&self, job: &Job) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let payload = match Self::serialize(job) {
            Ok(payload) => payload,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let job_id = job.id.clone();
        let queued = job.status == JobStatus::Queued;
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let inserted: bool = conn
                .hset_nx(&self.jobs_key, &job_id, payload)
                .await
                .map_err(operation_error)?;
            if !inserted {
                return Err(JobQueueError::Operation(format!(
                    "job {job_id} already enqueued"
                )));
            }
            if queued {
                let _: i64 = conn
                    .rpush(&self.ready_key, &job_id)
                    .await
                    .map_err(operation_error)?;
            }
            Ok(())
        })
    }

    fn lease(&self, worker_id: &str) -> BoxFuture<'_, Result<Option<Job>, JobQueueError>> {
        let worker_id = worker_id.to_string();
        let lease_ttl_ms = ttl_ms(self.lease_ttl);
        Box::pin(async move {
            let now = now_ms();
            let mut conn = self.manager.clone();
            let claimed: Option<(String, String)> = redis::Script::new(LEASE_SCRIPT)
                .key(&self.jobs_key)
                .key(&self.ready_key)
                .key(&self.leased_key)
                .key(&self.owners_key)
                .arg(&worker_id)
                .arg(now.saturating_add(lease_ttl_ms))
                .invoke_async(&mut conn)
                .await
                .map_err(operation_error)?;
            let Some((job_id, payload)) = claimed else {
                return Ok(None);
            };

            let mut job = Self::deserialize(&payload)?;
            lease_transition(&mut job, &worker_id, now, lease_ttl_ms);
            let job = self.commit_owned(&job, &worker_id, Route::Hold).await?;
            tracing::debug!(job_id = %job_id, worker_id = %worker_id, attempts = job.attempts, "job leased");
            Ok(Some(job))
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
            let mut job = self.load_owned(&job_id, &worker_id).await?;
            running_transition(&mut job, now_ms());
            self.commit_owned(&job, &worker_id, Route::Hold).await
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
            let mut job = self.load_owned(&job_id, &worker_id).await?;
            completion_transition(&mut job, &outcome, now_ms());
            self.commit_owned(&job, &worker_id, Route::for_status(job.status))
                .await
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
            let mut job = self.load_owned(&job_id, &worker_id).await?;
            let status = failure_transition(&mut job, &failure, now_ms());
            self.commit_owned(&job, &worker_id, Route::for_status(status))
                .await
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
            let mut job = match self.load_owned(&job_id, &worker_id).await {
                Ok(job) => job,
                Err(JobQueueError::LeaseLost(_)) => return Ok(false),
                Err(err) => return Err(err),
            };
            renew_transition(&mut job, now_ms(), lease_ttl_ms);
            self.commit(&job, &worker_id, Route::Hold, None).await
        })
    }

    fn reclaim_expired(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&self.leased_key)
                .arg("-inf")
                .arg(now_ms)
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async(&mut conn)
                .await
                .map_err(operation_error)?;

            let mut reclaimed = 0;
            for job_id in expired {
                let owner: Option<String> = conn
                    .hget(&self.owners_key, &job_id)
                    .await
                    .map_err(operation_error)?;
                let payload: Option<String> = conn
                    .hget(&self.jobs_key, &job_id)
                    .await
                    .map_err(operation_error)?;

                match classify_expired(owner, payload) {
                    ExpiredLease::Orphaned => {
                        if self.drop_orphan(&job_id, now_ms).await? {
                            tracing::warn!(job_id = %job_id, "dropped orphaned lease entry");
                        }
                    }
                    ExpiredLease::Undecodable {
                        owner,
                        payload,
                        error,
                    } => {
                        let moved = self
                            .commit_payload(&job_id, &owner, &payload, Route::Deadletter, 0, Some(now_ms))
                            .await?;
                        if moved {
                            tracing::error!(job_id = %job_id, error = %error, "undecodable job moved to dead letter");
                            reclaimed += 1;
                        }
                    }
                    ExpiredLease::Live { owner, mut job } => {
                        let status = reclaim_transition(&mut job, now_ms);
                        if self
                            .commit(&job, &owner, Route::for_status(status), Some(now_ms))
                            .await?
                        {
                            tracing::warn!(job_id = %job_id, owner = %owner, status = %status, "reclaimed expired lease");
                            reclaimed += 1;
                        }
                    }
                }
            }
            Ok(reclaimed)
        })
    }

    fn get(&self, job_id: &str) -> BoxFuture<'_, Result<Option<Job>, JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            if let Some(job) = self.load(&job_id).await? {
                return Ok(Some(job));
            }
            let mut conn = self.manager.clone();
            let archived: Option<String> = conn
                .hget(&self.archive_key, &job_id)
                .await
                .map_err(operation_error)?;
            archived.map(|payload| Self::deserialize(&payload)).transpose()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_follow_job_status() {
        assert_eq!(Route::for_status(JobStatus::Running), Route::Hold);
        assert_eq!(Route::for_status(JobStatus::Queued), Route::Requeue);
        assert_eq!(Route::for_status(JobStatus::Deadletter), Route::Deadletter);
        assert_eq!(Route::for_status(JobStatus::NeedsReview), Route::Archive);
        assert_eq!(Route::for_status(JobStatus::SucceededDryRun), Route::Archive);
        assert_eq!(Route::for_status(JobStatus::Failed), Route::Archive);
    }

    #[test]
    fn expired_entry_without_owner_or_document_is_orphaned() {
        let payload = RedisJobQueue::serialize(&sample_job()).unwrap();
        assert!(matches!(
            classify_expired(None, Some(payload.clone())),
            ExpiredLease::Orphaned
        ));
        assert!(matches!(
            classify_expired(Some("w-1".into()), None),
            ExpiredLease::Orphaned
        ));
        assert!(matches!(classify_expired(None, None), ExpiredLease::Orphaned));

        match classify_expired(Some("w-1".into()), Some(payload)) {
            ExpiredLease::Live { owner, job } => {
                assert_eq!(owner, "w-1");
                assert_eq!(job.id, "job-1");
            }
            other => panic!("expected a live lease, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_document_is_routed_not_propagated() {
        match classify_expired(Some("w-1".into()), Some("{not json".into())) {
            ExpiredLease::Undecodable { owner, payload, error } => {
                assert_eq!(owner, "w-1");
                assert_eq!(payload, "{not json");
                assert!(matches!(error, JobQueueError::Serialization(_)));
            }
            other => panic!("expected an undecodable lease, got {other:?}"),
        }
    }

    fn sample_job() -> Job {
        catalog_domain::jobs::new_job(
            "job-1".into(),
            catalog_domain::ports::jobs::JobType::FamilyAudit,
            catalog_domain::ports::jobs::JobPayload::for_group(
                "squat",
                catalog_domain::ports::jobs::JobMode::DryRun,
            ),
            catalog_domain::jobs::JobDefaults::default(),
        )
    }
}
