use std::sync::Arc;
use std::time::Duration;

use catalog_domain::ports::jobs::JobQueue;
use catalog_domain::ports::lock::{LockHandle, ResourceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::Instrument;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub ticks: u64,
    pub lease_failures: u64,
    pub lock_failures: u64,
}

/// Renews a job lease, and the group lock when one is held, until stopped.
pub struct Heartbeat {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<HeartbeatReport>,
}

pub struct HeartbeatTarget {
    pub job_id: String,
    pub worker_id: String,
    pub lock: Option<LockHandle>,
}

impl Heartbeat {
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        locks: Arc<dyn ResourceLock>,
        target: HeartbeatTarget,
        every: Duration,
        lock_ttl: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut report = HeartbeatReport::default();
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the lease was just taken.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                report.ticks += 1;

                match queue.renew_lease(&target.job_id, &target.worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        report.lease_failures += 1;
                        tracing::warn!(job_id = %target.job_id, "job lease no longer held");
                    }
                    Err(err) => {
                        report.lease_failures += 1;
                        tracing::warn!(job_id = %target.job_id, error = %err, "lease renewal failed");
                    }
                }

                if let Some(handle) = &target.lock {
                    match locks.renew(handle, lock_ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            report.lock_failures += 1;
                            tracing::warn!(resource = %handle.resource, "group lock no longer held");
                        }
                        Err(err) => {
                            report.lock_failures += 1;
                            tracing::warn!(
                                resource = %handle.resource,
                                error = %err,
                                "lock renewal failed"
                            );
                        }
                    }
                }
            }
            report
        }
        .in_current_span());
        Self { stop_tx, handle }
    }

    /// Signals the task and waits for it, so no renewal is in flight afterwards.
    pub async fn stop(self) -> HeartbeatReport {
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "heartbeat task aborted");
                HeartbeatReport::default()
            }
        }
    }
}
