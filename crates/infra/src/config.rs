use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub redis_url: String,
    pub worker_queue_prefix: String,
    pub worker_lock_prefix: String,
    pub worker_idempotency_prefix: String,
    pub worker_id: String,
    pub worker_max_jobs_per_run: usize,
    pub worker_max_runtime_secs: u64,
    pub worker_safety_margin_secs: u64,
    pub worker_heartbeat_interval_secs: u64,
    pub worker_lease_ttl_secs: u64,
    pub worker_lock_ttl_secs: u64,
    pub worker_queue_retry_attempts: u32,
    pub worker_backoff_base_ms: u64,
    pub worker_backoff_max_ms: u64,
    pub worker_enqueue_follow_ups: bool,
    pub worker_max_attempts: u32,
    pub catalog_apply_enabled: bool,
    pub catalog_verify_after_apply: bool,
    pub idempotency_in_progress_ttl_secs: u64,
    pub idempotency_completed_ttl_secs: u64,
    pub scan_group_limit: usize,
    pub metrics_enabled: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "catalog")?
            .set_default("surreal_db", "curation")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("worker_queue_prefix", "catalog:jobs")?
            .set_default("worker_lock_prefix", "catalog:locks")?
            .set_default("worker_idempotency_prefix", "catalog:idem")?
            .set_default("worker_id", "")?
            .set_default("worker_max_jobs_per_run", 10)?
            .set_default("worker_max_runtime_secs", 540)?
            .set_default("worker_safety_margin_secs", 30)?
            .set_default("worker_heartbeat_interval_secs", 20)?
            .set_default("worker_lease_ttl_secs", 120)?
            .set_default("worker_lock_ttl_secs", 120)?
            .set_default("worker_queue_retry_attempts", 3)?
            .set_default("worker_backoff_base_ms", 250)?
            .set_default("worker_backoff_max_ms", 5000)?
            .set_default("worker_enqueue_follow_ups", true)?
            .set_default("worker_max_attempts", 5)?
            .set_default("catalog_apply_enabled", false)?
            .set_default("catalog_verify_after_apply", true)?
            .set_default("idempotency_in_progress_ttl_secs", 300)?
            .set_default("idempotency_completed_ttl_secs", 0)?
            .set_default("scan_group_limit", 25)?
            .set_default("metrics_enabled", true)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_surreal(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("surreal")
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.worker_max_runtime_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.worker_safety_margin_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_interval_secs.max(1))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_lease_ttl_secs.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_lock_ttl_secs.max(1))
    }

    pub fn idempotency_in_progress_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_in_progress_ttl_secs)
    }

    /// Zero keeps completed keys forever.
    pub fn idempotency_completed_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_completed_ttl_secs)
    }

    /// Configured id, or a host-scoped random one when left blank.
    pub fn resolved_worker_id(&self) -> String {
        let configured = self.worker_id.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        format!("{host}-{}", catalog_domain::util::uuid_v7_without_dashes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_worker_id_is_generated_per_process() {
        let mut config = AppConfig::load().unwrap();
        config.app_env = "Production".into();
        config.data_backend = "Surreal".into();
        config.worker_id = "  ".into();
        assert!(config.is_production());
        assert!(config.uses_surreal());
        assert_ne!(config.resolved_worker_id(), config.resolved_worker_id());

        config.worker_id = " worker-7 ".into();
        assert_eq!(config.resolved_worker_id(), "worker-7");
    }

    #[test]
    fn ttl_helpers_never_return_zero_intervals() {
        let mut config = AppConfig::load().unwrap();
        config.worker_heartbeat_interval_secs = 0;
        config.worker_lease_ttl_secs = 0;
        config.idempotency_completed_ttl_secs = 0;
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.lease_ttl(), Duration::from_secs(1));
        assert_eq!(config.idempotency_completed_ttl(), Duration::ZERO);
    }
}
