use crate::config::AppConfig;
use anyhow::{Result, anyhow};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt};

pub const SERVICE_NAME: &str = "catalog-worker";

/// Client crates that log every round trip at debug.
const QUIET_TARGETS: &[&str] = &["surrealdb", "tungstenite", "redis", "hyper"];

/// The configured level plus `warn` caps for chatty client crates, unless the
/// level already names them.
pub fn filter_directives(log_level: &str) -> String {
    let level = log_level.trim();
    let level = if level.is_empty() { "info" } else { level };
    let mut directives = vec![level.to_string()];
    for target in QUIET_TARGETS {
        if !level.contains(target) {
            directives.push(format!("{target}=warn"));
        }
    }
    directives.join(",")
}

pub fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_new(filter_directives(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.is_production() {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    installed.map_err(|err| anyhow!("tracing subscriber already installed: {err}"))
}

/// Root span for one bounded worker run; every event of the run carries its fields.
pub fn run_span(config: &AppConfig, worker_id: &str, run_id: &str) -> Span {
    tracing::info_span!(
        "worker_run",
        service = SERVICE_NAME,
        env = %config.app_env,
        backend = %config.data_backend,
        worker_id = %worker_id,
        run_id = %run_id,
    )
}
