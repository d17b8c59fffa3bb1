use std::time::Duration;

use catalog_domain::error::DomainError;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }
}

/// Opens a signed-in websocket session scoped to the configured namespace and database.
pub async fn connect(config: &DbConfig) -> anyhow::Result<Surreal<Client>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(&config.endpoint).await?;
    db.signin(Root {
        username: config.username.clone(),
        password: config.password.clone(),
    })
    .await?;
    db.use_ns(&config.namespace).use_db(&config.database).await?;
    tracing::info!(
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        database = %config.database,
        "surreal session established"
    );
    Ok(db)
}

/// TCP reachability probe run before a worker commits to a bounded run.
pub async fn health_check(config: &DbConfig) -> Result<(), DomainError> {
    let address = parse_socket_address(&config.endpoint)?;
    let connect = timeout(Duration::from_secs(2), TcpStream::connect(address))
        .await
        .map_err(|_| DomainError::Unavailable("surreal endpoint connect timed out".to_string()))?;
    connect.map_err(|err| {
        DomainError::Unavailable(format!("surreal endpoint connect failed: {err}"))
    })?;

    tracing::debug!(
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        database = %config.database,
        "surreal health check succeeded"
    );
    Ok(())
}

fn parse_socket_address(endpoint: &str) -> Result<String, DomainError> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized).map_err(|err| {
        DomainError::Unavailable(format!("invalid surreal endpoint '{endpoint}': {err}"))
    })?;

    let scheme = parsed.scheme();
    let host = parsed.host_str().ok_or_else(|| {
        DomainError::Unavailable(format!("missing surreal host in endpoint '{endpoint}'"))
    })?;
    let port = parsed.port_or_known_default().unwrap_or(match scheme {
        "wss" | "https" => 443,
        _ => 8000,
    });
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_to_websocket_port() {
        assert_eq!(parse_socket_address("127.0.0.1:8000").unwrap(), "127.0.0.1:8000");
        assert_eq!(parse_socket_address("ws://db.internal").unwrap(), "db.internal:80");
        assert_eq!(parse_socket_address("wss://db.internal").unwrap(), "db.internal:443");
        assert!(parse_socket_address("ws://").is_err());
    }
}
