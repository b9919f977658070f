//! Assemble registry, router, worker pool and listener from configuration.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::{Registry, WorkerPool};
use crate::runtime::{ConnectionLimiter, ConnectionSettings, Router, Server, ServerError};

/// Build the registry, loading the snapshot when `data_file` is set.
///
/// # Errors
///
/// [`ServerError::Config`] if the configuration does not validate.
pub fn build_registry(cfg: &ServerConfig) -> Result<Registry, ServerError> {
    cfg.validate().map_err(ServerError::Config)?;
    let rates = cfg.rates().map_err(ServerError::Config)?;
    Ok(match &cfg.data_file {
        Some(path) => Registry::open(path, cfg.capacity, rates),
        None => Registry::new(cfg.capacity, rates),
    })
}

/// Build the API router over `registry`.
#[must_use]
pub fn build_router(cfg: &ServerConfig, registry: Arc<Registry>) -> Router {
    let router = Router::new(registry)
        .with_default_wait(cfg.admit_wait())
        .with_max_wait(cfg.max_admit_wait());
    match &cfg.static_dir {
        Some(dir) => router.with_static_dir(dir),
        None => router,
    }
}

/// Build a bound server over an existing registry.
///
/// # Errors
///
/// Configuration, worker pool or bind failures.
pub fn build_server_with(cfg: &ServerConfig, registry: Arc<Registry>) -> Result<Server, ServerError> {
    cfg.validate().map_err(ServerError::Config)?;
    let addr = cfg.socket_addr().map_err(ServerError::Config)?;
    let pool = WorkerPool::new(cfg.pool_config())?;
    Server::bind(
        addr,
        Arc::new(build_router(cfg, registry)),
        pool,
        ConnectionLimiter::new(cfg.max_connections),
        ConnectionSettings::from_config(cfg),
    )
}

/// Build everything from `cfg` and bind the listening socket.
///
/// # Errors
///
/// Configuration, worker pool or bind failures.
pub fn build_server(cfg: &ServerConfig) -> Result<Server, ServerError> {
    let registry = Arc::new(build_registry(cfg)?);
    build_server_with(cfg, registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            capacity: 4,
            data_file: None,
            worker_count: 2,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_build_registry_in_memory() {
        let registry = build_registry(&cfg()).unwrap();
        assert_eq!(registry.capacity(), 4);
        assert!(registry.snapshot_path().is_none());
    }

    #[test]
    fn test_build_registry_rejects_invalid_config() {
        let bad = ServerConfig {
            capacity: 0,
            ..cfg()
        };
        assert!(matches!(build_registry(&bad), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_build_server_binds_ephemeral_port() {
        let server = build_server(&cfg()).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.limiter().max_connections(), 256);
    }

    #[test]
    fn test_build_server_bind_failure() {
        let first = build_server(&cfg()).unwrap();
        let taken = ServerConfig {
            port: first.local_addr().unwrap().port(),
            ..cfg()
        };
        assert!(matches!(build_server(&taken), Err(ServerError::Bind { .. })));
    }
}
