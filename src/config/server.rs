//! Server configuration: defaults, `.env`/environment overrides, JSON.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::WorkerPoolConfig;
use crate::core::RateTable;
use crate::runtime::FrameLimits;

/// Prefix for every environment variable read by [`ServerConfig::from_env`].
pub const ENV_PREFIX: &str = "LOTWARDEN_";

/// Everything needed to start a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Listening port; 0 picks an ephemeral port.
    pub port: u16,
    /// Number of slots.
    pub capacity: usize,
    /// Hourly rate for small vehicles.
    pub small_rate: f64,
    /// Hourly rate for large vehicles.
    pub large_rate: f64,
    /// Snapshot file; `None` keeps state in memory only.
    pub data_file: Option<PathBuf>,
    /// Directory served for non-API paths.
    pub static_dir: Option<PathBuf>,
    /// Worker threads handling connections.
    pub worker_count: usize,
    /// Admission ceiling: connections in flight before new ones get 503.
    pub max_connections: usize,
    /// Timeout for each individual read on a connection.
    pub read_timeout_ms: u64,
    /// Timeout for writing a response.
    pub write_timeout_ms: u64,
    /// Budget for reading one whole request.
    pub request_timeout_ms: u64,
    /// Largest accepted header block, terminator included.
    pub max_header_bytes: usize,
    /// Largest accepted `Content-Length`.
    pub max_body_bytes: usize,
    /// How often the accept loop checks for a stop request.
    pub accept_poll_ms: u64,
    /// Default blocking-admit timeout when the request does not give one.
    pub admit_wait_ms: u64,
    /// Cap on any blocking-admit timeout, including a client `waitMs`.
    pub max_admit_wait_ms: u64,
    /// Enable TCP keepalive on accepted connections.
    pub tcp_keepalive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            capacity: 100,
            small_rate: 5.0,
            large_rate: 8.0,
            data_file: Some(PathBuf::from("parking_data.dat")),
            static_dir: None,
            worker_count: num_cpus::get(),
            max_connections: 256,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
            max_header_bytes: 8 * 1024,
            max_body_bytes: 64 * 1024,
            accept_poll_ms: 100,
            admit_wait_ms: 0,
            max_admit_wait_ms: 10_000,
            tcp_keepalive: true,
        }
    }
}

impl ServerConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".into());
        }
        self.rates()?;
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".into());
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err("timeouts must be greater than 0".into());
        }
        if self.max_header_bytes < 16 {
            return Err("max_header_bytes must be at least 16".into());
        }
        if self.accept_poll_ms == 0 {
            return Err("accept_poll_ms must be greater than 0".into());
        }
        if self.admit_wait_ms > self.max_admit_wait_ms {
            return Err("admit_wait_ms must not exceed max_admit_wait_ms".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `LOTWARDEN_*` variables, after loading `.env`
    /// if one exists.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `LOTWARDEN_<FIELD>` name. Not validated.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let var = |field: &str| lookup(&format!("{ENV_PREFIX}{field}"));

        if let Some(v) = var("HOST") {
            cfg.host = v;
        }
        override_parsed(&var, "PORT", &mut cfg.port)?;
        override_parsed(&var, "CAPACITY", &mut cfg.capacity)?;
        override_parsed(&var, "SMALL_RATE", &mut cfg.small_rate)?;
        override_parsed(&var, "LARGE_RATE", &mut cfg.large_rate)?;
        if let Some(v) = var("DATA_FILE") {
            cfg.data_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("STATIC_DIR") {
            cfg.static_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        override_parsed(&var, "WORKER_COUNT", &mut cfg.worker_count)?;
        override_parsed(&var, "MAX_CONNECTIONS", &mut cfg.max_connections)?;
        override_parsed(&var, "READ_TIMEOUT_MS", &mut cfg.read_timeout_ms)?;
        override_parsed(&var, "WRITE_TIMEOUT_MS", &mut cfg.write_timeout_ms)?;
        override_parsed(&var, "REQUEST_TIMEOUT_MS", &mut cfg.request_timeout_ms)?;
        override_parsed(&var, "MAX_HEADER_BYTES", &mut cfg.max_header_bytes)?;
        override_parsed(&var, "MAX_BODY_BYTES", &mut cfg.max_body_bytes)?;
        override_parsed(&var, "ACCEPT_POLL_MS", &mut cfg.accept_poll_ms)?;
        override_parsed(&var, "ADMIT_WAIT_MS", &mut cfg.admit_wait_ms)?;
        override_parsed(&var, "MAX_ADMIT_WAIT_MS", &mut cfg.max_admit_wait_ms)?;
        override_parsed(&var, "TCP_KEEPALIVE", &mut cfg.tcp_keepalive)?;
        Ok(cfg)
    }

    /// Rate table built from `small_rate` and `large_rate`.
    ///
    /// # Errors
    ///
    /// Fails unless both rates are positive.
    pub fn rates(&self) -> Result<RateTable, String> {
        RateTable::new(self.small_rate, self.large_rate)
            .ok_or_else(|| "small_rate and large_rate must be positive".into())
    }

    /// Worker pool settings derived from this configuration.
    #[must_use]
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_worker_count(self.worker_count)
            .with_thread_name_prefix("lw-conn")
    }

    /// Framing bounds derived from this configuration.
    #[must_use]
    pub const fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Per-read socket timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Per-write socket timeout.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Accept loop poll interval.
    #[must_use]
    pub const fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    /// Default blocking-admit timeout.
    #[must_use]
    pub const fn admit_wait(&self) -> Duration {
        Duration::from_millis(self.admit_wait_ms)
    }

    /// Longest blocking-admit timeout the server honours.
    #[must_use]
    pub const fn max_admit_wait(&self) -> Duration {
        Duration::from_millis(self.max_admit_wait_ms)
    }

    /// `host:port` as a socket address.
    ///
    /// # Errors
    ///
    /// Fails if `host` is not an IP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("invalid listen address {}:{}: {e}", self.host, self.port))
    }
}

fn override_parsed<T, V>(var: &V, field: &str, slot: &mut T) -> Result<(), String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(field) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| format!("{ENV_PREFIX}{field}={raw}: {e}"))?;
    }
    Ok(())
}
