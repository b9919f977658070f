//! `lotwarden` binary: resolve configuration, bind, serve until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use lotwarden::builders::build_server;
use lotwarden::config::ServerConfig;
use lotwarden::core::AppResult;
use lotwarden::util::init_tracing;

/// Parking registry server
#[derive(Parser, Debug)]
#[command(name = "lotwarden", version, long_about = None)]
struct Args {
    /// Listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of parking slots
    #[arg(short, long)]
    capacity: Option<usize>,

    /// Hourly rate for small vehicles
    #[arg(long)]
    small_rate: Option<f64>,

    /// Hourly rate for large vehicles
    #[arg(long)]
    large_rate: Option<f64>,

    /// Snapshot file (empty string disables persistence)
    #[arg(long)]
    data_file: Option<String>,

    /// Directory served for non-API paths
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Worker threads handling connections
    #[arg(short, long)]
    workers: Option<usize>,

    /// In-flight connections before new ones get 503
    #[arg(long)]
    max_connections: Option<usize>,

    /// JSON configuration file, used instead of LOTWARDEN_* variables
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(self, mut cfg: ServerConfig) -> ServerConfig {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(capacity) = self.capacity {
            cfg.capacity = capacity;
        }
        if let Some(rate) = self.small_rate {
            cfg.small_rate = rate;
        }
        if let Some(rate) = self.large_rate {
            cfg.large_rate = rate;
        }
        if let Some(path) = self.data_file {
            cfg.data_file = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(dir) = self.static_dir {
            cfg.static_dir = Some(dir);
        }
        if let Some(workers) = self.workers {
            cfg.worker_count = workers;
        }
        if let Some(max) = self.max_connections {
            cfg.max_connections = max;
        }
        cfg
    }
}

fn resolve_config(mut args: Args) -> AppResult<ServerConfig> {
    let base = match args.config.take() {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            ServerConfig::from_json_str(&text).map_err(anyhow::Error::msg)?
        }
        None => ServerConfig::from_env().map_err(anyhow::Error::msg)?,
    };
    let cfg = args.apply(base);
    cfg.validate().map_err(anyhow::Error::msg)?;
    Ok(cfg)
}

fn run(args: Args) -> AppResult<()> {
    let cfg = resolve_config(args).context("invalid configuration")?;
    let server = build_server(&cfg).context("server startup failed")?;

    let stop = server.stop_handle();
    ctrlc::set_handler(move || stop.stop()).context("installing Ctrl-C handler")?;

    info!(
        addr = %server.local_addr()?,
        capacity = cfg.capacity,
        small_rate = cfg.small_rate,
        large_rate = cfg.large_rate,
        "lotwarden ready"
    );
    server.run()?;
    Ok(())
}

fn main() -> ExitCode {
    init_tracing("info");
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Fatal");
            eprintln!("lotwarden: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_base_config() {
        let args = Args::parse_from([
            "lotwarden",
            "--port",
            "9000",
            "--capacity",
            "7",
            "--small-rate",
            "3.5",
            "--data-file",
            "",
        ]);
        let cfg = args.apply(ServerConfig::default());
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.capacity, 7);
        assert!((cfg.small_rate - 3.5).abs() < f64::EPSILON);
        assert!((cfg.large_rate - 8.0).abs() < f64::EPSILON);
        assert_eq!(cfg.data_file, None);
    }

    #[test]
    fn test_config_file_then_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lot.json");
        std::fs::write(&path, r#"{"capacity": 3, "port": 7000}"#).unwrap();
        let args = Args::parse_from([
            "lotwarden",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7001",
        ]);
        let cfg = resolve_config(args).unwrap();
        assert_eq!(cfg.capacity, 3);
        assert_eq!(cfg.port, 7001);
    }

    #[test]
    fn test_invalid_cli_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lot.json");
        std::fs::write(&path, r#"{"capacity": 3}"#).unwrap();
        let args = Args::parse_from([
            "lotwarden",
            "--config",
            path.to_str().unwrap(),
            "--capacity",
            "0",
        ]);
        let err = resolve_config(args).unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }
}
