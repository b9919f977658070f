//! # Lotwarden
//!
//! A capacity-bounded parking registry served over a small TCP/HTTP API.
//!
//! The crate is built around three concurrency-critical pieces:
//!
//! - **[`Registry`](core::Registry)**: the occupant table behind a
//!   `parking_lot::RwLock`, with blocking admission when full and a full
//!   snapshot written after every mutation
//! - **[`WorkerPool`](core::WorkerPool)**: a fixed set of OS threads pulling
//!   connection tasks from a `crossbeam-channel` queue
//! - **[`Server`](runtime::Server)**: accept loop with an in-flight connection
//!   ceiling and time-bounded request framing
//!
//! ## Registry
//!
//! ```rust
//! use std::time::Duration;
//! use lotwarden::core::{Category, RateTable, Registry, RegistryError};
//!
//! let rates = RateTable::new(10.0, 15.0).unwrap();
//! let registry = Registry::new(1, rates);
//!
//! registry.admit("X", Category::Small, Duration::ZERO).unwrap();
//! assert_eq!(
//!     registry.admit("Y", Category::Small, Duration::ZERO),
//!     Err(RegistryError::Full)
//! );
//!
//! let released = registry.release("X").unwrap();
//! assert!(!released.is_present());
//! assert_eq!(registry.occupied(), 0);
//! ```
//!
//! ## Server
//!
//! ```rust,no_run
//! use lotwarden::builders::build_server;
//! use lotwarden::config::ServerConfig;
//!
//! let cfg = ServerConfig::from_env()?;
//! let server = build_server(&cfg)?;
//! let stop = server.stop_handle();
//! ctrlc::set_handler(move || stop.stop())?;
//! server.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Occupant records, the registry, errors and the worker pool.
pub mod core;
/// Configuration models for the server and worker pool.
pub mod config;
/// Builders that wire components together from configuration.
pub mod builders;
/// Infrastructure adapters: snapshot persistence.
pub mod infra;
/// TCP listener, framing and the HTTP API.
pub mod runtime;
/// Shared utilities: clock and tracing setup.
pub mod util;
