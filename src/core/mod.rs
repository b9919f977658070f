//! Core domain: occupant records, the capacity-bounded registry and the
//! worker pool that runs connection tasks.

pub mod error;
pub mod occupant;
pub mod registry;
pub mod worker_pool;

pub use error::{AppResult, RegistryError};
pub use occupant::{compute_fee, elapsed_hours, Category, OccupantRecord, RateTable};
pub use registry::{Registry, RegistryStatus};
pub use worker_pool::{PoolError, PoolStats, WorkerPool};
