//! Configuration models for the server and its worker pool.

pub mod pool;
pub mod server;

pub use pool::WorkerPoolConfig;
pub use server::ServerConfig;
