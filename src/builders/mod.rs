//! Builders that wire the server together from [`ServerConfig`](crate::config::ServerConfig).

pub mod server_builder;

pub use server_builder::{build_registry, build_router, build_server, build_server_with};
