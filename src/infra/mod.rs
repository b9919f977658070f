//! Infrastructure adapters: on-disk persistence of registry state.

pub mod snapshot;

pub use snapshot::{SnapshotError, SnapshotImage};
