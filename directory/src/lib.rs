//! Shard directory: the realm to shard mapping and per-realm migration state.

pub mod backup;
pub mod config;
pub mod directory;
pub mod metrics_defs;
pub mod migration;
pub mod negative_cache;
pub mod ring;
pub mod store;
pub mod types;

pub use directory::{Directory, DirectoryError, DirectorySnapshot, Resolution};
