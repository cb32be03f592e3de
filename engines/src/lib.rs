//! Execution engines and the manager side of Sisyphus.
//!
//! The local pool and the cluster adapters implement the core engine
//! contract; on top of them sit the manager loop, the worker entry
//! point and the cleanup operations.
//!

pub use cleaner::{
    cleanup_jobs, cleanup_keep_value, cleanup_unused, extract_keep_values,
    find_too_low_keep_value, list_all_graph_directories, remove_directories, search_for_unused,
    CleanupMode, DirStatus,
};
pub use cluster::{AwsBatchEngine, GridEngine, LsfEngine, PbsEngine, SlurmEngine};
pub use local::LocalEngine;
pub use manager::{create_aliases, JobCleaner, Manager};
pub use selector::EngineSelector;
pub use worker::{run_worker, UsageLogger, WorkerArgs};

mod cleaner;
pub mod cluster;
mod local;
mod manager;
mod selector;
mod worker;

/// Crate name/version pair, for the version banner.
///
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
