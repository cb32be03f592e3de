//! Core of the Sisyphus workflow manager.
//!
//! Three tightly coupled pieces live here: the hash-addressed job graph
//! (identity, deduplication, dependency resolution, content-addressed
//! directories), the state model the scheduler computes over it, and the
//! engine contract every execution backend implements.
//!

pub use consts::*;
pub use delayed::{py_str, render_template, Delayed};
pub use engine::{get_rqmt, submit_task, Engine, EngineState, SubmitResult, TaskState};
pub use error::*;
pub use graph::{SisGraph, StatusMap};
pub use hash::{short_hash, short_hash_of_bytes, sis_hash, DEFAULT_HASH_LENGTH, HASH_CHARS};
pub use job::{job_dir_finished, Job, Recipe};
pub use literal::{parse_literal, repr_value};
pub use paths::{
    enable_file_caching, enter_worker_context, in_worker, set_file_caching,
    set_strict_worker_check, Creator, PathKind, SisPath,
};
pub use rqmt::{update_engine_rqmt, ResourceSample, Rqmt, Usage};
pub use session::{job_digest, Session};
pub use target::Target;
pub use task::{Task, TaskId};
pub use value::{Kwargs, PathRepr, Value, ValueRepr, VariableRepr};

mod consts;
mod delayed;
mod engine;
mod error;
mod graph;
mod hash;
mod job;
mod literal;
mod paths;
mod rqmt;
mod session;
mod target;
mod task;
#[cfg(test)]
mod testutil;
mod value;

/// Crate name/version pair, for the version banner.
///
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
