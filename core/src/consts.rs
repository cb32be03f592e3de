//! On-disk names used inside a job directory.
//!
//! These are stable API: workers, managers and cleanup only ever talk to
//! each other through these files.
//!

/// Produced files, survives cleanup.
pub const JOB_OUTPUT: &str = "output";
/// Symlinks to the creator directories of each input path.
pub const JOB_INPUT: &str = "input";
/// Task log files, one per task instance.
pub const JOB_LOG: &str = "log";
/// Engine log files, one per task instance.
pub const JOB_LOG_ENGINE: &str = "engine";
/// The serialized job object (gzipped).
pub const JOB_SAVE: &str = "job.save";
/// Scratch space, may be wiped on cleanup.
pub const JOB_WORK_DIR: &str = "work";
/// Zero-byte marker once all tasks are finished.
pub const JOB_FINISHED_MARKER: &str = "finished";
/// Archive replacing everything but `output/` after cleanup.
pub const JOB_FINISHED_ARCHIVE: &str = "finished.tar.gz";
/// Textual summary of kwargs, inputs and tags.
pub const JOB_INFO: &str = "info";

/// Append-only submission ledger.
pub const ENGINE_SUBMIT: &str = "submit_log";

/// Worker heartbeat / resource usage snapshot.
pub const PLOGGING_FILE: &str = "usage";

/// Per-instance marker prefixes.
pub const STATE_FINISHED_MARKER: &str = "finished";
pub const STATE_ERROR_MARKER: &str = "error";

/// The worker subcommand of the top-level binary.
pub const CMD_WORKER: &str = "worker";
