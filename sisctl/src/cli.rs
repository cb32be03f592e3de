//! Module describing all possible commands and sub-commands of the `sis`
//! main driver.
//!
//! We have these commands:
//!
//! - `manager`
//! - `worker`
//! - `console`
//! - `cleanup`
//! - `version`
//!
//! `manager` loads the configured workflows and drives the graph; with
//! `-r` it also submits, without it the loop only updates outputs and
//! aliases.  `worker` runs one task instance inside a job directory and
//! is not called by users directly.  `console` prints a verbose state
//! listing.  `cleanup` archives finished jobs and applies the keep-value
//! policy.
//!

use std::path::PathBuf;

use clap::{crate_authors, crate_description, crate_name, crate_version, Parser};

use sisyphus_core::TaskId;
use sisyphus_engines::CleanupMode;

/// CLI options
#[derive(Parser)]
#[command(disable_version_flag = true)]
#[clap(name = crate_name!(), about = crate_description!())]
#[clap(version = crate_version!(), author = crate_authors!())]
pub struct Opts {
    /// settings file.
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,
    /// Verbose mode.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Sub-commands (see below).
    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

// ------

/// All sub-commands:
///
/// `manager [-r] [-co] [-io] [-i] [CONFIGS…]`
/// `worker JOBDIR TASK_NAME [TASK_ID] [--engine NAME]`
/// `console [CONFIGS…]`
/// `cleanup [--keep-value K] [--unused] [--mode MODE] [CONFIGS…]`
///
#[derive(Debug, Parser)]
pub enum SubCommand {
    /// Run the manager loop over the configured workflows
    #[clap(alias = "m")]
    Manager(ManagerOpts),
    /// Run a single task instance (internal usage)
    Worker(WorkerOpts),
    /// Print a verbose state listing and exit
    #[clap(alias = "c")]
    Console(ConsoleOpts),
    /// Archive finished jobs, sweep unused directories
    Cleanup(CleanupOpts),
    /// List all package versions
    Version,
}

// ------

#[derive(Debug, Parser)]
pub struct ManagerOpts {
    /// Start the operation, without it only outputs and aliases update
    #[clap(short = 'r')]
    pub run: bool,
    /// Clear jobs in error state once at startup
    #[clap(long = "co")]
    pub clear_errors_once: bool,
    /// Clear jobs in error or interrupted state once at startup
    #[clap(long = "cio")]
    pub clear_interrupts_once: bool,
    /// Ignore error states once and keep going
    #[clap(long = "io")]
    pub ignore_once: bool,
    /// Ask before each per-job action (Yes/skip/never)
    #[clap(short = 'i', long)]
    pub interactive: bool,
    /// Workflow configuration files
    pub configs: Vec<PathBuf>,
}

// ------

#[derive(Debug, Parser)]
pub struct WorkerOpts {
    /// Job directory the task runs in
    pub jobdir: PathBuf,
    /// Name of the task to run
    pub task_name: String,
    /// Task instance id; recovered from the engine environment if absent
    pub task_id: Option<TaskId>,
    /// Engine selector this worker was submitted through
    #[clap(long, default_value = "short")]
    pub engine: String,
    /// Re-execute with output redirected to the instance log
    #[clap(long)]
    pub redirect_output: bool,
    /// Run the resume function instead of start
    #[clap(long)]
    pub force_resume: bool,
}

// ------

#[derive(Debug, Parser)]
pub struct ConsoleOpts {
    /// Workflow configuration files
    pub configs: Vec<PathBuf>,
}

// ------

#[derive(Debug, Parser)]
pub struct CleanupOpts {
    /// Remove finished jobs below this keep value
    #[clap(long)]
    pub keep_value: Option<u8>,
    /// Sweep work directories not referenced by the graph
    #[clap(long)]
    pub unused: bool,
    /// What to do with affected directories
    #[clap(long, default_value = "dryrun")]
    pub mode: CleanupMode,
    /// Skip the confirmation prompt
    #[clap(long)]
    pub force: bool,
    /// Workflow configuration files
    pub configs: Vec<PathBuf>,
}
