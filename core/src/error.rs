use std::path::PathBuf;

use thiserror::Error;

/// Job construction and lifecycle errors.
///
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no recipe registered under {0}")]
    UnknownRecipe(String),
    #[error("invalid kwargs for {recipe}: {reason}")]
    BadKwargs { recipe: String, reason: String },
    #[error("invalid alias character in {0}")]
    BadAlias(String),
    #[error("keep value out of range: {0}")]
    BadKeepValue(i64),
    #[error("output declared twice: {0}")]
    DuplicateOutput(String),
    #[error("job {id}: failed to set up directory: {source}")]
    Setup {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("can not load {0}: {1}")]
    Load(PathBuf, String),
    #[error("job has no tasks defined: {0}")]
    NoTasks(String),
    #[error("only runnable jobs can list their tasks: {0}")]
    NotRunnable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Task execution errors, as seen by the worker.
///
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no task named {wanted}, job has: {available:?}")]
    NoSuchTask { wanted: String, available: Vec<String> },
    #[error("subprocess exited with code {code}")]
    Exit { code: i32 },
    #[error("task failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Delayed(#[from] DelayedError),
}

impl TaskError {
    /// True for the SIGKILL/OOM signature of a spawned subprocess.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, TaskError::Exit { code: 137 })
    }
}

/// Engine and submission errors.
///
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown engine selector: {0}")]
    UnknownSelector(String),
    #[error("submit command failed: {cmd}: {reason}")]
    SubmitFailed { cmd: String, reason: String },
    #[error("{backend} does not support multi-node jobs")]
    MultiNodeUnsupported { backend: &'static str },
    #[error("backend call timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Reading a variable that has not been written yet.
///
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("variable is not set: {0}")]
    NotSet(PathBuf),
    #[error("variable may only be read inside a worker: {0}")]
    NotInWorker(PathBuf),
    #[error("can not decode variable {0}: {1}")]
    Decode(PathBuf, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Evaluating a delayed expression.
///
#[derive(Debug, Error)]
pub enum DelayedError {
    #[error("unsupported operand types for {op}: {lhs} and {rhs}")]
    BadOperands { op: &'static str, lhs: &'static str, rhs: &'static str },
    #[error("bad format spec: {0}")]
    BadFormat(String),
    #[error("index {0} out of range")]
    IndexOutOfRange(i64),
    #[error(transparent)]
    Variable(#[from] VariableError),
}
