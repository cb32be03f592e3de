//! The engine contract: what the scheduler expects from any backend.
//!
//! Engines receive batches of task instances with identical requirements
//! and answer coarse state queries; everything else (markers, retries,
//! escalation) stays with the manager and the on-disk protocol.
//!

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value as Json;
use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::rqmt::Rqmt;
use crate::task::{Task, TaskId};

/// What a backend can say about one task instance.
///
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum EngineState {
    Queue,
    Running,
    QueueError,
    Unknown,
}

/// Full per-task state as seen by the manager.  Declaration order is the
/// "worst first" priority used when folding instances.
///
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Error,
    QueueError,
    RetryError,
    InputMissing,
    Interrupted,
    Unknown,
    Waiting,
    Runnable,
    Queue,
    Running,
    Finished,
    InputPath,
}

impl TaskState {
    /// States the manager can still act on.
    pub fn actionable(&self) -> bool {
        matches!(
            self,
            TaskState::Runnable
                | TaskState::Running
                | TaskState::Queue
                | TaskState::Unknown
                | TaskState::Interrupted
        )
    }
}

/// What one `submit_call` returns: the engine's name plus an opaque
/// backend handle, both recorded in the submit log.
///
#[derive(Clone, Debug)]
pub struct SubmitResult {
    pub engine_name: String,
    pub engine_info: Json,
}

/// A uniform backend for task execution.
///
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    fn start_engine(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop_engine(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Invalidate any cached queue listing.
    fn reset_cache(&self) {}

    /// Baseline requirements overlaid under every task's own.
    fn get_default_rqmt(&self, task: &Task) -> Rqmt;

    /// Look the instance up in the backend's queue; `Unknown` if absent.
    fn task_state(&self, task: &Task, task_id: TaskId) -> EngineState;

    /// Submit a batch of instances sharing one requirement table.
    fn submit_call(
        &self,
        call: &[String],
        logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        task_name: &str,
        task_ids: &[TaskId],
    ) -> Result<SubmitResult, EngineError>;

    /// Recover the task id from the backend environment when the worker
    /// was started without one.
    fn get_task_id(&self, passed: Option<TaskId>) -> TaskId {
        passed.unwrap_or(1)
    }

    /// One-time worker-side setup, e.g. linking engine logs into place.
    fn init_worker(&self, _task: &Task) -> Result<(), EngineError> {
        Ok(())
    }

    /// Resolve a named sub-engine; only selectors have any.
    fn sub_engine(&self, _name: &str) -> Option<&dyn Engine> {
        None
    }
}

/// The effective requirements for one instance: engine defaults under
/// the declared table, escalated along the submit history, normalised
/// and clamped.
///
pub fn get_rqmt(engine: &dyn Engine, task: &Task, task_id: TaskId, update: bool) -> Rqmt {
    let declared = task.declared_rqmt();
    let mut rqmt = engine.get_default_rqmt(task);
    rqmt.update(&declared);

    let history = task.submit_history();
    if let Some(hist) = history.get(&task_id) {
        // the recipe's request did not change since the first submit, so
        // continue from wherever escalation left off
        if hist.first().map(|h| same_initial(h, &rqmt)).unwrap_or(false) {
            if let Some(last) = hist.last() {
                rqmt.update(last);
            }
            if update {
                rqmt = task.update_rqmt(&rqmt, task_id);
            }
        }
    }

    let _ = rqmt.normalize();
    rqmt.check_engine_limits();
    rqmt
}

fn same_initial(recorded: &Rqmt, current: &Rqmt) -> bool {
    let mut a = recorded.clone();
    let mut b = current.clone();
    let _ = a.normalize();
    let _ = b.normalize();
    a == b
}

/// Manager-side submission: compute effective requirements for every
/// submittable instance, bucket ids with equal tables into one call per
/// bucket, and append each batch to the job's submit ledger.
///
#[tracing::instrument(skip(engine, task), fields(task = %task.task_name()))]
pub fn submit_task(engine: &dyn Engine, task: &Arc<Task>) -> Result<(), EngineError> {
    let call = task.worker_call(None);
    let logpath = task.engine_log_dir();

    let task_ids: Vec<TaskId> = task
        .task_ids()
        .into_iter()
        .filter(|id| {
            matches!(
                task.state(Some(engine), Some(*id), true),
                TaskState::Runnable | TaskState::Interrupted
            )
        })
        .collect();

    // bucket ids by effective requirements
    let mut buckets: Vec<(Rqmt, Vec<TaskId>)> = Vec::new();
    for id in task_ids {
        let rqmt = get_rqmt(engine, task, id, true);
        match buckets.iter_mut().find(|(r, _)| r.bucket_key() == rqmt.bucket_key()) {
            Some((_, ids)) => ids.push(id),
            None => buckets.push((rqmt, vec![id])),
        }
    }

    let submit_log = task.submit_log_path();
    for (rqmt, ids) in buckets {
        info!("submit to queue: {} {} {:?}", task.job_for_engine().id(), task.name(), ids);
        let result =
            engine.submit_call(&call, &logpath, &rqmt, &task.task_name(), task.name(), &ids)?;
        debug!("command: ({}) task ids: ({ids:?})", call.join(" "));
        debug!("requirements: {rqmt:?}");

        let mut record = rqmt.clone();
        record.set("engine_name", result.engine_name.as_str());
        record.set("engine_info", result.engine_info.clone());
        let line = serde_json::to_string(&(ids, record))
            .map_err(|e| EngineError::SubmitFailed { cmd: call.join(" "), reason: e.to_string() })?;
        let mut f = OpenOptions::new().create(true).append(true).open(&submit_log)?;
        writeln!(f, "{line}")?;
    }

    task.reset_cache();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_priority_order() {
        assert!(TaskState::Error < TaskState::QueueError);
        assert!(TaskState::QueueError < TaskState::Interrupted);
        assert!(TaskState::Runnable < TaskState::Queue);
        assert!(TaskState::Running < TaskState::Finished);
    }

    #[test]
    fn test_state_rendering() {
        assert_eq!("queue_error", TaskState::QueueError.to_string());
        assert_eq!("retry_error", TaskState::RetryError.to_string());
        assert_eq!("input_missing", TaskState::InputMissing.to_string());
    }

    #[test]
    fn test_actionable() {
        assert!(TaskState::Runnable.actionable());
        assert!(TaskState::Interrupted.actionable());
        assert!(!TaskState::Error.actionable());
        assert!(!TaskState::Finished.actionable());
    }
}
