//! Tasks: the executable phases of a job.
//!
//! A task fans out into instances `1..=parallel`; each instance owns its
//! own markers, log and usage snapshot.  State classification combines
//! the on-disk markers with whatever the engine reports.
//!

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::consts::*;
use crate::engine::{Engine, EngineState, TaskState};
use crate::job::Job;
use crate::rqmt::{update_engine_rqmt, Rqmt, Usage};
use crate::value::Value;

pub type TaskId = u32;

/// How long a cached state answer stays valid.
const STATE_CACHE_SECS: u64 = 10;

type UpdateRqmtFn = fn(&Rqmt, &Usage) -> Rqmt;

#[derive(Default)]
struct Caches {
    state: HashMap<Option<TaskId>, (Instant, TaskState)>,
    last_state: Option<TaskState>,
    submit_history: Option<(SystemTime, HashMap<TaskId, Vec<Rqmt>>)>,
}

/// One executable phase of a job.
///
pub struct Task {
    start: String,
    resume: Option<String>,
    rqmt: Rqmt,
    /// One element per task instance argument; lists unpack into
    /// multiple call arguments.
    args: Vec<Value>,
    parallel: usize,
    mini: bool,
    tries: usize,
    continuable: bool,
    update_rqmt_fn: Option<UpdateRqmtFn>,

    job: OnceLock<Weak<Job>>,
    caches: Mutex<Caches>,
}

impl Task {
    pub fn new(start: &str) -> Task {
        Task {
            start: start.to_string(),
            resume: None,
            rqmt: Rqmt::new(),
            args: vec![Value::List(vec![])],
            parallel: 0,
            mini: false,
            tries: 1,
            continuable: false,
            update_rqmt_fn: None,
            job: OnceLock::new(),
            caches: Mutex::new(Caches::default()),
        }
    }

    /// Function to call on resume; without one the task is not
    /// resumable after an interruption.
    pub fn resume(mut self, name: &str) -> Task {
        self.resume = Some(name.to_string());
        self
    }

    pub fn rqmt(mut self, rqmt: Rqmt) -> Task {
        self.rqmt = rqmt;
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Task {
        if !args.is_empty() {
            self.args = args;
        }
        self
    }

    /// Cap the number of task instances; arguments spread over them by
    /// balanced chunking.
    pub fn parallel(mut self, parallel: usize) -> Task {
        self.parallel = parallel;
        self
    }

    /// Route to the "short" engine.
    pub fn mini(mut self) -> Task {
        self.mini = true;
        self.rqmt.set("engine", "short");
        self
    }

    pub fn tries(mut self, tries: usize) -> Task {
        self.tries = tries.max(1);
        self
    }

    /// Never writes a finish marker; the task can be continued forever.
    pub fn continuable(mut self) -> Task {
        self.continuable = true;
        self
    }

    pub fn update_rqmt_with(mut self, f: UpdateRqmtFn) -> Task {
        self.update_rqmt_fn = Some(f);
        self
    }

    pub(crate) fn set_job(&mut self, job: Weak<Job>) {
        let _ = self.job.set(job);
    }

    fn job(&self) -> std::sync::Arc<Job> {
        self.job
            .get()
            .and_then(|w| w.upgrade())
            .expect("task used before it was attached to a job")
    }

    // ----- identity

    pub fn name(&self) -> &str {
        &self.start
    }

    pub fn resume_name(&self) -> Option<&str> {
        self.resume.as_deref()
    }

    pub fn resumable(&self) -> bool {
        self.resume.is_some()
    }

    pub fn is_mini(&self) -> bool {
        self.mini
    }

    pub fn is_continuable(&self) -> bool {
        self.continuable
    }

    pub fn tries_allowed(&self) -> usize {
        self.tries
    }

    /// `<job id>.<task name>`, the name the engine sees.
    pub fn task_name(&self) -> String {
        format!("{}.{}", self.job().id(), self.start)
    }

    /// Declared requirements, units normalised.
    pub fn declared_rqmt(&self) -> Rqmt {
        let mut r = self.rqmt.clone();
        if let Err(e) = r.normalize() {
            warn!("task {}: {e}", self.start);
        }
        r
    }

    // ----- instances and argument chunking

    fn effective_parallel(&self) -> usize {
        if self.parallel == 0 || self.parallel > self.args.len() {
            self.args.len()
        } else {
            self.parallel
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        (1..=self.effective_parallel() as TaskId).collect()
    }

    /// Balanced chunking: the first `N % P` instances get one argument
    /// more than the rest.
    ///
    pub fn arg_range(&self, task_id: TaskId) -> std::ops::Range<usize> {
        assert!(task_id >= 1, "task ids start at 1");
        let n = self.args.len();
        let p = self.effective_parallel();
        let chunk = n / p;
        let overflow = n % p;
        let t = (task_id - 1) as usize;
        if t < overflow {
            let start = (chunk + 1) * t;
            start..start + chunk + 1
        } else {
            let start = (chunk + 1) * overflow + chunk * (t - overflow);
            start..start + chunk
        }
    }

    /// The argument tuple for one arg index, unpacked for the call.
    pub fn call_args(&self, arg_idx: usize) -> Vec<Value> {
        match &self.args[arg_idx] {
            Value::List(xs) | Value::Tuple(xs) => xs.clone(),
            v => vec![v.clone()],
        }
    }

    // ----- paths

    pub fn log_path(&self, task_id: TaskId) -> PathBuf {
        self.job().instance_file(JOB_LOG, &self.start, task_id)
    }

    pub fn engine_log_dir(&self) -> PathBuf {
        self.job().path_of(JOB_LOG_ENGINE)
    }

    pub fn usage_path(&self, task_id: TaskId) -> PathBuf {
        self.job().instance_file(PLOGGING_FILE, &self.start, task_id)
    }

    pub fn finished_marker(&self, task_id: TaskId) -> PathBuf {
        self.job().instance_file(STATE_FINISHED_MARKER, &self.start, task_id)
    }

    pub fn error_marker(&self, task_id: TaskId) -> PathBuf {
        self.job().instance_file(STATE_ERROR_MARKER, &self.start, task_id)
    }

    pub fn submit_log_path(&self) -> PathBuf {
        self.job().path_of(ENGINE_SUBMIT)
    }

    /// The worker command line for this task.
    ///
    pub fn worker_call(&self, task_id: Option<TaskId>) -> Vec<String> {
        let exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "sis".to_string());
        let mut call = vec![
            exe,
            CMD_WORKER.to_string(),
            self.job().dir().to_string_lossy().into_owned(),
            self.start.clone(),
        ];
        if let Some(id) = task_id {
            call.push(id.to_string());
        }
        call
    }

    // ----- markers

    /// A finish marker only counts once it is old enough to have settled
    /// through a network filesystem.
    ///
    pub fn finished(&self, task_id: Option<TaskId>) -> bool {
        let job = self.job();
        let min_age = Duration::from_secs(
            job.settings().wait_period_job_fs_sync + job.settings().wait_period_job_cleanup,
        );
        self.ids(task_id)
            .iter()
            .all(|id| job.check_file(&self.finished_marker(*id), min_age))
    }

    /// Error check with retry handling: while unused tries remain, the
    /// log rotates to `<log>.error.NN` and the marker is cleared, making
    /// the instance resumable again.
    ///
    pub fn error(&self, task_id: Option<TaskId>) -> bool {
        let mut any = false;
        for id in self.ids(task_id) {
            let marker = self.error_marker(id);
            if marker.is_file() {
                self.rotate_log(id);
            }
            any |= marker.is_file();
        }
        any
    }

    fn rotate_log(&self, task_id: TaskId) {
        let log = self.log_path(task_id);
        for i in 1..self.tries {
            let rotated = PathBuf::from(format!("{}.error.{:02}", log.display(), i));
            if !rotated.is_file() {
                if log.is_file() {
                    if fs::rename(&log, &rotated).is_ok() {
                        let _ = fs::remove_file(self.error_marker(task_id));
                    }
                }
                break;
            }
        }
    }

    pub fn set_finished(&self, task_id: TaskId) -> std::io::Result<()> {
        fs::File::create(self.finished_marker(task_id)).map(|_| ())
    }

    pub fn set_error(&self, task_id: TaskId) -> std::io::Result<()> {
        fs::File::create(self.error_marker(task_id)).map(|_| ())
    }

    /// True once execution started (the instance log exists).
    pub fn started(&self, task_id: TaskId) -> bool {
        self.log_path(task_id).is_file()
    }

    /// `Some(true)` while the usage snapshot is fresh, `None` if there is
    /// no snapshot at all.
    ///
    pub fn running(&self, task_id: TaskId) -> Option<bool> {
        let usage = self.usage_path(task_id);
        if !usage.is_file() {
            return None;
        }
        let settings = self.job().settings().clone();
        let max_age = Duration::from_secs(
            settings.wait_period_job_fs_sync
                + settings.plogging_update_file_period
                + settings.wait_period_job_cleanup,
        );
        let age = fs::metadata(&usage)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        Some(age <= max_age)
    }

    fn ids(&self, task_id: Option<TaskId>) -> Vec<TaskId> {
        match task_id {
            Some(id) => vec![id],
            None => self.task_ids(),
        }
    }

    // ----- state classification

    pub fn reset_cache(&self) {
        let mut caches = self.caches.lock().unwrap();
        caches.state.clear();
        caches.submit_history = None;
    }

    /// Classify one instance, or fold all instances into the task state
    /// (worst instance wins).  Answers are cached briefly.
    ///
    pub fn state(
        &self,
        engine: Option<&dyn Engine>,
        task_id: Option<TaskId>,
        force: bool,
    ) -> TaskState {
        {
            let caches = self.caches.lock().unwrap();
            if !force {
                if let Some((at, state)) = caches.state.get(&task_id) {
                    if at.elapsed() < Duration::from_secs(STATE_CACHE_SECS) {
                        return *state;
                    }
                }
            }
        }
        let state = self.classify(engine, task_id);
        let mut caches = self.caches.lock().unwrap();
        caches.state.insert(task_id, (Instant::now(), state));
        caches.last_state = Some(state);
        state
    }

    fn classify(&self, engine: Option<&dyn Engine>, task_id: Option<TaskId>) -> TaskState {
        if self.finished(task_id) {
            return TaskState::Finished;
        }
        if self.error(task_id) {
            return TaskState::Error;
        }
        let Some(id) = task_id else {
            // fold instances, worst first
            let states: Vec<TaskState> =
                self.task_ids().iter().map(|i| self.state(engine, Some(*i), false)).collect();
            for wanted in [
                TaskState::Error,
                TaskState::QueueError,
                TaskState::Interrupted,
                TaskState::Runnable,
                TaskState::Queue,
                TaskState::Running,
                TaskState::RetryError,
                TaskState::Finished,
            ] {
                if states.contains(&wanted) {
                    return wanted;
                }
            }
            unreachable!("no state for task: {states:?}");
        };

        let mut engine_state = match engine {
            None => EngineState::Unknown,
            Some(e) => e.task_state(self, id),
        };

        // a stale cache may miss a just-vanished instance, ask once more
        if engine_state == EngineState::Unknown && self.started(id) {
            if let Some(e) = engine {
                let last = self.caches.lock().unwrap().last_state;
                if last.map_or(false, |s| s != TaskState::Unknown) {
                    e.reset_cache();
                    engine_state = e.task_state(self, id);
                }
            }
        }

        match engine_state {
            EngineState::Unknown => {
                if self.started(id) {
                    // may have finished or crashed while we were asking
                    if self.finished(Some(id)) {
                        return TaskState::Finished;
                    }
                    if self.error(Some(id)) {
                        return TaskState::Error;
                    }
                    if self.running(id) == Some(true) {
                        return TaskState::Running;
                    }
                    let history = self.submit_history();
                    let submits = history.get(&id).map(Vec::len).unwrap_or(0);
                    if submits >= self.job().settings().max_submit_retries {
                        TaskState::RetryError
                    } else {
                        TaskState::Interrupted
                    }
                } else {
                    TaskState::Runnable
                }
            }
            EngineState::Running => {
                if self.running(id) == Some(false) {
                    warn!(
                        "task marked as running but its usage snapshot went stale: {}",
                        self.task_name()
                    );
                }
                TaskState::Running
            }
            EngineState::Queue => TaskState::Queue,
            EngineState::QueueError => TaskState::QueueError,
        }
    }

    // ----- submit history & requirement escalation

    /// Parse the append-only submit log into `task id → [rqmt, …]`,
    /// memoized on the file's mtime.
    ///
    pub fn submit_history(&self) -> HashMap<TaskId, Vec<Rqmt>> {
        let path = self.submit_log_path();
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        {
            let caches = self.caches.lock().unwrap();
            if let Some((cached_mtime, history)) = &caches.submit_history {
                if mtime == Some(*cached_mtime) {
                    return history.clone();
                }
            }
        }
        let mut history: HashMap<TaskId, Vec<Rqmt>> = HashMap::new();
        if let Ok(data) = fs::read_to_string(&path) {
            for line in data.lines() {
                match serde_json::from_str::<(Vec<TaskId>, Rqmt)>(line) {
                    Ok((ids, mut rqmt)) => {
                        rqmt.0.remove("engine_name");
                        rqmt.0.remove("engine_info");
                        for id in ids {
                            history.entry(id).or_default().push(rqmt.clone());
                        }
                    }
                    Err(e) => debug!("unparsable submit log line in {}: {e}", path.display()),
                }
            }
        }
        if let Some(mtime) = mtime {
            self.caches.lock().unwrap().submit_history = Some((mtime, history.clone()));
        }
        history
    }

    /// Compute the next attempt's requirements from the last usage
    /// snapshot.  Without a readable snapshot the request is reused.
    ///
    pub fn update_rqmt(&self, initial: &Rqmt, task_id: TaskId) -> Rqmt {
        let usage = match Usage::load(&self.usage_path(task_id)) {
            Ok(u) => u,
            Err(_) => return initial.clone(),
        };
        let f = self.update_rqmt_fn.unwrap_or(update_engine_rqmt);
        let mut next = f(initial, &usage);
        next.check_engine_limits();
        next
    }

    pub fn last_log_lines(&self, task_id: TaskId, lines: usize) -> Option<String> {
        let text = fs::read_to_string(self.log_path(task_id)).ok()?;
        if lines == 0 {
            return Some(text);
        }
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        Some(all[start..].join("\n"))
    }

    pub(crate) fn job_for_engine(&self) -> std::sync::Arc<Job> {
        self.job()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("start", &self.start)
            .field("parallel", &self.effective_parallel())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn task_with_args(n: usize, parallel: usize) -> Task {
        let args = (0..n).map(|i| Value::Int(i as i64)).collect();
        Task::new("run").args(args).parallel(parallel)
    }

    #[test]
    fn test_seven_args_three_slots() {
        let t = task_with_args(7, 3);
        assert_eq!(vec![1, 2, 3], t.task_ids());
        assert_eq!(0..3, t.arg_range(1));
        assert_eq!(3..5, t.arg_range(2));
        assert_eq!(5..7, t.arg_range(3));
    }

    #[rstest]
    #[case(1, 1)]
    #[case(5, 2)]
    #[case(10, 3)]
    #[case(10, 10)]
    #[case(3, 7)]
    fn test_ranges_cover_all_args_disjointly(#[case] n: usize, #[case] parallel: usize) {
        let t = task_with_args(n, parallel);
        let mut seen = vec![false; n];
        for id in t.task_ids() {
            for idx in t.arg_range(id) {
                assert!(!seen[idx], "arg {idx} assigned twice");
                seen[idx] = true;
            }
        }
        assert!(seen.into_iter().all(|b| b), "not all args covered");
    }

    #[test]
    fn test_default_single_instance() {
        let t = Task::new("run");
        assert_eq!(vec![1], t.task_ids());
        assert_eq!(0..1, t.arg_range(1));
        assert!(t.call_args(0).is_empty());
    }

    #[test]
    fn test_mini_routes_to_short_engine() {
        let t = Task::new("run").mini();
        assert_eq!(Some("short"), t.declared_rqmt().engine_name());
    }

    #[test]
    fn test_call_args_unpacks_lists() {
        let t = Task::new("run").args(vec![
            Value::List(vec![Value::Int(1), Value::Str("x".into())]),
            Value::Int(9),
        ]);
        assert_eq!(vec![Value::Int(1), Value::Str("x".into())], t.call_args(0));
        assert_eq!(vec![Value::Int(9)], t.call_args(1));
    }
}
