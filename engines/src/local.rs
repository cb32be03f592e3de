//! The local engine: an in-process execution pool.
//!
//! One background thread drives everything: it reaps finished children,
//! pops the waiting queue, and starts tasks whenever their requirements
//! fit into the free resources.  Submission never blocks.  After a
//! manager restart, still-running workers are adopted back via their
//! usage snapshots.
//!

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use sisyphus_core::{Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId, Usage};

const ENGINE_NAME: &str = "local";

/// One queued task instance.
#[derive(Clone, Debug)]
struct QueuedTask {
    call: Vec<String>,
    engine_log: PathBuf,
    rqmt: Rqmt,
    /// Unique name: job id plus task name.
    name: String,
    task_id: TaskId,
}

enum Handle {
    /// Spawned by this process, can be reaped.
    Child(Child),
    /// Recovered after a restart; liveness is polled instead.
    Adopted(u32),
}

struct PoolState {
    free: BTreeMap<String, f64>,
    waiting: VecDeque<QueuedTask>,
    running: HashMap<(String, TaskId), (Handle, QueuedTask)>,
}

struct Inner {
    max: BTreeMap<String, f64>,
    state: Mutex<PoolState>,
    keep_running: AtomicBool,
}

/// Simple engine to execute tasks locally.  CPU and GPU are always
/// budgeted, other resources only when given at construction.
///
pub struct LocalEngine {
    inner: Arc<Inner>,
    started: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LocalEngine {
    pub fn new(cpu: u32, gpu: u32, mem: Option<f64>) -> LocalEngine {
        let mut max = BTreeMap::new();
        max.insert("cpu".to_string(), cpu as f64);
        max.insert("gpu".to_string(), gpu as f64);
        if let Some(mem) = mem {
            max.insert("mem".to_string(), mem);
        }
        let inner = Arc::new(Inner {
            state: Mutex::new(PoolState {
                free: max.clone(),
                waiting: VecDeque::new(),
                running: HashMap::new(),
            }),
            max,
            keep_running: AtomicBool::new(true),
        });
        LocalEngine {
            inner,
            started: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// Snapshot of the free resources, mainly for tests and the console.
    pub fn free_resources(&self) -> BTreeMap<String, f64> {
        self.inner.state.lock().unwrap().free.clone()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().unwrap().running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().unwrap().waiting.len()
    }

    /// Adopt a worker left over from a previous manager run if its pid
    /// is still alive and looks like the expected command.
    ///
    fn try_to_recover_task(&self, task: &Task, task_id: TaskId) -> bool {
        let usage_file = task.usage_path(task_id);
        let Ok(usage) = Usage::load(&usage_file) else {
            return false;
        };

        let call = task.worker_call(Some(task_id));

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(usage.pid)]),
            true,
            ProcessRefreshKind::everything(),
        );
        let Some(process) = system.process(Pid::from_u32(usage.pid)) else {
            return false;
        };

        let cmd: Vec<String> =
            process.cmd().iter().map(|c| c.to_string_lossy().into_owned()).collect();
        // the selector may have spliced extra flags into the argv, so
        // match on the stable part: the worker subcommand plus the job
        // dir, task name and instance id
        let expected = &call[1..];
        let is_ours = cmd.iter().any(|c| c == &expected[0])
            && expected.iter().all(|part| cmd.contains(part));
        if !is_ours {
            debug!("job changed, ignoring pid {}: {:?} vs {:?}", usage.pid, cmd, call);
            return false;
        }
        let cwd_ok = match (process.cwd(), std::env::current_dir().ok()) {
            (Some(a), Some(b)) => a == b.as_path(),
            _ => false,
        };
        if !cwd_ok {
            debug!("job changed cwd, ignoring pid {}", usage.pid);
            return false;
        }

        let queued = QueuedTask {
            call,
            engine_log: task.engine_log_dir().join(format!("{}.{}", task.name(), task_id)),
            rqmt: usage.requested_resources.clone(),
            name: task.task_name(),
            task_id,
        };
        let mut state = self.inner.state.lock().unwrap();
        reserve(&mut state.free, &self.inner.max, &queued.rqmt);
        state
            .running
            .insert((queued.name.clone(), task_id), (Handle::Adopted(usage.pid), queued));
        debug!("adopted running worker, pid {}", usage.pid);
        true
    }
}

fn requested(rqmt: &Rqmt, key: &str) -> f64 {
    match key {
        "cpu" => rqmt.cpu() as f64,
        "gpu" => rqmt.gpu() as f64,
        "mem" => rqmt.mem_gb().unwrap_or(0.0),
        other => rqmt.get(other).and_then(|v| v.as_f64()).unwrap_or(0.0),
    }
}

fn enough_free(
    free: &BTreeMap<String, f64>,
    max: &BTreeMap<String, f64>,
    rqmt: &Rqmt,
) -> bool {
    for (key, available) in max {
        let want = requested(rqmt, key);
        if want > *available {
            warn!(
                "requested resources are higher than the maximum available: {key} {want} > {available}"
            );
        }
        let have = free.get(key).copied().unwrap_or(0.0);
        if want > have {
            return false;
        }
    }
    true
}

fn reserve(free: &mut BTreeMap<String, f64>, max: &BTreeMap<String, f64>, rqmt: &Rqmt) {
    for key in max.keys() {
        if let Some(f) = free.get_mut(key) {
            *f -= requested(rqmt, key);
        }
    }
}

fn release(free: &mut BTreeMap<String, f64>, max: &BTreeMap<String, f64>, rqmt: &Rqmt) {
    for (key, cap) in max {
        if let Some(f) = free.get_mut(key) {
            *f = (*f + requested(rqmt, key)).min(*cap);
        }
    }
}

/// Spawn one worker in its own process group, wrapper output appended to
/// the engine log.
///
fn start_task(task: &QueuedTask) -> std::io::Result<Child> {
    use std::os::unix::process::CommandExt;

    let log = OpenOptions::new().create(true).append(true).open(&task.engine_log)?;
    let log_err = log.try_clone()?;
    Command::new(&task.call[0])
        .args(&task.call[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()
}

/// The pool loop: reap, then start whatever fits.
///
fn pool_loop(inner: Arc<Inner>) {
    while inner.keep_running.load(Ordering::SeqCst) {
        let mut progress = false;
        {
            let mut state = inner.state.lock().unwrap();

            // reap finished children and poll adopted pids
            let mut done: Vec<(String, TaskId)> = Vec::new();
            let mut system: Option<System> = None;
            for (key, (handle, _)) in state.running.iter_mut() {
                let finished = match handle {
                    Handle::Child(child) => matches!(child.try_wait(), Ok(Some(_)) | Err(_)),
                    Handle::Adopted(pid) => {
                        let sys = system.get_or_insert_with(System::new);
                        sys.refresh_processes_specifics(
                            ProcessesToUpdate::Some(&[Pid::from_u32(*pid)]),
                            true,
                            ProcessRefreshKind::nothing(),
                        );
                        sys.process(Pid::from_u32(*pid)).is_none()
                    }
                };
                if finished {
                    done.push(key.clone());
                }
            }
            for key in done {
                if let Some((_, task)) = state.running.remove(&key) {
                    debug!("task done {:?}", key);
                    release(&mut state.free, &inner.max, &task.rqmt);
                    progress = true;
                }
            }

            // start the next waiting task if it fits
            if let Some(next) = state.waiting.front().cloned() {
                if enough_free(&state.free, &inner.max, &next.rqmt) {
                    state.waiting.pop_front();
                    match start_task(&next) {
                        Ok(child) => {
                            reserve(&mut state.free, &inner.max, &next.rqmt);
                            debug!("start task {} {}", next.name, next.task_id);
                            state.running.insert(
                                (next.name.clone(), next.task_id),
                                (Handle::Child(child), next),
                            );
                        }
                        Err(e) => warn!("could not start {}: {e}", next.call.join(" ")),
                    }
                    progress = true;
                }
            }
        }
        if !progress {
            thread::sleep(Duration::from_millis(200));
        }
    }
}

impl Engine for LocalEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn start_engine(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("local-engine".to_string())
            .spawn(move || pool_loop(inner))?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop_engine(&self) -> Result<(), EngineError> {
        debug!("got stop signal");
        self.inner.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let state = self.inner.state.lock().unwrap();
        if !state.running.is_empty() {
            warn!("still running tasks in local engine: {}", state.running.len());
            for ((name, task_id), (handle, _)) in state.running.iter() {
                let pid = match handle {
                    Handle::Child(c) => c.id(),
                    Handle::Adopted(p) => *p,
                };
                warn!(" running task: {name} {task_id} PID: {pid}");
            }
        }
        Ok(())
    }

    fn get_default_rqmt(&self, _task: &Task) -> Rqmt {
        Rqmt::new().with("cpu", 1).with("mem", 1.0).with("time", 1.0)
    }

    fn task_state(&self, task: &Task, task_id: TaskId) -> EngineState {
        let key = (task.task_name(), task_id);
        {
            let state = self.inner.state.lock().unwrap();
            if state.waiting.iter().any(|t| t.name == key.0 && t.task_id == task_id) {
                return EngineState::Queue;
            }
            if state.running.contains_key(&key) {
                return EngineState::Running;
            }
        }
        if self.try_to_recover_task(task, task_id) {
            EngineState::Running
        } else {
            EngineState::Unknown
        }
    }

    fn submit_call(
        &self,
        call: &[String],
        logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        task_name: &str,
        task_ids: &[TaskId],
    ) -> Result<SubmitResult, EngineError> {
        let engine_log_dir = logpath.to_path_buf();
        let mut state = self.inner.state.lock().unwrap();
        for task_id in task_ids {
            let mut call_with_id = call.to_vec();
            call_with_id.push(task_id.to_string());
            call_with_id.push("--redirect-output".to_string());
            state.waiting.push_back(QueuedTask {
                call: call_with_id,
                engine_log: engine_log_dir.join(format!("{task_name}.{task_id}")),
                rqmt: rqmt.clone(),
                name: name.to_string(),
                task_id: *task_id,
            });
        }
        Ok(SubmitResult {
            engine_name: ENGINE_NAME.to_string(),
            engine_info: json!(hostname()),
        })
    }

    fn get_task_id(&self, passed: Option<TaskId>) -> TaskId {
        match passed {
            Some(id) => id,
            None => {
                warn!(
                    "local job started without a task id, worker was probably \
                     started manually; continuing with task_id=1"
                );
                1
            }
        }
    }

    fn reset_cache(&self) {
        // the local engine needs no cache
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.inner.keep_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        f()
    }

    // the pool appends the task id and the redirect flag; going through
    // `sh -c` makes them harmless positional parameters
    fn sleeper(secs: &str) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("sleep {secs}"),
            "sh".to_string(),
        ]
    }

    fn submit(engine: &LocalEngine, dir: &Path, name: &str, cpu: i64, gpu: i64) {
        let rqmt = Rqmt::new().with("cpu", cpu).with("gpu", gpu);
        engine.submit_call(&sleeper("2"), dir, &rqmt, name, "run", &[1]).unwrap();
    }

    #[test]
    fn test_resource_gating() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(4, 1, None);
        engine.start_engine().unwrap();

        // A and B fill the cpu budget, C needs a cpu although the gpu is free
        submit(&engine, dir.path(), "a.run", 2, 0);
        submit(&engine, dir.path(), "b.run", 2, 0);
        submit(&engine, dir.path(), "c.run", 1, 1);

        assert!(wait_until(Duration::from_secs(5), || engine.running_count() == 2));
        let free = engine.free_resources();
        assert_eq!(Some(&0.0), free.get("cpu"));
        assert_eq!(Some(&1.0), free.get("gpu"));
        assert_eq!(1, engine.waiting_count());

        // once a slot frees up, C runs
        assert!(wait_until(Duration::from_secs(10), || engine.waiting_count() == 0));
        assert!(wait_until(Duration::from_secs(10), || engine.running_count() == 0));
        let free = engine.free_resources();
        assert_eq!(Some(&4.0), free.get("cpu"));
        assert_eq!(Some(&1.0), free.get("gpu"));

        engine.stop_engine().unwrap();
    }

    #[test]
    fn test_submit_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let engine = LocalEngine::new(1, 0, None);
        // queueing works even before the loop thread runs
        for i in 0..16 {
            submit(&engine, dir.path(), &format!("t{i}.run"), 1, 0);
        }
        assert_eq!(16, engine.waiting_count());
    }
}
