//! The worker: runs one task instance inside the job directory.
//!
//! The outer invocation re-executes itself with output redirected into
//! the instance log; the inner invocation loads `job.save`, waits for
//! freshly written inputs to settle, starts the usage logger and runs
//! the task function once per assigned argument.
//!

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use sysinfo::{Pid, System};
use tracing::{debug, error, info, warn};

use sisyphus_common::{format_bytes, format_time, Settings};
use sisyphus_core::{
    enable_file_caching, enter_worker_context, get_rqmt, Engine, ResourceSample, Rqmt, Session,
    Task, TaskError, TaskId, Usage,
};

/// Parsed worker command line.
#[derive(Clone, Debug)]
pub struct WorkerArgs {
    pub jobdir: PathBuf,
    pub task_name: String,
    pub task_id: Option<TaskId>,
    pub engine: Option<String>,
    pub redirect_output: bool,
    pub force_resume: bool,
}

/// Entry point: any failure ends in an error marker so the manager sees
/// the instance fail instead of silently vanishing.
///
pub fn run_worker(
    session: &Arc<Session>,
    engine: &dyn Engine,
    args: &WorkerArgs,
) -> eyre::Result<()> {
    let engine = match &args.engine {
        Some(name) => engine.sub_engine(name).unwrap_or(engine),
        None => engine,
    };
    match worker_helper(session, engine, args) {
        Ok(()) => Ok(()),
        Err(e) => {
            let task_id = engine.get_task_id(args.task_id);
            let marker = args
                .jobdir
                .join(format!("error.{}.{}", args.task_name, task_id));
            if !marker.exists() {
                let _ = fs::File::create(&marker);
            }
            Err(e)
        }
    }
}

fn worker_helper(
    session: &Arc<Session>,
    engine: &dyn Engine,
    args: &WorkerArgs,
) -> eyre::Result<()> {
    let settings = session.settings().clone();

    if args.redirect_output {
        return redirect_output(engine, args);
    }

    enter_worker_context();
    enable_file_caching();

    let job = session.load_job(&args.jobdir)?;
    if !job.runnable() {
        for path in job.inputs() {
            if path.available() {
                info!("path available:     {path}");
            } else {
                error!("path not available: {path}");
            }
        }
        eyre::bail!("job is not runnable, probably some inputs are not ready");
    }

    let task = job.find_task(&args.task_name)?;
    let task_id = engine.get_task_id(args.task_id);
    debug!("task id: {task_id}");

    engine.init_worker(&task)?;
    wait_for_input_mtimes(&job.inputs(), &settings);

    let rqmt = get_rqmt(engine, &task, task_id, false);
    let logger = UsageLogger::start(task.clone(), task_id, rqmt, settings.clone());

    // pick the resume function on an explicit request or a retry
    let history = task.submit_history();
    let is_retry = history.get(&task_id).map(|h| h.len() > 1).unwrap_or(false)
        || job.path_of(&format!("log.{}.{}.error.01", task.name(), task_id)).is_file();
    let func = if (args.force_resume || is_retry) && task.resume_name().is_some() {
        task.resume_name().unwrap().to_string()
    } else {
        if (args.force_resume || is_retry) && task.resume_name().is_none() {
            warn!(
                "no resume function set (changed tasks after the job was initialized?), \
                 falling back to the start function: {}",
                task.name()
            );
        }
        task.name().to_string()
    };

    info!("start job: {} task: {}", job.id(), task.name());
    for input in job.inputs() {
        info!("input: {input}");
    }

    let result = run_in_workdir(&job, &task, task_id, &func);
    match result {
        Ok(()) => {
            logger.stop();
            if !task.is_continuable() {
                task.set_finished(task_id)?;
            }
            info!("job finished successful");
            Ok(())
        }
        Err(e) => {
            if e.is_out_of_memory() {
                error!("command got killed (probably out of memory): {e}");
                logger.set_out_of_memory();
            } else {
                error!("job failed: {e}");
            }
            logger.stop();
            task.set_error(task_id)?;
            Err(e.into())
        }
    }
}

fn run_in_workdir(
    job: &Arc<sisyphus_core::Job>,
    task: &Arc<Task>,
    task_id: TaskId,
    func: &str,
) -> Result<(), TaskError> {
    // task functions run inside the scratch directory
    std::env::set_current_dir(job.work_path())?;
    for arg_idx in task.arg_range(task_id) {
        let call_args = task.call_args(arg_idx);
        info!("{}", "-".repeat(60));
        info!("starting subtask for arg id: {arg_idx} args: {call_args:?}");
        info!("{}", "-".repeat(60));
        job.run_task_function(func, &call_args)?;
    }
    Ok(())
}

/// Re-execute the same command with stdout/stderr appended to the
/// instance log; retries get an eye-catching banner.
///
fn redirect_output(engine: &dyn Engine, args: &WorkerArgs) -> eyre::Result<()> {
    let task_id = engine.get_task_id(args.task_id);
    let log_file = args.jobdir.join(format!("log.{}.{}", args.task_name, task_id));

    let is_not_first = log_file.is_file();
    let mut log = OpenOptions::new().create(true).append(true).open(&log_file)?;
    if is_not_first {
        use std::io::Write;
        let bar = "#".repeat(80);
        writeln!(log, "\n{bar}\nRETRY OR CONTINUE TASK\n{bar}\n")?;
    }

    let exe = std::env::current_exe()?;
    let mut call: Vec<String> = vec![
        sisyphus_core::CMD_WORKER.to_string(),
        args.jobdir.to_string_lossy().into_owned(),
        args.task_name.clone(),
        task_id.to_string(),
    ];
    if let Some(engine_name) = &args.engine {
        call.push("--engine".to_string());
        call.push(engine_name.clone());
    }
    if args.force_resume {
        call.push("--force-resume".to_string());
    }

    let log_err = log.try_clone()?;
    let status = Command::new(exe)
        .args(&call)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .status()?;
    if !status.success() {
        eyre::bail!("worker exited with {status}");
    }
    Ok(())
}

/// Each input must have settled on a network filesystem before it is
/// read; young files are waited out.
///
fn wait_for_input_mtimes(inputs: &[sisyphus_core::SisPath], settings: &Settings) {
    let min_age = Duration::from_secs(settings.wait_period_mtime_of_inputs);
    for input in inputs {
        let path = input.get_path();
        match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                let age = SystemTime::now().duration_since(mtime).unwrap_or(min_age);
                if age < min_age {
                    let wait = min_age - age;
                    debug!("waiting {wait:?} for {} to settle", path.display());
                    thread::sleep(wait);
                }
            }
            Err(_) => warn!("input path does not exist: {}", path.display()),
        }
    }
}

// ----- usage logger

struct LoggerShared {
    stop: Mutex<bool>,
    cond: Condvar,
    out_of_memory: AtomicBool,
}

/// Background thread sampling the process tree, continuously rewriting
/// the usage snapshot.  The snapshot doubles as the heartbeat.
///
pub struct UsageLogger {
    shared: Arc<LoggerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl UsageLogger {
    pub fn start(
        task: Arc<Task>,
        task_id: TaskId,
        rqmt: Rqmt,
        settings: Arc<Settings>,
    ) -> UsageLogger {
        let shared = Arc::new(LoggerShared {
            stop: Mutex::new(false),
            cond: Condvar::new(),
            out_of_memory: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("usage-logger".to_string())
            .spawn(move || logger_loop(task, task_id, rqmt, settings, thread_shared))
            .ok();
        UsageLogger { shared, handle }
    }

    pub fn set_out_of_memory(&self) {
        self.shared.out_of_memory.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        {
            let mut stop = self.shared.stop.lock().unwrap();
            *stop = true;
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for UsageLogger {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sum rss/vms/cpu over the given process and all of its descendants.
///
pub fn sample_process_tree(system: &mut System, root: u32) -> ResourceSample {
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let root = Pid::from_u32(root);

    let mut in_tree: Vec<Pid> = vec![root];
    // walk down the parent chains
    let mut changed = true;
    while changed {
        changed = false;
        for (pid, process) in system.processes() {
            if in_tree.contains(pid) {
                continue;
            }
            if let Some(parent) = process.parent() {
                if in_tree.contains(&parent) {
                    in_tree.push(*pid);
                    changed = true;
                }
            }
        }
    }

    let mut sample = ResourceSample::default();
    for pid in in_tree {
        if let Some(process) = system.process(pid) {
            sample.rss += process.memory() as f64 / 1024f64.powi(3);
            sample.vms += process.virtual_memory() as f64 / 1024f64.powi(3);
            sample.cpu += process.cpu_usage() as f64;
        }
    }
    sample
}

fn logger_loop(
    task: Arc<Task>,
    task_id: TaskId,
    rqmt: Rqmt,
    settings: Arc<Settings>,
    shared: Arc<LoggerShared>,
) {
    let start = Instant::now();
    let usage_path = task.usage_path(task_id);
    let mut system = System::new();
    let pid = std::process::id();
    let host = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let user = std::env::var("USER").unwrap_or_default();

    let mut max = ResourceSample::default();
    let mut last_rss: Option<f64> = None;
    let mut last_logged_rss = 0.0f64;
    let mut last_file_update = Instant::now() - Duration::from_secs(3600);

    loop {
        let current = sample_process_tree(&mut system, pid);
        max.rss = max.rss.max(current.rss);
        max.vms = max.vms.max(current.vms);
        max.cpu = max.cpu.max(current.cpu);

        let rss_changed = match last_rss {
            None => true,
            Some(last) if last > 0.0 => {
                (last - current.rss).abs() / last > settings.plogging_min_change
            }
            Some(_) => current.rss > 0.0,
        };
        if rss_changed {
            if !settings.plogging_quiet {
                info!(
                    "run time: {} CPU: {:.2}% RSS: {} VMS: {}",
                    format_time(start.elapsed().as_secs()),
                    current.cpu,
                    format_bytes((current.rss * 1024f64.powi(3)) as u64),
                    format_bytes((current.vms * 1024f64.powi(3)) as u64),
                );
            }
            last_rss = Some(current.rss);
        }

        let grew = last_logged_rss > 0.0
            && (max.rss - last_logged_rss) / last_logged_rss > settings.plogging_min_change;
        if grew
            || last_file_update.elapsed()
                > Duration::from_secs(settings.plogging_update_file_period)
        {
            write_snapshot(&usage_path, &max, &current, pid, &user, &host, start, &rqmt, &shared);
            last_logged_rss = max.rss;
            last_file_update = Instant::now();
        }

        let stop = shared.stop.lock().unwrap();
        let (stop, _) = shared
            .cond
            .wait_timeout(stop, Duration::from_secs(settings.plogging_interval))
            .unwrap();
        if *stop {
            break;
        }
    }

    let current = sample_process_tree(&mut system, pid);
    write_snapshot(&usage_path, &max, &current, pid, &user, &host, start, &rqmt, &shared);
    info!(
        "max resources: run time: {} CPU: {:.2}% RSS: {} VMS: {}",
        format_time(start.elapsed().as_secs()),
        max.cpu,
        format_bytes((max.rss * 1024f64.powi(3)) as u64),
        format_bytes((max.vms * 1024f64.powi(3)) as u64),
    );
}

#[allow(clippy::too_many_arguments)]
fn write_snapshot(
    path: &std::path::Path,
    max: &ResourceSample,
    current: &ResourceSample,
    pid: u32,
    user: &str,
    host: &str,
    start: Instant,
    rqmt: &Rqmt,
    shared: &LoggerShared,
) {
    let usage = Usage {
        max: max.clone(),
        current: current.clone(),
        pid,
        user: user.to_string(),
        used_time: start.elapsed().as_secs_f64() / 3600.0,
        host: host.to_string(),
        current_time: chrono::Local::now().to_rfc3339(),
        out_of_memory: shared.out_of_memory.load(Ordering::SeqCst),
        requested_resources: rqmt.clone(),
    };
    if let Err(e) = usage.save(path) {
        warn!("could not write usage snapshot {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_includes_own_process() {
        let mut system = System::new();
        let sample = sample_process_tree(&mut system, std::process::id());
        assert!(sample.rss > 0.0);
    }
}
