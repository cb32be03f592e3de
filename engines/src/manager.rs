//! The manager loop: computes states over the graph, sets up runnable
//! jobs, submits their tasks, resumes interrupted ones and links
//! finished outputs into the stable namespace.
//!

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use sisyphus_common::Settings;
use sisyphus_core::{
    submit_task, Engine, Job, SisGraph, StatusMap, TaskState,
};

/// Display order for the per-state listing; errors sink to the bottom so
/// they stay visible on screen.
const OVERVIEW_ORDER: [TaskState; 12] = [
    TaskState::InputPath,
    TaskState::Finished,
    TaskState::Waiting,
    TaskState::Queue,
    TaskState::Running,
    TaskState::Runnable,
    TaskState::Interrupted,
    TaskState::Unknown,
    TaskState::QueueError,
    TaskState::RetryError,
    TaskState::Error,
    TaskState::InputMissing,
];

pub struct Manager {
    graph: Arc<SisGraph>,
    engine: Arc<dyn Engine>,
    settings: Arc<Settings>,

    link_outputs: bool,
    clear_once: bool,
    ignore_once: bool,
    start_computations: bool,
    interactive: bool,

    always_skip: HashSet<(&'static str, String)>,
    stop_loop: bool,
    state_overview: Vec<String>,
    jobs: StatusMap,
    pool: ThreadPool,
    cleaner: Option<JobCleaner>,
}

impl Manager {
    pub fn new(
        graph: Arc<SisGraph>,
        engine: Arc<dyn Engine>,
        link_outputs: bool,
        clear_once: bool,
        ignore_once: bool,
        start_computations: bool,
        interactive: bool,
    ) -> Manager {
        let settings = graph.session().settings().clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.submit_workers)
            .thread_name(|i| format!("submit-{i}"))
            .build()
            .expect("submit worker pool");
        let cleaner = if settings.job_auto_cleanup && start_computations {
            Some(JobCleaner::start(graph.clone(), settings.clone()))
        } else {
            None
        };
        graph.set_job_targets();
        Manager {
            graph,
            engine,
            settings,
            link_outputs,
            clear_once,
            ignore_once,
            start_computations,
            interactive,
            always_skip: HashSet::new(),
            stop_loop: false,
            state_overview: Vec::new(),
            jobs: StatusMap::default(),
            pool,
            cleaner,
        }
    }

    pub fn stop(&mut self) {
        self.stop_loop = true;
    }

    fn update_jobs(&mut self, skip_finished: bool) {
        self.jobs = self.graph.get_jobs_by_status(Some(self.engine.as_ref()), skip_finished);
        self.state_overview = self.jobs.overview();
    }

    /// Link finished outputs; per-target linking is idempotent.
    fn check_output(&self, write_output: bool, update_all: bool) {
        let targets =
            if update_all { self.graph.targets() } else { self.graph.active_targets() };
        for target in targets {
            target.update_requirements(write_output, &self.settings);
            if target.is_done() {
                if let Err(e) = target.run_when_done(write_output, &self.settings) {
                    warn!("target {} failed: {e}", target.name());
                }
                self.graph.remove_from_active_targets(target.name());
            }
        }
    }

    /// Move all error directories aside; true if anything was cleared.
    fn clear_errors(&mut self) -> bool {
        if !(self.settings.clear_errors || self.clear_once)
            || !self.jobs.contains(TaskState::Error)
        {
            self.clear_once = false;
            return false;
        }
        let mut cleared = false;
        for job in self.jobs.get(TaskState::Error).to_vec() {
            warn!("clearing: {job}");
            if let Err(e) = job.move_aside() {
                error!("could not clear {job}: {e}");
            }
            cleared = true;
        }
        self.clear_once = false;
        if cleared {
            self.update_jobs(true);
        }
        cleared
    }

    fn print_state_overview(&self, verbose: bool) {
        for state in OVERVIEW_ORDER {
            let jobs = self.jobs.get(state);
            let mut sorted: Vec<&Arc<Job>> = jobs.iter().collect();
            sorted.sort_by_key(|j| j.id().to_string());
            for job in sorted {
                let mut line = format!("{state}: {job}");
                let targets = job.needed_for_targets();
                if !targets.is_empty() {
                    line.push_str(&format!(" <target: {}>", targets.iter().next().unwrap()));
                }
                match state {
                    TaskState::Error | TaskState::RetryError | TaskState::InputMissing => {
                        error!("{line}");
                        if state == TaskState::Error {
                            self.print_error_logs(job);
                        }
                    }
                    TaskState::Interrupted | TaskState::Unknown | TaskState::QueueError => {
                        warn!("{line}")
                    }
                    TaskState::Queue | TaskState::Running | TaskState::Runnable => {
                        info!("{line}")
                    }
                    _ if verbose => info!("{line}"),
                    _ => debug!("{line}"),
                }
            }
        }
        for path in &self.jobs.input_missing {
            error!("input_missing: {path}");
        }
        if !self.state_overview.is_empty() {
            info!("{}", self.state_overview.join(" "));
        }
    }

    fn print_error_logs(&self, job: &Arc<Job>) {
        let mut budget = self.settings.print_error_tasks;
        let Ok(tasks) = job.tasks() else { return };
        for task in tasks {
            if budget == 0 {
                break;
            }
            for task_id in task.task_ids() {
                if task.error(Some(task_id)) {
                    if let Some(tail) =
                        task.last_log_lines(task_id, self.settings.print_error_lines)
                    {
                        error!("log of {} {}:\n{tail}", task.name(), task_id);
                    }
                    budget -= 1;
                    break;
                }
            }
        }
    }

    /// Anything actionable left?  Double checked after a short wait to
    /// dodge caching effects.
    fn work_left(&mut self) -> bool {
        if self.jobs.work_left() {
            return true;
        }
        thread::sleep(Duration::from_secs(self.settings.wait_period_cache));
        self.update_jobs(true);
        if !self.jobs.work_left() {
            info!("there is nothing I can do, good bye!");
            return false;
        }
        true
    }

    fn continue_manager_loop(&mut self) -> bool {
        if self.graph.active_targets().is_empty() {
            info!("all output calculated");
            return false;
        }
        if self.stop_loop {
            info!("manager loop stopped");
            return false;
        }
        self.work_left()
    }

    fn ask_user(&mut self, message: &str, kind: &'static str, job: &Arc<Job>) -> bool {
        if !self.interactive {
            return true;
        }
        let uid = (kind, job.id().to_string());
        if self.always_skip.contains(&uid) {
            return false;
        }
        let answer = prompt(&format!("{message} (Yes/skip/never) "));
        match answer.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => true,
            "s" | "skip" => false,
            "n" | "never" => {
                self.always_skip.insert(uid);
                false
            }
            other => {
                warn!("unknown response {other:?}, skipping once");
                false
            }
        }
    }

    /// Re-setup and resubmit interrupted jobs whose next task can resume.
    fn resume_jobs(&mut self) {
        let interrupted = self.jobs.get(TaskState::Interrupted).to_vec();
        let mut to_submit = Vec::new();
        for job in interrupted {
            let Some(task) = job.next_task() else { continue };
            if !task.resumable() {
                debug!("skip unresumable task of {job}");
                continue;
            }
            if !job.setup_since_restart()
                && self.ask_user(&format!("Resetup job directory ({job})?"), "resetup", &job)
            {
                if let Err(e) = job.setup_directory() {
                    error!("{e}");
                    continue;
                }
            }
            if self.ask_user(&format!("Resubmit job ({job})?"), "resubmit", &job) {
                to_submit.push(task);
            }
        }
        let engine = self.engine.clone();
        self.pool.scope(|s| {
            for task in to_submit {
                let engine = engine.clone();
                s.spawn(move |_| {
                    if let Err(e) = submit_task(engine.as_ref(), &task) {
                        warn!("resubmit failed: {e}");
                    }
                });
            }
        });
    }

    /// Set up directories and submit the next task of every runnable job.
    fn run_jobs(&mut self) {
        let runnable = self.jobs.get(TaskState::Runnable).to_vec();
        let mut to_run = Vec::new();
        for job in runnable {
            if self.interactive
                && !self.ask_user(&format!("Submit job ({job})?"), "submit", &job)
            {
                continue;
            }
            to_run.push(job);
        }
        let engine = self.engine.clone();
        self.pool.scope(|s| {
            for job in to_run {
                let engine = engine.clone();
                s.spawn(move |_| {
                    if !job.is_setup() || !job.setup_since_restart() {
                        if let Err(e) = job.setup_directory() {
                            error!("failed to setup {job}: {e}");
                            return;
                        }
                    }
                    let Some(task) = job.next_task() else { return };
                    if let Err(e) = submit_task(engine.as_ref(), &task) {
                        warn!("submit failed: {e}");
                    }
                });
            }
        });
    }

    fn startup(&mut self) -> bool {
        self.engine.reset_cache();
        self.check_output(false, true);
        self.update_jobs(true);

        if self.jobs.is_empty() {
            info!("all calculations are done");
            if self.link_outputs {
                create_aliases(&self.graph.jobs(), &self.settings);
                self.check_output(true, true);
            }
            return false;
        }

        self.print_state_overview(false);

        if self.jobs.contains(TaskState::Error) && !self.ignore_once {
            if self.interactive && !self.clear_once {
                let answer = prompt("Clear jobs in error state? [y/N] ");
                if answer.trim().eq_ignore_ascii_case("y") {
                    self.clear_once = true;
                }
            }
            self.clear_errors();
        }

        if !self.start_computations {
            if self.interactive {
                loop {
                    let answer = prompt(
                        "Print verbose overview (v), update aliases and outputs (u), \
                         start manager (y), or exit (n)? ",
                    );
                    match answer.trim().to_lowercase().as_str() {
                        "v" => {
                            self.update_jobs(false);
                            self.print_state_overview(true);
                        }
                        "u" => {
                            self.link_outputs = true;
                            create_aliases(&self.graph.jobs(), &self.settings);
                            self.check_output(true, true);
                        }
                        "y" => break,
                        "n" => {
                            self.stop();
                            return false;
                        }
                        other => warn!("unknown command: {other}"),
                    }
                }
            } else {
                // without a run request the loop only updates outputs
                self.check_output(self.link_outputs, true);
                return false;
            }
        }

        self.link_outputs = true;
        create_aliases(&self.graph.jobs(), &self.settings);
        self.check_output(true, true);
        true
    }

    /// The main loop.
    ///
    #[tracing::instrument(skip(self))]
    pub fn run(&mut self) -> eyre::Result<()> {
        self.engine.start_engine()?;
        if !self.startup() {
            self.finish();
            return Ok(());
        }

        let mut last_overview = self.state_overview.clone();
        while self.continue_manager_loop() {
            debug!("begin of manager loop");
            self.engine.reset_cache();
            self.check_output(self.link_outputs, false);
            self.update_jobs(true);

            if self.clear_errors() {
                continue;
            }

            if last_overview != self.state_overview {
                self.print_state_overview(false);
                last_overview = self.state_overview.clone();
            }

            if !self.jobs.contains(TaskState::Runnable) {
                debug!("wait for {} seconds", self.settings.wait_period_between_checks);
                thread::sleep(Duration::from_secs(self.settings.wait_period_between_checks));
            }

            self.resume_jobs();
            self.run_jobs();
        }

        self.check_output(self.link_outputs, true);
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.close();
        }
        if let Err(e) = self.engine.stop_engine() {
            warn!("engine did not stop cleanly: {e}");
        }
    }
}

fn prompt(message: &str) -> String {
    print!("{message}");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    let _ = io::stdin().lock().read_line(&mut answer);
    answer
}

/// Symlink every user alias below the alias directory.
///
pub fn create_aliases(jobs: &[Arc<Job>], settings: &Settings) {
    let mut aliases: Vec<(String, String)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for job in jobs {
        for prefix in job.alias_prefixes() {
            for alias in job.aliases() {
                let alias = Path::new(&prefix).join(&alias).to_string_lossy().into_owned();
                if !seen.insert(alias.clone()) {
                    warn!("alias {alias} is used multiple times");
                    continue;
                }
                aliases.push((alias, job.id().to_string()));
            }
        }
    }
    if aliases.is_empty() {
        return;
    }

    for (alias, target) in aliases {
        let link = settings.alias_dir.join(&alias);
        let target = settings.work_dir.join(&target);
        let target = target.canonicalize().unwrap_or(target);

        if link.is_symlink() && link.canonicalize().ok().as_deref() != Some(&target) {
            let _ = fs::remove_file(&link);
        }
        if !link.is_symlink() {
            if let Some(dir) = link.parent() {
                let _ = fs::create_dir_all(dir);
            }
            if let Err(e) = std::os::unix::fs::symlink(&target, &link) {
                warn!("could not link alias {}: {e}", link.display());
            }
        }
    }
}

/// Background thread archiving finished jobs while the manager runs.
///
pub struct JobCleaner {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl JobCleaner {
    pub fn start(graph: Arc<SisGraph>, settings: Arc<Settings>) -> JobCleaner {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("job-cleaner".to_string())
            .spawn(move || {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(settings.cleaner_workers)
                    .build()
                    .expect("cleaner pool");
                while !thread_stop.load(Ordering::SeqCst) {
                    let cleanable: Mutex<Vec<Arc<Job>>> = Mutex::new(Vec::new());
                    graph.for_all_nodes(
                        &|job| {
                            if job.cleanable() {
                                cleanable.lock().unwrap().push(job.clone());
                            }
                            true
                        },
                        None,
                        false,
                    );
                    let cleanable = cleanable.into_inner().unwrap();
                    pool.scope(|s| {
                        for job in cleanable {
                            s.spawn(move |_| {
                                if let Err(e) = job.cleanup() {
                                    warn!("cleanup of {job} failed: {e}");
                                }
                            });
                        }
                    });
                    for _ in 0..settings.job_cleaner_interval {
                        if thread_stop.load(Ordering::SeqCst) {
                            break;
                        }
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            })
            .ok();
        JobCleaner { stop, handle }
    }

    pub fn close(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overview_order_covers_all_states() {
        // keep the display order exhaustive when states are added
        assert_eq!(12, OVERVIEW_ORDER.len());
        let mut unique: Vec<TaskState> = OVERVIEW_ORDER.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(12, unique.len());
    }
}
