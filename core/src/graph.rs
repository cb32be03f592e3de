//! The dependency graph rooted at the registered targets.
//!
//! Traversal fans out over a bounded worker pool with a memoized visited
//! table, so a wide graph is walked concurrently but every job is
//! visited at most once per sweep.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::OnceCell;
use rayon::ThreadPool;
use tracing::{debug, info};

use crate::engine::{Engine, TaskState};
use crate::job::Job;
use crate::session::Session;
use crate::target::Target;

/// Reachable jobs partitioned by state, plus the external-input buckets.
///
#[derive(Debug, Default)]
pub struct StatusMap {
    pub jobs: BTreeMap<TaskState, Vec<Arc<Job>>>,
    pub input_paths: BTreeSet<String>,
    pub input_missing: BTreeSet<String>,
}

impl StatusMap {
    fn insert(&mut self, state: TaskState, job: Arc<Job>) {
        self.jobs.entry(state).or_default().push(job);
    }

    pub fn get(&self, state: TaskState) -> &[Arc<Job>] {
        self.jobs.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, state: TaskState) -> bool {
        self.jobs.get(&state).map_or(false, |v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.values().all(Vec::is_empty)
    }

    /// Anything the manager can still act on?
    pub fn work_left(&self) -> bool {
        self.jobs.iter().any(|(state, jobs)| state.actionable() && !jobs.is_empty())
    }

    /// The one-line overview, `state(count)` sorted by name.
    pub fn overview(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, jobs)| !jobs.is_empty())
            .map(|(state, jobs)| format!("{state}({})", jobs.len()))
            .collect();
        if !self.input_missing.is_empty() {
            out.push(format!("{}({})", TaskState::InputMissing, self.input_missing.len()));
        }
        out.sort();
        out
    }
}

/// The set of output targets and the traversal machinery over their
/// dependency closure.
///
pub struct SisGraph {
    session: Arc<Session>,
    targets: Mutex<Vec<Arc<Target>>>,
    active_targets: Mutex<Vec<Arc<Target>>>,
    used_output_paths: Mutex<BTreeSet<String>>,
    pool: OnceCell<ThreadPool>,
}

impl SisGraph {
    pub fn new(session: Arc<Session>) -> SisGraph {
        SisGraph {
            session,
            targets: Mutex::new(Vec::new()),
            active_targets: Mutex::new(Vec::new()),
            used_output_paths: Mutex::new(BTreeSet::new()),
            pool: OnceCell::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn pool(&self) -> &ThreadPool {
        self.pool.get_or_init(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.session.settings().graph_workers)
                .thread_name(|i| format!("graph-{i}"))
                .build()
                .expect("graph worker pool")
        })
    }

    // ----- targets

    pub fn add_target(&self, target: Target) -> Arc<Target> {
        let target = Arc::new(target);
        {
            let mut used = self.used_output_paths.lock().unwrap();
            if !used.insert(target.name().to_string()) {
                tracing::warn!("output path is used more than once: {}", target.name());
            }
        }
        self.targets.lock().unwrap().push(target.clone());
        if !target.is_done() {
            self.active_targets.lock().unwrap().push(target.clone());
        }
        target
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.lock().unwrap().clone()
    }

    pub fn active_targets(&self) -> Vec<Arc<Target>> {
        self.active_targets.lock().unwrap().clone()
    }

    pub fn remove_from_active_targets(&self, name: &str) {
        self.active_targets.lock().unwrap().retain(|t| t.name() != name);
    }

    /// The jobs creating the targets' required paths.
    fn default_nodes(&self) -> Vec<Arc<Job>> {
        let mut nodes = Vec::new();
        for target in self.targets() {
            for path in target.required_full_list() {
                if let Some(job) = path.creator().job() {
                    nodes.push(job);
                }
            }
        }
        nodes
    }

    // ----- traversal

    /// Run `f` for every node reachable from `nodes` (default: all
    /// target roots).  Top-down expansion stops below a node whose `f`
    /// returns false; bottom-up always expands and applies `f` on the way.
    /// Returns the visited job ids.
    ///
    pub fn for_all_nodes<F>(
        &self,
        f: &F,
        nodes: Option<Vec<Arc<Job>>>,
        bottom_up: bool,
    ) -> BTreeSet<String>
    where
        F: Fn(&Arc<Job>) -> bool + Send + Sync,
    {
        let roots = nodes.unwrap_or_else(|| self.default_nodes());
        let visited: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());
        self.pool().scope(|s| {
            for job in roots {
                visit(s, job, f, &visited, bottom_up);
            }
        });
        visited.into_inner().unwrap()
    }

    /// Walk everything once, forcing dynamic input expansion.
    pub fn update_nodes(&self) {
        let start = Instant::now();
        self.for_all_nodes(
            &|job| {
                job.runnable();
                true
            },
            None,
            false,
        );
        debug!("all graph nodes updated (time needed: {:.2?})", start.elapsed());
    }

    /// All reachable jobs.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        let out: Mutex<Vec<Arc<Job>>> = Mutex::new(Vec::new());
        self.for_all_nodes(
            &|job| {
                out.lock().unwrap().push(job.clone());
                true
            },
            None,
            false,
        );
        out.into_inner().unwrap()
    }

    /// Jobs and paths matching a substring, for the console.
    pub fn find(&self, pattern: &str) -> Vec<String> {
        let mut out = Vec::new();
        for job in self.jobs() {
            if job.id().contains(pattern) {
                out.push(job.id().to_string());
            }
            for p in job.inputs() {
                let s = p.to_string();
                if s.contains(pattern) {
                    out.push(s);
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Partition every reachable job by its current state.
    ///
    #[tracing::instrument(skip_all)]
    pub fn get_jobs_by_status(
        &self,
        engine: Option<&dyn Engine>,
        skip_finished: bool,
    ) -> StatusMap {
        let states: Mutex<StatusMap> = Mutex::new(StatusMap::default());

        let classify = |job: &Arc<Job>| -> bool {
            let new_state = if job.runnable() {
                if job.is_setup() {
                    if job.finished() {
                        if skip_finished {
                            return false;
                        }
                        TaskState::Finished
                    } else {
                        let mut state = None;
                        if let Ok(tasks) = job.tasks() {
                            for task in tasks {
                                if !task.finished(None) {
                                    state = Some(task.state(engine, None, false));
                                    break;
                                }
                            }
                        }
                        match state {
                            Some(s) => s,
                            // finished since the previous check
                            None => {
                                if skip_finished {
                                    return false;
                                }
                                TaskState::Finished
                            }
                        }
                    }
                } else {
                    TaskState::Runnable
                }
            } else {
                TaskState::Waiting
            };

            let mut map = states.lock().unwrap();
            for input in job.inputs() {
                if input.creator_id().is_none() {
                    let path = input.get_path().to_string_lossy().into_owned();
                    if input.available() {
                        map.input_paths.insert(path);
                    } else {
                        map.input_missing.insert(path);
                    }
                }
            }
            map.insert(new_state, job.clone());
            true
        };

        self.for_all_nodes(&classify, None, false);
        states.into_inner().unwrap()
    }

    /// Tag every job with the targets it is needed for, to make the
    /// status listing more informative.
    ///
    pub fn set_job_targets(&self) {
        self.for_all_nodes(
            &|job| {
                job.clear_needed_for();
                true
            },
            None,
            false,
        );
        for target in self.targets() {
            let name = target.name().to_string();
            let roots: Vec<Arc<Job>> = target
                .required_full_list()
                .iter()
                .filter_map(|p| p.creator().job())
                .collect();
            if roots.is_empty() {
                continue;
            }
            info!("add target {name} to jobs");
            self.for_all_nodes(
                &|job| {
                    job.mark_needed_for(&name);
                    true
                },
                Some(roots),
                false,
            );
        }
    }
}

/// Claim the job in the visited table, then process it on the pool.
///
fn visit<'a, F>(
    s: &rayon::Scope<'a>,
    job: Arc<Job>,
    f: &'a F,
    visited: &'a Mutex<BTreeSet<String>>,
    bottom_up: bool,
) where
    F: Fn(&Arc<Job>) -> bool + Send + Sync,
{
    {
        let mut seen = visited.lock().unwrap();
        if !seen.insert(job.id().to_string()) {
            return;
        }
    }
    s.spawn(move |s| {
        // make sure dynamic inputs are up to date before looking at them
        job.runnable();
        if bottom_up {
            for path in job.inputs() {
                if let Some(creator) = path.creator().job() {
                    visit(s, creator, f, visited, bottom_up);
                }
            }
            f(&job);
        } else if f(&job) {
            for path in job.inputs() {
                if let Some(creator) = path.creator().job() {
                    visit(s, creator, f, visited, bottom_up);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{out_of, session_in, TestRecipe};

    fn chain_graph(base: &std::path::Path) -> (Arc<Session>, SisGraph, Arc<Job>, Arc<Job>) {
        let session = session_in(base);
        let corpus = base.join("input_text.gz");
        let inner = session
            .job(TestRecipe::input(crate::paths::SisPath::external(corpus.to_str().unwrap())))
            .unwrap();
        let outer = session.job(TestRecipe::input(out_of(&inner))).unwrap();
        let graph = SisGraph::new(session.clone());
        graph.add_target(Target::output_path("result.gz", out_of(&outer)));
        (session, graph, inner, outer)
    }

    #[test]
    fn test_traversal_visits_each_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_session, graph, inner, outer) = chain_graph(dir.path());

        let count = Mutex::new(0usize);
        let visited = graph.for_all_nodes(
            &|_| {
                *count.lock().unwrap() += 1;
                true
            },
            None,
            false,
        );
        assert_eq!(2, visited.len());
        assert_eq!(2, *count.lock().unwrap());
        assert!(visited.contains(inner.id()));
        assert!(visited.contains(outer.id()));
    }

    #[test]
    fn test_status_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (_session, graph, inner, outer) = chain_graph(dir.path());

        // the inner job waits for its external input, the outer one for
        // the inner job
        let states = graph.get_jobs_by_status(None, false);
        assert_eq!(2, states.get(TaskState::Waiting).len());
        assert!(states.input_missing.iter().any(|p| p.ends_with("input_text.gz")));

        // materialize the external input: the inner job becomes runnable
        std::fs::write(dir.path().join("input_text.gz"), "text").unwrap();
        let states = graph.get_jobs_by_status(None, false);
        let runnable: Vec<String> =
            states.get(TaskState::Runnable).iter().map(|j| j.id().to_string()).collect();
        assert!(runnable.contains(&inner.id().to_string()));
        let waiting: Vec<String> =
            states.get(TaskState::Waiting).iter().map(|j| j.id().to_string()).collect();
        assert!(waiting.contains(&outer.id().to_string()));
    }

    #[test]
    fn test_overview_format() {
        let mut map = StatusMap::default();
        map.input_missing.insert("corpus.gz".into());
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("a")).unwrap();
        map.insert(TaskState::Waiting, job);
        assert_eq!(vec!["input_missing(1)".to_string(), "waiting(1)".to_string()], map.overview());
    }
}
