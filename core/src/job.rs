//! Jobs: the content-addressed vertices of the graph.
//!
//! A job owns a working directory whose name is derived from its
//! construction arguments.  Everything the manager and the workers know
//! about each other goes through files in that directory: markers, logs,
//! the submit ledger and the usage snapshot.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sisyphus_common::Settings;

use crate::consts::*;
use crate::engine::{Engine, TaskState};
use crate::error::{JobError, TaskError};
use crate::paths::{Creator, PathKind, SisPath};
use crate::task::Task;
use crate::value::{Kwargs, Value, ValueRepr};

/// Characters allowed in user aliases.
const ALIAS_CHARS: &str = "-.0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz/";

/// User job types implement this seam.  The qualified name plus the
/// kwargs record define the job's identity; the task list defines what
/// runs, in declaration order; `run` dispatches the named task function
/// inside a worker.
///
pub trait Recipe: Send + Sync + 'static {
    /// Recipe-qualified class name, e.g. `task/test/Test`.
    fn qualified_name(&self) -> &str;

    /// The construction arguments, the sole hash input.
    fn kwargs(&self) -> Kwargs;

    /// Bump to change the hash without touching the kwargs.
    fn version(&self) -> Option<i64> {
        None
    }

    /// `{key: ignored_value}`: when the kwarg equals the ignored value it
    /// is dropped before hashing, so new optional arguments keep old
    /// digests valid.
    fn hash_exclude(&self) -> Kwargs {
        Kwargs::new()
    }

    /// Called once after registration; declare outputs here.
    fn init(&self, _job: &Arc<Job>) -> Result<(), JobError> {
        Ok(())
    }

    /// The executable phases, in order.
    fn tasks(&self, job: &Arc<Job>) -> Vec<Task>;

    /// Dynamic expansion hook: runs whenever the known inputs became
    /// available and may add further inputs.  Must be monotonic and
    /// deterministic.
    fn update(&self, _job: &Arc<Job>) -> Result<(), JobError> {
        Ok(())
    }

    /// Execute one task function for one argument tuple.
    fn run(&self, job: &Arc<Job>, func: &str, args: &[Value]) -> Result<(), TaskError>;

    /// Whether the given output is present; defaults to "job finished".
    fn path_available(&self, job: &Arc<Job>, _path: &SisPath) -> bool {
        job.finished()
    }
}

/// Return true if the directory carries a finish marker or the cleanup
/// archive.
///
pub fn job_dir_finished(path: &Path) -> bool {
    path.join(JOB_FINISHED_MARKER).is_file() || path.join(JOB_FINISHED_ARCHIVE).is_file()
}

/// The unit of the graph.
///
pub struct Job {
    settings: Arc<Settings>,
    id: String,
    name: String,
    digest: String,
    kwargs: Kwargs,
    pub(crate) recipe: Box<dyn Recipe>,

    inputs: Mutex<BTreeSet<SisPath>>,
    outputs: Mutex<BTreeMap<String, SisPath>>,
    output_dirs: Mutex<BTreeSet<String>>,
    aliases: Mutex<BTreeSet<String>>,
    alias_prefixes: Mutex<BTreeSet<String>>,
    keep_value: Mutex<Option<u8>>,
    tags: BTreeSet<String>,

    /// Serializes directory setup, archiving and team-share linking.
    dir_lock: Mutex<()>,
    /// Serializes dynamic input expansion.
    update_lock: Mutex<()>,

    is_finished: AtomicBool,
    setup_since_restart: AtomicBool,
    tasks: OnceLock<Vec<Arc<Task>>>,
    needed_for_targets: Mutex<BTreeSet<String>>,

    pub(crate) me: Mutex<Weak<Job>>,
}

impl Job {
    pub(crate) fn new(
        settings: Arc<Settings>,
        recipe: Box<dyn Recipe>,
        id: String,
        name: String,
        digest: String,
        kwargs: Kwargs,
    ) -> Job {
        let mut tags = BTreeSet::new();
        let mut paths = Vec::new();
        for v in kwargs.values() {
            v.extract_paths(&mut paths);
        }
        for p in &paths {
            tags.extend(p.get_tags());
        }
        Job {
            settings,
            id,
            name,
            digest,
            kwargs,
            recipe,
            inputs: Mutex::new(BTreeSet::new()),
            outputs: Mutex::new(BTreeMap::new()),
            output_dirs: Mutex::new(BTreeSet::new()),
            aliases: Mutex::new(BTreeSet::new()),
            alias_prefixes: Mutex::new(BTreeSet::new()),
            keep_value: Mutex::new(None),
            tags,
            dir_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
            is_finished: AtomicBool::new(false),
            setup_since_restart: AtomicBool::new(false),
            tasks: OnceLock::new(),
            needed_for_targets: Mutex::new(BTreeSet::new()),
            me: Mutex::new(Weak::new()),
        }
    }

    /// Fill the input set from the kwargs record; outputs of this very
    /// job do not count as inputs.
    pub(crate) fn init_inputs(self: &Arc<Self>) {
        let mut paths = Vec::new();
        for v in self.kwargs.values() {
            v.extract_paths(&mut paths);
        }
        let mut inputs = self.inputs.lock().unwrap();
        for p in paths {
            if p.creator_id().as_deref() != Some(self.id.as_str()) {
                inputs.insert(p);
            }
        }
    }

    // ----- identity

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    fn me(&self) -> Arc<Job> {
        self.me.lock().unwrap().upgrade().expect("job outside a session")
    }

    // ----- directory layout

    /// The job directory below the work tree.
    pub fn dir(&self) -> PathBuf {
        self.settings.work_dir.join(&self.id)
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    pub fn work_path(&self) -> PathBuf {
        self.path_of(JOB_WORK_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path_of(JOB_OUTPUT)
    }

    /// `<name>.<task>.<id>` marker/log file location.
    pub fn instance_file(&self, prefix: &str, task: &str, task_id: u32) -> PathBuf {
        self.path_of(&format!("{prefix}.{task}.{task_id}"))
    }

    /// True if the file exists and is at least `min_age` old.
    pub(crate) fn check_file(&self, path: &Path, min_age: Duration) -> bool {
        match fs::metadata(path) {
            Err(_) => false,
            Ok(meta) => {
                if min_age.is_zero() {
                    return true;
                }
                match meta.modified().ok().and_then(|m| SystemTime::now().duration_since(m).ok())
                {
                    Some(age) => age > min_age,
                    None => false,
                }
            }
        }
    }

    pub fn is_setup(&self) -> bool {
        self.dir().is_dir()
    }

    // ----- inputs / outputs

    pub fn inputs(&self) -> Vec<SisPath> {
        self.inputs.lock().unwrap().iter().cloned().collect()
    }

    pub fn outputs(&self) -> Vec<SisPath> {
        self.outputs.lock().unwrap().values().cloned().collect()
    }

    /// Declare an output file.
    ///
    pub fn output_path(
        self: &Arc<Self>,
        filename: &str,
        directory: bool,
        cached: bool,
    ) -> Result<SisPath, JobError> {
        let mut p =
            SisPath::with_kind(Creator::Job(Arc::downgrade(self)), filename, PathKind::Plain);
        if cached {
            p = p.cached();
        }
        let mut outputs = self.outputs.lock().unwrap();
        if outputs.contains_key(filename) {
            return Err(JobError::DuplicateOutput(filename.to_string()));
        }
        outputs.insert(filename.to_string(), p.clone());
        if directory {
            self.output_dirs.lock().unwrap().insert(filename.to_string());
        }
        Ok(p)
    }

    /// Declare an output variable.
    ///
    pub fn output_var(
        self: &Arc<Self>,
        filename: &str,
        pickled: bool,
        backup: Option<Value>,
    ) -> Result<SisPath, JobError> {
        let p = SisPath::with_kind(
            Creator::Job(Arc::downgrade(self)),
            filename,
            PathKind::Variable { pickled, backup: backup.map(Box::new) },
        );
        let mut outputs = self.outputs.lock().unwrap();
        if outputs.contains_key(filename) {
            return Err(JobError::DuplicateOutput(filename.to_string()));
        }
        outputs.insert(filename.to_string(), p.clone());
        Ok(p)
    }

    /// Add an input after construction; used by dynamic expansion.
    ///
    pub fn add_input(&self, path: SisPath) -> SisPath {
        self.inputs.lock().unwrap().insert(path.clone());
        path
    }

    pub fn path_available(self: &Arc<Self>, path: &SisPath) -> bool {
        self.recipe.path_available(self, path)
    }

    // ----- aliases, keep value, targets

    pub fn add_alias(self: &Arc<Self>, alias: &str) -> Result<Arc<Job>, JobError> {
        if alias.is_empty() || !alias.chars().all(|c| ALIAS_CHARS.contains(c)) {
            return Err(JobError::BadAlias(alias.to_string()));
        }
        self.aliases.lock().unwrap().insert(alias.to_string());
        self.alias_prefixes
            .lock()
            .unwrap()
            .insert(self.settings.alias_and_output_subdir.clone());
        Ok(self.me())
    }

    pub fn aliases(&self) -> BTreeSet<String> {
        self.aliases.lock().unwrap().clone()
    }

    pub fn alias_prefixes(&self) -> BTreeSet<String> {
        self.alias_prefixes.lock().unwrap().clone()
    }

    pub fn one_alias(&self) -> Option<String> {
        self.aliases.lock().unwrap().iter().next().cloned()
    }

    pub fn set_keep_value(&self, value: u8) -> Result<(), JobError> {
        if value >= 100 {
            return Err(JobError::BadKeepValue(value as i64));
        }
        *self.keep_value.lock().unwrap() = Some(value);
        Ok(())
    }

    pub fn keep_value(&self) -> Option<u8> {
        *self.keep_value.lock().unwrap()
    }

    pub fn mark_needed_for(&self, target: &str) {
        self.needed_for_targets.lock().unwrap().insert(target.to_string());
    }

    pub fn needed_for_targets(&self) -> BTreeSet<String> {
        self.needed_for_targets.lock().unwrap().clone()
    }

    pub fn clear_needed_for(&self) {
        self.needed_for_targets.lock().unwrap().clear();
    }

    // ----- state

    /// True once every input is on disk; runs the dynamic expansion hook
    /// whenever the currently known inputs became available.
    ///
    pub fn runnable(self: &Arc<Self>) -> bool {
        let _guard = self.update_lock.lock().unwrap();
        loop {
            let inputs = self.inputs();
            if !inputs.iter().all(|p| p.available()) {
                return false;
            }
            let before = self.inputs.lock().unwrap().len();
            if self.recipe.update(self).is_err() {
                return false;
            }
            if self.inputs.lock().unwrap().len() == before {
                return true;
            }
            // new inputs showed up, check them too
        }
    }

    /// True once the finish marker is written, or once all tasks report
    /// finished (which writes the marker).
    ///
    pub fn finished(self: &Arc<Self>) -> bool {
        if self.is_finished.load(Ordering::SeqCst) {
            return true;
        }
        if job_dir_finished(&self.dir()) {
            self.is_finished.store(true, Ordering::SeqCst);
            return true;
        }
        if !self.is_setup() || !self.runnable() {
            return false;
        }
        let tasks = match self.tasks() {
            Ok(t) => t,
            Err(_) => return false,
        };
        if tasks.iter().any(|t| !t.finished(None)) {
            return false;
        }
        self.is_finished.store(true, Ordering::SeqCst);
        {
            let _guard = self.dir_lock.lock().unwrap();
            // not necessarily our directory, ignore permission problems
            let _ = fs::File::create(self.path_of(JOB_FINISHED_MARKER));
        }
        self.link_to_team_share_dir();
        true
    }

    pub fn state(self: &Arc<Self>, engine: Option<&dyn Engine>) -> TaskState {
        if self.is_setup() {
            if self.finished() {
                return TaskState::Finished;
            }
            if !self.runnable() {
                return TaskState::Waiting;
            }
            if let Ok(tasks) = self.tasks() {
                for task in tasks {
                    let state = task.state(engine, None, false);
                    if state != TaskState::Finished {
                        return state;
                    }
                }
            }
            TaskState::Finished
        } else if self.runnable() {
            TaskState::Runnable
        } else {
            TaskState::Waiting
        }
    }

    // ----- tasks

    /// The task list, built once.  Only runnable jobs may ask.
    ///
    pub fn tasks(self: &Arc<Self>) -> Result<&[Arc<Task>], JobError> {
        if self.tasks.get().is_none() {
            if !self.runnable() {
                return Err(JobError::NotRunnable(self.id.clone()));
            }
            let built: Vec<Arc<Task>> = self
                .recipe
                .tasks(self)
                .into_iter()
                .map(|mut t| {
                    t.set_job(Arc::downgrade(self));
                    Arc::new(t)
                })
                .collect();
            if built.is_empty() {
                return Err(JobError::NoTasks(self.id.clone()));
            }
            let _ = self.tasks.set(built);
        }
        Ok(self.tasks.get().unwrap().as_slice())
    }

    /// The first task that has not finished yet.
    ///
    pub fn next_task(self: &Arc<Self>) -> Option<Arc<Task>> {
        self.tasks().ok()?.iter().find(|t| !t.finished(None)).cloned()
    }

    /// Dispatch one task function, used by the worker.
    pub fn run_task_function(
        self: &Arc<Self>,
        func: &str,
        args: &[Value],
    ) -> Result<(), TaskError> {
        self.recipe.run(self, func, args)
    }

    pub fn find_task(self: &Arc<Self>, name: &str) -> Result<Arc<Task>, TaskError> {
        let tasks = self.tasks().map_err(|e| TaskError::Failed(e.to_string()))?;
        tasks.iter().find(|t| t.name() == name).cloned().ok_or_else(|| TaskError::NoSuchTask {
            wanted: name.to_string(),
            available: tasks.iter().map(|t| t.name().to_string()).collect(),
        })
    }

    // ----- directory setup

    pub fn setup_since_restart(&self) -> bool {
        self.setup_since_restart.load(Ordering::SeqCst)
    }

    /// Materialize the working directory: subdirectories, input links,
    /// the serialized job and the info file.
    ///
    #[tracing::instrument(skip(self), fields(job = %self.id))]
    pub fn setup_directory(self: &Arc<Self>) -> Result<(), JobError> {
        let _guard = self.dir_lock.lock().unwrap();
        let base = self.dir();

        if base.is_symlink() && !base.exists() {
            warn!("removing broken link {}", base.display());
            fs::remove_file(&base).map_err(|e| self.setup_err(e))?;
        }

        for dirname in [JOB_WORK_DIR, JOB_OUTPUT, JOB_INPUT, JOB_LOG_ENGINE] {
            fs::create_dir_all(base.join(dirname)).map_err(|e| self.setup_err(e))?;
        }
        for dirname in self.output_dirs.lock().unwrap().iter() {
            fs::create_dir_all(base.join(JOB_OUTPUT).join(dirname))
                .map_err(|e| self.setup_err(e))?;
        }

        // link input jobs, directory structure flattened
        for input in self.inputs() {
            if let Some(creator_id) = input.creator_id() {
                let link_name = base.join(JOB_INPUT).join(creator_id.replace('/', "_"));
                let creator_dir = match input.creator() {
                    Creator::Job(w) => w.upgrade().map(|j| j.dir()),
                    Creator::Detached { dir, .. } => Some(dir.clone()),
                    Creator::None => None,
                };
                if let Some(target) = creator_dir {
                    if !link_name.exists() {
                        let target = target.canonicalize().unwrap_or(target);
                        let _ = std::os::unix::fs::symlink(&target, &link_name);
                    }
                }
            }
        }

        if !base.join(JOB_SAVE).is_file() {
            self.save()?;
        }
        self.write_info()?;
        self.setup_since_restart.store(true, Ordering::SeqCst);
        debug!("set up {}", self.id);
        Ok(())
    }

    fn setup_err(&self, e: std::io::Error) -> JobError {
        JobError::Setup { id: self.id.clone(), source: e }
    }

    fn write_info(&self) -> Result<(), JobError> {
        let mut f = fs::File::create(self.path_of(JOB_INFO))?;
        for tag in &self.tags {
            writeln!(f, "TAG: {tag}")?;
        }
        for input in self.inputs() {
            writeln!(f, "INPUT: {input}")?;
        }
        for (key, value) in &self.kwargs {
            writeln!(f, "PARAMETER: {key}: {}", crate::literal::repr_value(value))?;
        }
        for alias in self.aliases() {
            writeln!(f, "ALIAS: {alias}")?;
        }
        Ok(())
    }

    /// Serialize to `job.save` (gzipped JSON).
    ///
    pub fn save(&self) -> Result<(), JobError> {
        let data = JobData::from_job(self);
        let f = fs::File::create(self.path_of(JOB_SAVE))?;
        let mut enc = GzEncoder::new(f, Compression::default());
        let text = serde_json::to_string(&data)
            .map_err(|e| JobError::Load(self.path_of(JOB_SAVE), e.to_string()))?;
        enc.write_all(text.as_bytes())?;
        enc.finish()?;
        Ok(())
    }

    pub(crate) fn load_data(path: &Path) -> Result<JobData, JobError> {
        let f = fs::File::open(path)?;
        let mut text = String::new();
        GzDecoder::new(f)
            .read_to_string(&mut text)
            .map_err(|e| JobError::Load(path.to_path_buf(), e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| JobError::Load(path.to_path_buf(), e.to_string()))
    }

    /// Restore the declared outputs after a reload.
    pub(crate) fn restore_outputs(self: &Arc<Self>, data: &JobData) -> Result<(), JobError> {
        for out in &data.outputs {
            let already = self.outputs.lock().unwrap().contains_key(&out.name);
            if already {
                continue;
            }
            match &out.variable {
                None => {
                    self.output_path(&out.name, out.directory, out.cached)?;
                }
                Some(v) => {
                    self.output_var(&out.name, v.pickled, None)?;
                }
            }
        }
        for alias in &data.aliases {
            let _ = self.add_alias(alias);
        }
        if let Some(kv) = data.keep_value {
            let _ = self.set_keep_value(kv);
        }
        Ok(())
    }

    // ----- cleanup & recovery

    fn link_to_team_share_dir(&self) {
        let Some(team_dir) = &self.settings.team_share_dir else {
            return;
        };
        let local = self.dir();
        let team = team_dir.join(&self.id);
        if !local.is_symlink() && !team.is_dir() {
            let _guard = self.dir_lock.lock().unwrap();
            if let Some(parent) = team.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if !team.exists() {
                let target = local.canonicalize().unwrap_or(local);
                let _ = std::os::unix::fs::symlink(target, &team);
            }
        }
    }

    /// Finished but not archived yet.
    pub fn cleanable(self: &Arc<Self>) -> bool {
        !self.path_of(JOB_FINISHED_ARCHIVE).is_file() && self.finished()
    }

    /// Archive the directory: everything except `output/` (and `info`)
    /// moves into `finished.tar.gz`, the scratch dir is dropped.
    ///
    pub fn cleanup(self: &Arc<Self>) -> Result<(), JobError> {
        if self.path_of(JOB_FINISHED_ARCHIVE).is_file() {
            return Ok(());
        }
        info!("clean up: {}", self.dir().display());
        let _guard = self.dir_lock.lock().unwrap();
        let base = self.dir().canonicalize()?;

        if !self.settings.job_cleanup_keep_work {
            let work = base.join(JOB_WORK_DIR);
            if work.is_dir() {
                fs::remove_dir_all(&work)?;
            }
        }
        let files: Vec<String> = fs::read_dir(&base)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n != JOB_OUTPUT && n != JOB_INFO && n != JOB_WORK_DIR)
            .collect();
        if files.is_empty() {
            return Ok(());
        }
        let status = Command::new("tar")
            .arg("-czf")
            .arg(JOB_FINISHED_ARCHIVE)
            .args(&files)
            .current_dir(&base)
            .status()?;
        if !status.success() {
            warn!("could not archive {}", base.display());
            return Ok(());
        }
        for name in &files {
            let p = base.join(name);
            let res = if p.is_dir() { fs::remove_dir_all(&p) } else { fs::remove_file(&p) };
            if let Err(e) = res {
                warn!("could not clean up {}: {e}", p.display());
            }
        }
        Ok(())
    }

    /// Move the directory aside (`.cleared.NNNN`, dense numbering) and
    /// set up a fresh one.
    ///
    pub fn move_aside(self: &Arc<Self>) -> Result<(), JobError> {
        let path = self.dir();
        let dirname = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let trash = (1..)
            .map(|i| path.with_file_name(format!("{dirname}.cleared.{i:04}")))
            .find(|p| !p.is_dir())
            .unwrap();
        info!("move: {} to {}", path.display(), trash.display());
        fs::rename(&path, &trash)?;
        self.is_finished.store(false, Ordering::SeqCst);
        self.setup_directory()?;
        if let Ok(tasks) = self.tasks() {
            tasks.iter().for_each(|t| t.reset_cache());
        }
        Ok(())
    }

    /// Delete the whole directory.
    pub fn delete(&self) -> Result<(), JobError> {
        let path = self.dir();
        info!("delete: {}", path.display());
        match fs::remove_dir_all(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("not found: {}", path.display());
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self.name.rsplit('/').next().unwrap_or(&self.name);
        match self.one_alias() {
            Some(alias) => write!(f, "{class}<{}/{alias}>", self.settings.alias_dir.display()),
            None => write!(f, "{class}<{}>", self.dir().display()),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

// ----- serialized form

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct OutputData {
    pub name: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub variable: Option<crate::value::VariableRepr>,
}

/// What lands in `job.save`: enough to rebuild the job by name through
/// the recipe registry.
///
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct JobData {
    pub recipe: String,
    pub kwargs: BTreeMap<String, ValueRepr>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub keep_value: Option<u8>,
    #[serde(default)]
    pub outputs: Vec<OutputData>,
}

impl JobData {
    fn from_job(job: &Job) -> JobData {
        let outputs = job
            .outputs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, p)| OutputData {
                name: name.clone(),
                directory: job.output_dirs.lock().unwrap().contains(name),
                cached: p.is_cached(),
                variable: match p.kind() {
                    PathKind::Plain => None,
                    PathKind::Variable { pickled, .. } => {
                        Some(crate::value::VariableRepr { pickled: *pickled })
                    }
                },
            })
            .collect();
        JobData {
            recipe: job.name.clone(),
            kwargs: job
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), ValueRepr::from_value(v)))
                .collect(),
            aliases: job.aliases().into_iter().collect(),
            keep_value: job.keep_value(),
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread::sleep;
    use std::time::Duration;

    use sisyphus_common::Settings;

    use super::*;
    use crate::testutil::{out_of, session_in, session_with, TestRecipe};

    #[test]
    fn test_setup_creates_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());

        let inner = session.job(TestRecipe::text("input_text.gz")).unwrap();
        let outer = session.job(TestRecipe::input(out_of(&inner))).unwrap();

        inner.setup_directory().unwrap();
        outer.setup_directory().unwrap();

        for job in [&inner, &outer] {
            let base = job.dir();
            for sub in [JOB_WORK_DIR, JOB_OUTPUT, JOB_INPUT, JOB_LOG_ENGINE] {
                assert!(base.join(sub).is_dir(), "{sub} missing for {}", job.id());
            }
            assert!(base.join(JOB_INFO).is_file());
            assert!(base.join(JOB_SAVE).is_file());
        }

        // the outer job links its creator directory below input/
        let link = outer.dir().join(JOB_INPUT).join(inner.id().replace('/', "_"));
        assert!(link.is_symlink());
        assert_eq!(
            inner.dir().canonicalize().unwrap(),
            link.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_info_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("corpus.gz")).unwrap();
        job.add_alias("nightly/corpus").unwrap();
        job.setup_directory().unwrap();

        let info = fs::read_to_string(job.path_of(JOB_INFO)).unwrap();
        assert!(info.contains("PARAMETER: text: 'corpus.gz'"), "{info}");
        assert!(info.contains("ALIAS: nightly/corpus"), "{info}");
    }

    #[test]
    fn test_fresh_finish_marker_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            wait_period_job_fs_sync: 1,
            wait_period_job_cleanup: 0,
            ..Settings::immediate()
        };
        let session = session_with(dir.path(), settings);
        let job = session.job(TestRecipe::text("x")).unwrap();
        job.setup_directory().unwrap();

        let task = job.tasks().unwrap()[0].clone();
        task.set_finished(1).unwrap();
        assert!(!task.finished(None), "marker too young to count");
        sleep(Duration::from_millis(1200));
        assert!(task.finished(None));
    }

    #[test]
    fn test_job_finished_via_tasks_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("x")).unwrap();
        job.setup_directory().unwrap();
        assert!(!job.finished());

        let task = job.tasks().unwrap()[0].clone();
        task.set_finished(1).unwrap();
        assert!(job.finished());
        assert!(job.path_of(JOB_FINISHED_MARKER).is_file());
        // outputs become available with the job
        assert!(out_of(&job).available());
    }

    #[test]
    fn test_error_log_rotation_is_dense() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("x").retries(3)).unwrap();
        job.setup_directory().unwrap();
        let task = job.tasks().unwrap()[0].clone();

        // two interrupted attempts rotate into a dense prefix
        for expected in ["log.run.1.error.01", "log.run.1.error.02"] {
            fs::write(task.log_path(1), "boom").unwrap();
            task.set_error(1).unwrap();
            assert!(!task.error(None), "tries left, marker must clear");
            assert!(job.path_of(expected).is_file(), "{expected}");
        }

        // the last try sticks as an error
        fs::write(task.log_path(1), "boom").unwrap();
        task.set_error(1).unwrap();
        assert!(task.error(None));
    }

    #[test]
    fn test_move_aside_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("x")).unwrap();
        job.setup_directory().unwrap();
        fs::write(job.path_of("marker"), "old run").unwrap();

        job.move_aside().unwrap();
        let cleared = PathBuf::from(format!("{}.cleared.0001", job.dir().display()));
        assert!(cleared.is_dir());
        assert!(cleared.join("marker").is_file());
        // and the directory was set up again
        assert!(job.path_of(JOB_SAVE).is_file());
    }

    #[test]
    fn test_keep_value_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("x")).unwrap();
        assert!(job.keep_value().is_none());
        job.set_keep_value(20).unwrap();
        assert_eq!(Some(20), job.keep_value());
        assert!(job.set_keep_value(100).is_err());
    }

    #[test]
    fn test_cleanup_archives_everything_but_output() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("x")).unwrap();
        job.setup_directory().unwrap();
        let task = job.tasks().unwrap()[0].clone();
        task.set_finished(1).unwrap();
        fs::write(job.output_dir().join("out_text.gz"), "data").unwrap();
        assert!(job.cleanable());

        job.cleanup().unwrap();
        assert!(job.path_of(JOB_FINISHED_ARCHIVE).is_file());
        assert!(job.output_dir().join("out_text.gz").is_file());
        assert!(!job.work_path().exists());
        assert!(!job.path_of(JOB_SAVE).exists());
        assert!(!job.cleanable());
    }

    struct Expanding {
        first: SisPath,
        second: SisPath,
    }

    impl Recipe for Expanding {
        fn qualified_name(&self) -> &str {
            "task/test/Expanding"
        }

        fn kwargs(&self) -> Kwargs {
            let mut kwargs = Kwargs::new();
            kwargs.insert("first".into(), Value::Path(self.first.clone()));
            kwargs.insert("second".into(), Value::Str(self.second.rel_name().into()));
            kwargs
        }

        fn init(&self, job: &Arc<Job>) -> Result<(), JobError> {
            job.output_path("done", false, false)?;
            Ok(())
        }

        fn tasks(&self, _job: &Arc<Job>) -> Vec<Task> {
            vec![Task::new("run")]
        }

        fn update(&self, job: &Arc<Job>) -> Result<(), JobError> {
            // fan-out only known once the first input can be read
            if self.first.available() {
                job.add_input(self.second.clone());
            }
            Ok(())
        }

        fn run(&self, _job: &Arc<Job>, _func: &str, _args: &[Value]) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn test_dynamic_expansion_converges() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        let job = session
            .job(Expanding {
                first: SisPath::external(first.to_str().unwrap()),
                second: SisPath::external(second.to_str().unwrap()),
            })
            .unwrap();

        assert_eq!(1, job.inputs().len());
        assert!(!job.runnable());

        // first input appears: update() discovers the second one
        fs::write(&first, "x").unwrap();
        assert!(!job.runnable());
        assert_eq!(2, job.inputs().len());

        fs::write(&second, "y").unwrap();
        assert!(job.runnable());
        // repeated checks stay converged
        assert!(job.runnable());
        assert_eq!(2, job.inputs().len());
    }
}
