//! The per-config-load job registry.
//!
//! A session owns every job built while loading a pipeline description
//! and enforces the core identity rule: same construction arguments,
//! same job instance.  It also keeps the recipe factory table used to
//! re-instantiate jobs from their `job.save` files.
//!

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::debug;

use sisyphus_common::Settings;

use crate::consts::JOB_SAVE;
use crate::error::JobError;
use crate::hash::{short_hash, DEFAULT_HASH_LENGTH};
use crate::job::{Job, JobData, Recipe};
use crate::value::{Kwargs, Value};

type RecipeFactory = Box<dyn Fn(&Kwargs) -> Result<Box<dyn Recipe>, JobError> + Send + Sync>;

/// Registry of jobs and recipe factories.
///
pub struct Session {
    settings: Arc<Settings>,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    recipes: RwLock<HashMap<String, RecipeFactory>>,
}

impl Session {
    pub fn new(settings: Settings) -> Arc<Session> {
        Arc::new(Session {
            settings: Arc::new(settings),
            jobs: RwLock::new(HashMap::new()),
            recipes: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Register a factory so jobs of this recipe can be rebuilt by name.
    ///
    pub fn register_recipe(
        &self,
        qualified_name: &str,
        factory: impl Fn(&Kwargs) -> Result<Box<dyn Recipe>, JobError> + Send + Sync + 'static,
    ) {
        self.recipes.write().unwrap().insert(qualified_name.to_string(), Box::new(factory));
    }

    /// Construct (or fetch) the job for the given recipe.  Two calls with
    /// kwargs of equal canonical hash return the same instance.
    ///
    pub fn job(&self, recipe: impl Recipe) -> Result<Arc<Job>, JobError> {
        self.job_boxed(Box::new(recipe))
    }

    pub fn job_boxed(&self, recipe: Box<dyn Recipe>) -> Result<Arc<Job>, JobError> {
        let kwargs = recipe.kwargs();
        let digest = job_digest(&kwargs, &recipe.hash_exclude(), recipe.version());
        let name = recipe.qualified_name().to_string();
        let id = format!("{name}.{digest}");

        if let Some(existing) = self.jobs.read().unwrap().get(&id) {
            debug!("reusing {id}");
            return Ok(existing.clone());
        }

        let job = Arc::new(Job::new(
            self.settings.clone(),
            recipe,
            id.clone(),
            name,
            digest,
            kwargs,
        ));
        *job.me.lock().unwrap() = Arc::downgrade(&job);

        {
            let mut jobs = self.jobs.write().unwrap();
            if let Some(raced) = jobs.get(&id) {
                return Ok(raced.clone());
            }
            jobs.insert(id, job.clone());
        }

        job.recipe.init(&job)?;
        job.init_inputs();
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.read().unwrap().values().cloned().collect()
    }

    /// Rebuild a job from its serialized form in the given directory.
    /// Known ids come back as the existing singleton.
    ///
    #[tracing::instrument(skip(self))]
    pub fn load_job(&self, job_dir: &Path) -> Result<Arc<Job>, JobError> {
        let save = job_dir.join(JOB_SAVE);
        let data: JobData = Job::load_data(&save)?;

        let factory_guard = self.recipes.read().unwrap();
        let factory = factory_guard
            .get(&data.recipe)
            .ok_or_else(|| JobError::UnknownRecipe(data.recipe.clone()))?;

        let kwargs: Kwargs = data
            .kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into_value(&self.settings.work_dir)))
            .collect();
        let recipe = factory(&kwargs)?;
        drop(factory_guard);

        let job = self.job_boxed(recipe)?;
        job.restore_outputs(&data)?;

        let expected = job_dir.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(dirname) = expected {
            if !job.id().ends_with(&dirname) {
                debug!("job id {} does not match directory {dirname}", job.id());
            }
        }
        Ok(job)
    }
}

/// The job digest: canonical hash of the kwargs record, after applying
/// the hash-exclude policy and folding in the recipe version.
///
pub fn job_digest(kwargs: &Kwargs, exclude: &Kwargs, version: Option<i64>) -> String {
    let filtered: Vec<(Value, Value)> = kwargs
        .iter()
        .filter(|(k, v)| exclude.get(k.as_str()) != Some(v))
        .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
        .collect();
    let d = Value::Map(filtered);
    let hashed = match version {
        None => d,
        Some(v) => Value::Tuple(vec![d, Value::Int(v)]),
    };
    short_hash(&hashed, DEFAULT_HASH_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{session_in, TestRecipe};

    #[test]
    fn test_same_kwargs_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let a = session.job(TestRecipe::text("input_text.gz")).unwrap();
        let b = session.job(TestRecipe::text("input_text.gz")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = session.job(TestRecipe::text("other.gz")).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_job_identifier_shape() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("input_text.gz")).unwrap();
        assert!(job.id().starts_with("task/test/Test."));
        assert_eq!(12, job.digest().len());
        // digest is a pure function of the kwargs
        let again = session.job(TestRecipe::text("input_text.gz")).unwrap();
        assert_eq!(job.id(), again.id());
    }

    #[test]
    fn test_hash_exclude_keeps_old_digests() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());

        // omitted kwarg and the ignored value share one id
        let plain = session.job(TestRecipe::text("a.gz")).unwrap();
        let same = session.job(TestRecipe::text("a.gz").compression(0)).unwrap();
        assert_eq!(plain.id(), same.id());

        // any other value changes the id
        let other = session.job(TestRecipe::text("a.gz").compression(9)).unwrap();
        assert_ne!(plain.id(), other.id());
    }

    #[test]
    fn test_version_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let v0 = session.job(TestRecipe::text("a.gz")).unwrap();
        let v1 = session.job(TestRecipe::text("a.gz").version(1)).unwrap();
        assert_ne!(v0.id(), v1.id());
    }

    #[test]
    fn test_directory_is_pure_function_of_id() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let job = session.job(TestRecipe::text("a.gz")).unwrap();
        assert_eq!(session.settings().work_dir.join(job.id()), job.dir());
    }

    #[test]
    fn test_save_and_reload_returns_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        TestRecipe::register(&session);

        let job = session.job(TestRecipe::text("corpus.gz")).unwrap();
        job.setup_directory().unwrap();

        let loaded = session.load_job(&job.dir()).unwrap();
        assert!(Arc::ptr_eq(&job, &loaded));
    }

    #[test]
    fn test_reload_in_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        TestRecipe::register(&session);
        let job = session.job(TestRecipe::text("corpus.gz")).unwrap();
        job.setup_directory().unwrap();
        let id = job.id().to_string();

        // a fresh registry, as the worker would see it
        let worker_session = session_in(dir.path());
        TestRecipe::register(&worker_session);
        let loaded = worker_session.load_job(&job.dir()).unwrap();
        assert_eq!(id, loaded.id());
        assert_eq!(1, loaded.outputs().len());
    }
}
