//! Shared helpers for the crate's tests.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use sisyphus_common::Settings;

use crate::error::{JobError, TaskError};
use crate::job::{Job, Recipe};
use crate::paths::SisPath;
use crate::rqmt::Rqmt;
use crate::session::Session;
use crate::task::Task;
use crate::value::{Kwargs, Value};

/// A session rooted below a scratch directory, with all wait periods
/// zeroed so marker checks do not sleep.
pub(crate) fn session_in(base: &Path) -> Arc<Session> {
    session_with(base, Settings::immediate())
}

pub(crate) fn session_with(base: &Path, settings: Settings) -> Arc<Session> {
    Session::new(settings.rooted_at(base))
}

/// The classic single-output test job: takes a text input, gzips it into
/// `out_text.gz`.
///
pub(crate) struct TestRecipe {
    pub text: Value,
    pub compression: Option<i64>,
    pub version: Option<i64>,
    pub tries: usize,
}

impl TestRecipe {
    pub fn text(text: impl Into<Value>) -> TestRecipe {
        TestRecipe { text: text.into(), compression: None, version: None, tries: 1 }
    }

    pub fn retries(mut self, tries: usize) -> TestRecipe {
        self.tries = tries;
        self
    }

    pub fn input(path: SisPath) -> TestRecipe {
        Self::text(Value::Path(path))
    }

    pub fn compression(mut self, level: i64) -> TestRecipe {
        self.compression = Some(level);
        self
    }

    pub fn version(mut self, version: i64) -> TestRecipe {
        self.version = Some(version);
        self
    }

    pub fn register(session: &Session) {
        session.register_recipe("task/test/Test", |kwargs: &Kwargs| {
            let text = kwargs
                .get("text")
                .cloned()
                .ok_or_else(|| JobError::BadKwargs {
                    recipe: "task/test/Test".into(),
                    reason: "missing text".into(),
                })?;
            let compression = kwargs.get("compression").and_then(Value::as_int);
            Ok(Box::new(TestRecipe { text, compression, version: None, tries: 1 }) as Box<dyn Recipe>)
        });
    }
}

impl Recipe for TestRecipe {
    fn qualified_name(&self) -> &str {
        "task/test/Test"
    }

    fn kwargs(&self) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("text".into(), self.text.clone());
        if let Some(c) = self.compression {
            kwargs.insert("compression".into(), Value::Int(c));
        }
        kwargs
    }

    fn version(&self) -> Option<i64> {
        self.version
    }

    fn hash_exclude(&self) -> Kwargs {
        let mut exclude = Kwargs::new();
        exclude.insert("compression".into(), Value::Int(0));
        exclude
    }

    fn init(&self, job: &Arc<Job>) -> Result<(), JobError> {
        job.output_path("out_text.gz", false, false)?;
        Ok(())
    }

    fn tasks(&self, _job: &Arc<Job>) -> Vec<Task> {
        vec![Task::new("run")
            .rqmt(Rqmt::new().with("cpu", 1).with("mem", 1.0).with("time", 1.0))
            .tries(self.tries)]
    }

    fn run(&self, job: &Arc<Job>, func: &str, _args: &[Value]) -> Result<(), TaskError> {
        match func {
            "run" => {
                let out = job.output_dir().join("out_text.gz");
                fs::write(out, b"processed")?;
                Ok(())
            }
            other => Err(TaskError::Failed(format!("no function {other}"))),
        }
    }
}

/// The produced path of a test job.
pub(crate) fn out_of(job: &Arc<Job>) -> SisPath {
    job.outputs().into_iter().next().expect("test job has one output")
}
