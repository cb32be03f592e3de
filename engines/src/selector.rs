//! The engine selector: routes each task to a named sub-engine.
//!

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use sisyphus_common::{EngineConfig, Settings};
use sisyphus_core::{
    Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId, CMD_WORKER,
};

use crate::cluster::{AwsBatchEngine, GridEngine, LsfEngine, PbsEngine, SlurmEngine};
use crate::local::LocalEngine;

/// A composite engine holding a named map of sub-engines and a default
/// route.  Tasks marked `mini` go to `"short"`.
///
pub struct EngineSelector {
    engines: BTreeMap<String, Arc<dyn Engine>>,
    default_engine: String,
}

impl EngineSelector {
    pub fn new(
        engines: BTreeMap<String, Arc<dyn Engine>>,
        default_engine: &str,
    ) -> Result<EngineSelector, EngineError> {
        if !engines.contains_key(default_engine) {
            return Err(EngineError::UnknownSelector(default_engine.to_string()));
        }
        Ok(EngineSelector { engines, default_engine: default_engine.to_string() })
    }

    /// Build the whole engine table from the settings file.
    ///
    pub fn from_settings(settings: &Arc<Settings>) -> Result<EngineSelector, EngineError> {
        let mut engines: BTreeMap<String, Arc<dyn Engine>> = BTreeMap::new();
        for (name, config) in &settings.engine.engines {
            let engine: Arc<dyn Engine> = match config {
                EngineConfig::Local { cpu, gpu, mem } => {
                    Arc::new(LocalEngine::new(*cpu, *gpu, *mem))
                }
                EngineConfig::Slurm { gateway, memory_allocation, default_rqmt } => {
                    Arc::new(SlurmEngine::new(
                        settings.clone(),
                        gateway.clone(),
                        *memory_allocation,
                        default_to_rqmt(default_rqmt),
                    ))
                }
                EngineConfig::GridEngine { gateway, parallel_environment, default_rqmt } => {
                    Arc::new(GridEngine::new(
                        settings.clone(),
                        gateway.clone(),
                        parallel_environment.clone(),
                        default_to_rqmt(default_rqmt),
                    ))
                }
                EngineConfig::Lsf { gateway, default_rqmt } => Arc::new(LsfEngine::new(
                    settings.clone(),
                    gateway.clone(),
                    default_to_rqmt(default_rqmt),
                )),
                EngineConfig::Pbs { gateway, default_rqmt } => Arc::new(PbsEngine::new(
                    settings.clone(),
                    gateway.clone(),
                    default_to_rqmt(default_rqmt),
                )),
                EngineConfig::AwsBatch { job_queue, job_definition, default_rqmt } => {
                    Arc::new(AwsBatchEngine::new(
                        settings.clone(),
                        job_queue.clone(),
                        job_definition.clone(),
                        default_to_rqmt(default_rqmt),
                    ))
                }
            };
            engines.insert(name.clone(), engine);
        }
        EngineSelector::new(engines, &settings.engine.default)
    }

    fn select(&self, rqmt: &Rqmt) -> Result<&Arc<dyn Engine>, EngineError> {
        let name = rqmt.engine_name().unwrap_or(&self.default_engine);
        self.engines.get(name).ok_or_else(|| EngineError::UnknownSelector(name.to_string()))
    }

    fn select_for_task(&self, task: &Task) -> Result<&Arc<dyn Engine>, EngineError> {
        self.select(&task.declared_rqmt())
    }

    /// Apply `f` to every distinct sub-engine exactly once.
    fn for_all_engines(
        &self,
        mut f: impl FnMut(&Arc<dyn Engine>) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let mut seen: Vec<*const dyn Engine> = Vec::new();
        for engine in self.engines.values() {
            let ptr = Arc::as_ptr(engine);
            if seen.iter().any(|p| std::ptr::eq(*p, ptr)) {
                continue;
            }
            seen.push(ptr);
            f(engine)?;
        }
        Ok(())
    }
}

fn default_to_rqmt(d: &sisyphus_common::DefaultRqmt) -> Rqmt {
    Rqmt::new()
        .with("cpu", d.cpu as i64)
        .with("gpu", d.gpu as i64)
        .with("mem", d.mem)
        .with("time", d.time)
}

impl Engine for EngineSelector {
    fn name(&self) -> &'static str {
        "selector"
    }

    fn start_engine(&self) -> Result<(), EngineError> {
        self.for_all_engines(|e| e.start_engine())
    }

    fn stop_engine(&self) -> Result<(), EngineError> {
        self.for_all_engines(|e| e.stop_engine())
    }

    fn reset_cache(&self) {
        let _ = self.for_all_engines(|e| {
            e.reset_cache();
            Ok(())
        });
    }

    fn get_default_rqmt(&self, task: &Task) -> Rqmt {
        match self.select_for_task(task) {
            Ok(engine) => engine.get_default_rqmt(task),
            Err(_) => Rqmt::new(),
        }
    }

    fn task_state(&self, task: &Task, task_id: TaskId) -> EngineState {
        match self.select_for_task(task) {
            Ok(engine) => engine.task_state(task, task_id),
            Err(_) => EngineState::Unknown,
        }
    }

    /// Route by the rqmt's `engine` key and record the route in the
    /// worker call, so the worker asks the right backend for its task id.
    ///
    fn submit_call(
        &self,
        call: &[String],
        logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        task_name: &str,
        task_ids: &[TaskId],
    ) -> Result<SubmitResult, EngineError> {
        let selector = rqmt.engine_name().unwrap_or(&self.default_engine).to_string();
        let engine = self.select(rqmt)?;
        debug!("routing {name} to {selector}");

        let mut new_call = Vec::with_capacity(call.len() + 2);
        let mut added = false;
        for part in call {
            new_call.push(part.clone());
            if !added && part == CMD_WORKER {
                new_call.push("--engine".to_string());
                new_call.push(selector.clone());
                added = true;
            }
        }
        engine.submit_call(&new_call, logpath, rqmt, name, task_name, task_ids)
    }

    fn get_task_id(&self, passed: Option<TaskId>) -> TaskId {
        passed.unwrap_or(1)
    }

    fn sub_engine(&self, name: &str) -> Option<&dyn Engine> {
        self.engines.get(name).map(|e| e.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings_builds_default_table() {
        let settings = Arc::new(Settings::immediate());
        let selector = EngineSelector::from_settings(&settings).unwrap();
        assert!(selector.sub_engine("local").is_some());
        assert!(selector.sub_engine("missing").is_none());
    }

    #[test]
    fn test_unknown_default_is_rejected() {
        let engines: BTreeMap<String, Arc<dyn Engine>> = BTreeMap::new();
        assert!(matches!(
            EngineSelector::new(engines, "long"),
            Err(EngineError::UnknownSelector(_))
        ));
    }

    #[test]
    fn test_worker_call_gains_engine_flag() {
        let settings = Arc::new(Settings::immediate());
        let selector = EngineSelector::from_settings(&settings).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let call: Vec<String> =
            ["sis", "worker", "work/task/test/Test.abc", "run"].map(str::to_string).to_vec();
        let rqmt = Rqmt::new().with("cpu", 1);
        selector
            .submit_call(&call, dir.path(), &rqmt, "n.run", "run", &[1])
            .unwrap();

        // the queued call carries the route
        let local = selector.sub_engine("local").unwrap();
        assert_eq!("local", local.name());
    }
}
