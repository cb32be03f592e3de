//! Submission discipline over a stub backend: requirement bucketing,
//! ledger records and escalation along the submit history.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::json;

use sisyphus_common::Settings;
use sisyphus_core::{
    submit_task, Engine, EngineError, EngineState, Job, JobError, Kwargs, Recipe, ResourceSample,
    Rqmt, Session, SubmitResult, Task, TaskError, TaskId, Usage, Value,
};

struct SplitRecipe {
    lines: Vec<i64>,
}

impl Recipe for SplitRecipe {
    fn qualified_name(&self) -> &str {
        "corpus/SplitCorpus"
    }

    fn kwargs(&self) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert(
            "lines".into(),
            Value::List(self.lines.iter().map(|i| Value::Int(*i)).collect()),
        );
        kwargs
    }

    fn init(&self, job: &Arc<Job>) -> Result<(), JobError> {
        job.output_path("parts", true, false)?;
        Ok(())
    }

    fn tasks(&self, _job: &Arc<Job>) -> Vec<Task> {
        let args: Vec<Value> = self.lines.iter().map(|i| Value::Int(*i)).collect();
        vec![Task::new("split")
            .resume("split")
            .args(args)
            .parallel(3)
            .rqmt(Rqmt::new().with("cpu", 1).with("mem", 4.0).with("time", 1.0))]
    }

    fn run(&self, _job: &Arc<Job>, _func: &str, _args: &[Value]) -> Result<(), TaskError> {
        Ok(())
    }
}

#[derive(Default)]
struct StubEngine {
    calls: Mutex<Vec<(Rqmt, Vec<TaskId>)>>,
}

impl Engine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn get_default_rqmt(&self, _task: &Task) -> Rqmt {
        Rqmt::new().with("cpu", 1).with("mem", 1.0).with("time", 1.0)
    }

    fn task_state(&self, _task: &Task, _task_id: TaskId) -> EngineState {
        EngineState::Unknown
    }

    fn submit_call(
        &self,
        _call: &[String],
        _logpath: &Path,
        rqmt: &Rqmt,
        _name: &str,
        _task_name: &str,
        task_ids: &[TaskId],
    ) -> Result<SubmitResult, EngineError> {
        self.calls.lock().unwrap().push((rqmt.clone(), task_ids.to_vec()));
        Ok(SubmitResult { engine_name: "stub".to_string(), engine_info: json!("node01") })
    }
}

fn split_job_with(dir: &Path, settings: Settings) -> (Arc<Session>, Arc<Job>) {
    let session = Session::new(settings.rooted_at(dir));
    let job = session.job(SplitRecipe { lines: vec![1, 2, 3, 4, 5, 6, 7] }).unwrap();
    job.setup_directory().unwrap();
    (session, job)
}

fn split_job(dir: &Path) -> (Arc<Session>, Arc<Job>) {
    split_job_with(dir, Settings::immediate())
}

#[test]
fn equal_requirements_share_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (_session, job) = split_job(dir.path());
    let task = job.tasks().unwrap()[0].clone();
    let engine = StubEngine::default();

    submit_task(&engine, &task).unwrap();

    let calls = engine.calls.lock().unwrap();
    assert_eq!(1, calls.len(), "one batch for identical requirements");
    assert_eq!(vec![1, 2, 3], calls[0].1);
    assert_eq!(Some(4.0), calls[0].0.mem_gb());

    // one ledger line, ids plus requirements plus engine info
    let log = fs::read_to_string(job.path_of("submit_log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(1, lines.len());
    let (ids, record): (Vec<TaskId>, Rqmt) = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(vec![1, 2, 3], ids);
    assert_eq!(Some(&json!("stub")), record.get("engine_name"));
    assert_eq!(Some(&json!("node01")), record.get("engine_info"));
}

#[test]
fn escalated_instance_gets_its_own_batch() {
    let dir = tempfile::tempdir().unwrap();
    // an instantly stale heartbeat turns a started instance into an
    // interrupted one
    let settings = Settings { plogging_update_file_period: 0, ..Settings::immediate() };
    let (_session, job) = split_job_with(dir.path(), settings);
    let task = job.tasks().unwrap()[0].clone();
    let engine = StubEngine::default();

    // instance 1 was submitted before with the same initial request and
    // left an OOM-ish usage snapshot behind
    let initial = json!([[1], {"cpu": 1, "mem": 4.0, "time": 1.0, "engine_name": "stub", "engine_info": null}]);
    fs::write(job.path_of("submit_log"), format!("{initial}\n")).unwrap();
    let usage = Usage {
        used_time: 0.95,
        max: ResourceSample { rss: 3.8, vms: 4.2, cpu: 100.0 },
        requested_resources: Rqmt::new().with("cpu", 1).with("mem", 4.0).with("time", 1.0),
        ..Usage::default()
    };
    usage.save(&task.usage_path(1)).unwrap();
    // mark instance 1 as started-and-vanished so it counts as interrupted
    fs::write(task.log_path(1), "attempt").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));

    submit_task(&engine, &task).unwrap();

    let calls = engine.calls.lock().unwrap();
    assert_eq!(2, calls.len(), "escalated instance must not share a batch");

    let escalated = calls.iter().find(|(_, ids)| ids == &vec![1]).expect("batch for id 1");
    assert_eq!(Some(8.0), escalated.0.mem_gb());
    assert_eq!(Some(2.0), escalated.0.time_hours());

    let fresh = calls.iter().find(|(_, ids)| ids == &vec![2, 3]).expect("batch for 2,3");
    assert_eq!(Some(4.0), fresh.0.mem_gb());
    assert_eq!(Some(1.0), fresh.0.time_hours());
}

#[test]
fn seven_args_spread_over_three_instances() {
    let dir = tempfile::tempdir().unwrap();
    let (_session, job) = split_job(dir.path());
    let task = job.tasks().unwrap()[0].clone();

    assert_eq!(vec![1, 2, 3], task.task_ids());
    assert_eq!(0..3, task.arg_range(1));
    assert_eq!(3..5, task.arg_range(2));
    assert_eq!(5..7, task.arg_range(3));
}
