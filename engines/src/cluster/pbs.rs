//! PBS/Torque adapter: qsub for submission, `qstat -f -F json` for the
//! queue listing.
//!

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use tracing::{error, info, warn};

use sisyphus_common::Settings;
use sisyphus_core::{Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId};

use super::{array_ranges, process_task_name, system_call, with_backoff, QueueCache, QueueMap};

const ENGINE_NAME: &str = "pbs";

pub struct PbsEngine {
    settings: Arc<Settings>,
    gateway: Option<String>,
    default_rqmt: Rqmt,
    cache: QueueCache,
}

impl PbsEngine {
    pub fn new(settings: Arc<Settings>, gateway: Option<String>, default_rqmt: Rqmt) -> PbsEngine {
        PbsEngine { settings, gateway, default_rqmt, cache: QueueCache::new() }
    }

    /// Map a requirement table onto qsub select/walltime flags.
    ///
    pub fn options(&self, rqmt: &Rqmt) -> Vec<String> {
        let mut out = Vec::new();

        let hours = rqmt.time_hours().unwrap_or(1.0);
        let total = (hours * 3600.0).ceil() as u64;
        out.push(format!(
            "-lwalltime={}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        ));

        let select = format!(
            "mem={}gb:ngpus={}:ncpus={}",
            rqmt.mem_gb().unwrap_or(1.0).ceil() as u64,
            rqmt.gpu(),
            rqmt.cpu()
        );
        out.push(format!("-lselect={}:{select}", rqmt.multi_node_slots()));

        if let Some(Json::String(s)) = rqmt.get("qsub_args") {
            out.extend(shlex::split(s).unwrap_or_default());
        }
        out
    }

    fn submit_range(
        &self,
        call: &[String],
        logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        range: (TaskId, TaskId, TaskId),
        array: bool,
    ) -> Result<String, EngineError> {
        let (start, end, step) = range;
        let mut qsub = vec![
            "qsub".to_string(),
            "-N".to_string(),
            name.to_string(),
            "-j".to_string(),
            "oe".to_string(),
            "-o".to_string(),
            logpath.display().to_string(),
            "-m".to_string(),
            "n".to_string(),
        ];
        qsub.extend(self.options(rqmt));
        if array {
            qsub.push("-J".to_string());
            qsub.push(format!("{start}-{end}:{step}"));
        }

        let script = format!("{}\n", call.join(" "));
        let wait = Duration::from_secs(self.settings.wait_period_ssh_timeout);
        let out = with_backoff("qsub", wait, || {
            system_call(self.gateway.as_deref(), &qsub, Some(&script))
        })?;

        // qsub prints the new job id alone on the first line
        let job_id = out.stdout.first().cloned().unwrap_or_default().trim().to_string();
        if out.status != 0 || job_id.is_empty() {
            error!("error submitting job");
            error!("qsub command: {}", qsub.join(" "));
            for l in out.stdout.iter().chain(out.stderr.iter()) {
                error!("output: {l}");
            }
            self.reset_cache();
            return Err(EngineError::SubmitFailed {
                cmd: qsub.join(" "),
                reason: format!("exit {}", out.status),
            });
        }
        info!("submitted with job_id: {job_id} {name}");
        Ok(job_id)
    }

    fn queue_state(&self) -> Result<QueueMap, EngineError> {
        self.cache.get_or_refresh(|| {
            let command = vec![
                "qstat".to_string(),
                "-f".to_string(),
                "-F".to_string(),
                "json".to_string(),
            ];
            let wait = Duration::from_secs(self.settings.wait_period_qstat_parsing);
            let out = with_backoff("qstat", wait, || {
                system_call(self.gateway.as_deref(), &command, None)
            })?;
            let user = std::env::var("USER").unwrap_or_default();
            parse_qstat_json(&out.stdout.join("\n"), &user).map_err(|e| {
                warn!("qstat -F json parsing error: {e}");
                EngineError::SubmitFailed { cmd: command.join(" "), reason: e }
            })
        })
    }
}

/// Parse the JSON queue listing, keeping only the caller's jobs.  Array
/// members show up as `<id>[<idx>]`.
///
pub fn parse_qstat_json(data: &str, user: &str) -> Result<QueueMap, String> {
    let parsed: Json = serde_json::from_str(data).map_err(|e| e.to_string())?;
    let mut map = QueueMap::new();
    let Some(jobs) = parsed.get("Jobs").and_then(Json::as_object) else {
        return Ok(map);
    };
    for (job_id, job) in jobs {
        let owner = job
            .get("Job_Owner")
            .and_then(Json::as_str)
            .and_then(|o| o.split('@').next())
            .unwrap_or_default();
        if !user.is_empty() && owner != user {
            continue;
        }
        let (Some(state), Some(name)) = (
            job.get("job_state").and_then(Json::as_str),
            job.get("Job_Name").and_then(Json::as_str),
        ) else {
            warn!("failed to parse qstat entry: {job_id}");
            continue;
        };
        let task: TaskId = job_id
            .split_once('[')
            .and_then(|(_, rest)| rest.split(']').next())
            .and_then(|idx| idx.parse().ok())
            .unwrap_or(1);
        map.entry((name.to_string(), task))
            .or_default()
            .push((job_id.to_string(), state.to_string()));
    }
    Ok(map)
}

/// Normalise a native PBS state.
pub fn classify_state(state: &str) -> EngineState {
    match state {
        "R" | "E" => EngineState::Running,
        "Q" | "H" | "W" => EngineState::Queue,
        _ => EngineState::QueueError,
    }
}

impl Engine for PbsEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn reset_cache(&self) {
        self.cache.reset();
    }

    fn get_default_rqmt(&self, _task: &Task) -> Rqmt {
        self.default_rqmt.clone()
    }

    fn task_state(&self, task: &Task, task_id: TaskId) -> EngineState {
        let name = process_task_name(&task.task_name());
        let queue = match self.queue_state() {
            Ok(q) => q,
            Err(e) => {
                warn!("could not read qstat: {e}");
                return EngineState::Unknown;
            }
        };
        match queue.get(&(name, task_id)).and_then(|entries| entries.first()) {
            None => EngineState::Unknown,
            Some((_, state)) => classify_state(state),
        }
    }

    fn submit_call(
        &self,
        call: &[String],
        logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        _task_name: &str,
        task_ids: &[TaskId],
    ) -> Result<SubmitResult, EngineError> {
        let name = process_task_name(name);
        let mut submitted = Vec::new();
        for range in array_ranges(task_ids) {
            let array = !(range.0 == range.1 && range.0 == 1);
            let job_id = self.submit_range(call, logpath, rqmt, &name, range, array)?;
            submitted.push(json!([[range.0, range.1, range.2], job_id]));
        }
        Ok(SubmitResult { engine_name: ENGINE_NAME.to_string(), engine_info: json!(submitted) })
    }

    fn get_task_id(&self, passed: Option<TaskId>) -> TaskId {
        if let Some(id) = passed {
            return id;
        }
        match std::env::var("PBS_TASKNUM").ok() {
            None => {
                error!("job started without a task id, this should not happen! continuing with task_id=1");
                1
            }
            Some(id) => id.parse().unwrap_or(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT_JSON: &str = r#"{
        "Jobs": {
            "100[1].head": {
                "Job_Name": "task.test.Test.1a2B3c4D5e6F.run",
                "Job_Owner": "wer@head",
                "job_state": "R"
            },
            "100[2].head": {
                "Job_Name": "task.test.Test.1a2B3c4D5e6F.run",
                "Job_Owner": "wer@head",
                "job_state": "Q"
            },
            "101.head": {
                "Job_Name": "someone.elses.job",
                "Job_Owner": "other@head",
                "job_state": "R"
            }
        }
    }"#;

    #[test]
    fn test_parse_qstat_json() {
        let map = parse_qstat_json(QSTAT_JSON, "wer").unwrap();
        let name = "task.test.Test.1a2B3c4D5e6F.run".to_string();
        assert_eq!(vec![("100[1].head".to_string(), "R".to_string())], map[&(name.clone(), 1)]);
        assert_eq!(EngineState::Running, classify_state(&map[&(name.clone(), 1)][0].1));
        assert_eq!(EngineState::Queue, classify_state(&map[&(name, 2)][0].1));
        // other users are filtered
        assert!(!map.contains_key(&("someone.elses.job".to_string(), 1)));
    }

    #[test]
    fn test_options_walltime_format() {
        let engine = PbsEngine::new(Arc::new(Settings::immediate()), None, Rqmt::new());
        let rqmt = Rqmt::new().with("mem", 4.0).with("time", 2.5).with("cpu", 2);
        let opts = engine.options(&rqmt);
        assert!(opts.contains(&"-lwalltime=2:30:00".to_string()), "{opts:?}");
        assert!(opts.contains(&"-lselect=1:mem=4gb:ngpus=0:ncpus=2".to_string()));
    }

    #[test]
    fn test_multi_node_select() {
        let engine = PbsEngine::new(Arc::new(Settings::immediate()), None, Rqmt::new());
        let rqmt =
            Rqmt::new().with("mem", 1.0).with("time", 1.0).with("multi_node_slots", 3);
        let opts = engine.options(&rqmt);
        assert!(opts.iter().any(|o| o.starts_with("-lselect=3:")), "{opts:?}");
    }
}
