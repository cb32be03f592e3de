//! LSF adapter: bsub for submission, `bjobs -w` for the queue listing.
//!

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use sisyphus_common::Settings;
use sisyphus_core::{Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId};

use super::{array_ranges, process_task_name, system_call, with_backoff, QueueCache, QueueMap};

const ENGINE_NAME: &str = "lsf";

pub struct LsfEngine {
    settings: Arc<Settings>,
    gateway: Option<String>,
    default_rqmt: Rqmt,
    cache: QueueCache,
}

impl LsfEngine {
    pub fn new(settings: Arc<Settings>, gateway: Option<String>, default_rqmt: Rqmt) -> LsfEngine {
        LsfEngine { settings, gateway, default_rqmt, cache: QueueCache::new() }
    }

    /// Map a requirement table onto bsub flags.  LSF wants memory in MB
    /// and wall time in minutes.
    ///
    pub fn options(&self, rqmt: &Rqmt) -> Result<Vec<String>, EngineError> {
        if rqmt.multi_node_slots() > 1 {
            return Err(EngineError::MultiNodeUnsupported { backend: "lsf" });
        }
        let mut out = Vec::new();
        let mem_mb = (rqmt.mem_gb().unwrap_or(1.0) * 1024.0).ceil() as u64;
        out.push("-M".to_string());
        out.push(mem_mb.to_string());

        let rss_mb = rqmt
            .get("rss")
            .and_then(|v| v.as_f64())
            .map(|rss| (rss * 1024.0).ceil() as u64)
            .unwrap_or(mem_mb);
        out.push("-v".to_string());
        out.push(rss_mb.to_string());

        if rqmt.gpu() > 0 {
            out.push("-a".to_string());
            out.push("gpu".to_string());
        }

        out.push("-n".to_string());
        out.push(rqmt.cpu().to_string());

        let minutes = (rqmt.time_hours().unwrap_or(1.0) * 60.0).ceil() as u64;
        out.push("-W".to_string());
        out.push(minutes.to_string());

        if let Some(serde_json::Value::String(s)) = rqmt.get("bsub_args") {
            out.extend(shlex::split(s).unwrap_or_default());
        }
        Ok(out)
    }

    fn submit_range(
        &self,
        call: &[String],
        logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        range: (TaskId, TaskId, TaskId),
    ) -> Result<String, EngineError> {
        let (start, end, _) = range;
        let mut bsub = vec![
            "bsub".to_string(),
            "-J".to_string(),
            format!("{name}[{start}-{end}]"),
            "-o".to_string(),
            format!("{}/%J.%I", logpath.display()),
        ];
        bsub.extend(self.options(rqmt)?);

        let script = format!("{}\n", call.join(" "));
        let wait = Duration::from_secs(self.settings.wait_period_ssh_timeout);
        let out = with_backoff("bsub", wait, || {
            system_call(self.gateway.as_deref(), &bsub, Some(&script))
        })?;

        // expected: Job <id> is submitted to queue <q>.
        let line = out.stdout.first().cloned().unwrap_or_default();
        let job_id = line
            .split_whitespace()
            .nth(1)
            .map(|w| w.trim_matches(['<', '>']).to_string())
            .unwrap_or_default();
        if out.status != 0 || !line.starts_with("Job <") || job_id.is_empty() {
            error!("error submitting job");
            error!("bsub command: {}", bsub.join(" "));
            for l in out.stdout.iter().chain(out.stderr.iter()) {
                error!("output: {l}");
            }
            self.reset_cache();
            return Err(EngineError::SubmitFailed { cmd: bsub.join(" "), reason: line });
        }
        info!("submitted with job_id: {job_id} {name}");
        Ok(job_id)
    }

    fn queue_state(&self) -> Result<QueueMap, EngineError> {
        self.cache.get_or_refresh(|| {
            let command = vec!["bjobs".to_string(), "-w".to_string()];
            let wait = Duration::from_secs(self.settings.wait_period_qstat_parsing);
            let out = with_backoff("bjobs", wait, || {
                let o = system_call(self.gateway.as_deref(), &command, None)?;
                if o.status != 0 {
                    return Err(EngineError::SubmitFailed {
                        cmd: command.join(" "),
                        reason: format!("exit {}", o.status),
                    });
                }
                Ok(o)
            })?;
            Ok(parse_bjobs(&out.stdout))
        })
    }
}

/// Parse the space-delimited `bjobs -w` listing; the task id hides in
/// the `name[idx]` suffix of the job name column.
///
pub fn parse_bjobs(lines: &[String]) -> QueueMap {
    let mut map = QueueMap::new();
    for line in lines.iter().skip(1) {
        let field: Vec<&str> = line.split_whitespace().collect();
        let parsed = (|| -> Option<((String, TaskId), (String, String))> {
            let full_name = field.get(6)?;
            let (name, rest) = full_name.rsplit_once('[')?;
            let task: TaskId = rest.strip_suffix(']')?.parse().ok()?;
            Some((
                (name.to_string(), task),
                (field.first()?.to_string(), field.get(2)?.to_string()),
            ))
        })();
        match parsed {
            Some((key, value)) => map.entry(key).or_default().push(value),
            None => warn!("failed to parse bjobs -w output: {line}"),
        }
    }
    map
}

/// Normalise a native LSF state.
pub fn classify_state(state: &str) -> EngineState {
    match state {
        "RUN" | "PROV" => EngineState::Running,
        "PEND" | "WAIT" => EngineState::Queue,
        _ => EngineState::QueueError,
    }
}

impl Engine for LsfEngine {
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
            Err(_) => return EngineState::QueueError,
        };
        let Some(entries) = queue.get(&(name.clone(), task_id)) else {
            return EngineState::Unknown;
        };
        if entries.len() > 1 {
            warn!("more than one matching LSF task, using first match <{name}.{task_id}>");
        }
        match entries.first() {
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
            let job_id = self.submit_range(call, logpath, rqmt, &name, range)?;
            submitted.push(json!([[range.0, range.1, range.2], job_id]));
        }
        Ok(SubmitResult { engine_name: ENGINE_NAME.to_string(), engine_info: json!(submitted) })
    }

    fn get_task_id(&self, passed: Option<TaskId>) -> TaskId {
        if let Some(id) = passed {
            return id;
        }
        match std::env::var("LSB_JOBINDEX").ok().as_deref() {
            None | Some("0") => {
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

    #[test]
    fn test_parse_bjobs() {
        let lines: Vec<String> = [
            "JOBID USER STAT QUEUE FROM_HOST EXEC_HOST JOB_NAME SUBMIT_TIME",
            "77 wer RUN normal head node01 task.test.Test.1a2B3c4D5e6F.run[1] Jan 1 10:00",
            "78 wer PEND normal head - task.test.Test.1a2B3c4D5e6F.run[2] Jan 1 10:00",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let map = parse_bjobs(&lines);
        let name = "task.test.Test.1a2B3c4D5e6F.run".to_string();
        assert_eq!(vec![("77".to_string(), "RUN".to_string())], map[&(name.clone(), 1)]);
        assert_eq!(EngineState::Running, classify_state(&map[&(name.clone(), 1)][0].1));
        assert_eq!(EngineState::Queue, classify_state(&map[&(name, 2)][0].1));
    }

    #[test]
    fn test_multi_node_is_rejected() {
        let engine = LsfEngine::new(Arc::new(Settings::immediate()), None, Rqmt::new());
        let rqmt = Rqmt::new().with("mem", 1.0).with("time", 1.0).with("multi_node_slots", 2);
        assert!(matches!(
            engine.options(&rqmt),
            Err(EngineError::MultiNodeUnsupported { backend: "lsf" })
        ));
    }

    #[test]
    fn test_options_units() {
        let engine = LsfEngine::new(Arc::new(Settings::immediate()), None, Rqmt::new());
        let rqmt = Rqmt::new().with("mem", 2.0).with("time", 0.5).with("cpu", 3);
        let opts = engine.options(&rqmt).unwrap();
        let m = opts.iter().position(|o| o == "-M").unwrap();
        assert_eq!("2048", opts[m + 1]);
        let w = opts.iter().position(|o| o == "-W").unwrap();
        assert_eq!("30", opts[w + 1]);
        let n = opts.iter().position(|o| o == "-n").unwrap();
        assert_eq!("3", opts[n + 1]);
    }
}
