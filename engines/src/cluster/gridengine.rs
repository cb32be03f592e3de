//! Grid-engine family adapter: qsub for submission, `qstat -xml` for
//! the queue listing.
//!

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use sisyphus_common::Settings;
use sisyphus_core::{Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId};

use super::{array_ranges, process_task_name, system_call, with_backoff, QueueCache, QueueMap};

const ENGINE_NAME: &str = "sge";

pub struct GridEngine {
    settings: Arc<Settings>,
    gateway: Option<String>,
    /// Parallel environment used for multi-node jobs (`-pe <name> <n>`).
    pe_name: Option<String>,
    default_rqmt: Rqmt,
    cache: QueueCache,
}

impl GridEngine {
    pub fn new(
        settings: Arc<Settings>,
        gateway: Option<String>,
        pe_name: Option<String>,
        default_rqmt: Rqmt,
    ) -> GridEngine {
        GridEngine { settings, gateway, pe_name, default_rqmt, cache: QueueCache::new() }
    }

    /// Map a requirement table onto qsub resource flags.
    ///
    pub fn options(&self, rqmt: &Rqmt) -> Result<Vec<String>, EngineError> {
        let mut out = Vec::new();
        let mem = format!("{}G", rqmt.mem_gb().unwrap_or(1.0).ceil() as u64);
        out.push("-l".to_string());
        out.push(format!("h_vmem={mem}"));

        out.push("-l".to_string());
        match rqmt.get("rss").and_then(|v| v.as_f64()) {
            Some(rss) => out.push(format!("h_rss={}G", rss.ceil() as u64)),
            None => out.push(format!("h_rss={mem}")),
        }

        let file_size = match rqmt.get("file_size") {
            Some(serde_json::Value::Number(n)) => {
                format!("{}G", n.as_f64().unwrap_or(50.0).ceil() as u64)
            }
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => "50G".to_string(),
        };
        out.push("-l".to_string());
        out.push(format!("h_fsize={file_size}"));

        out.push("-l".to_string());
        out.push(format!("gpu={}", rqmt.gpu()));

        out.push("-l".to_string());
        out.push(format!("num_proc={}", rqmt.cpu()));

        let seconds = (rqmt.time_hours().unwrap_or(1.0) * 3600.0).ceil() as u64;
        out.push("-l".to_string());
        out.push(format!("h_rt={seconds}"));

        if rqmt.multi_node_slots() > 1 {
            let pe = self.pe_name.as_deref().ok_or(EngineError::MultiNodeUnsupported {
                backend: "grid engine without a parallel environment",
            })?;
            out.push("-pe".to_string());
            out.push(pe.to_string());
            out.push(rqmt.multi_node_slots().to_string());
        }

        if let Some(serde_json::Value::String(s)) = rqmt.get("qsub_args") {
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
        let (start, end, step) = range;
        let mut qsub = vec![
            "qsub".to_string(),
            "-cwd".to_string(),
            "-N".to_string(),
            name.to_string(),
            "-j".to_string(),
            "y".to_string(),
            "-o".to_string(),
            logpath.display().to_string(),
            "-S".to_string(),
            "/bin/bash".to_string(),
            "-m".to_string(),
            "n".to_string(),
        ];
        qsub.extend(self.options(rqmt)?);
        qsub.push("-t".to_string());
        qsub.push(format!("{start}-{end}:{step}"));

        let script = format!("{}\n", call.join(" "));
        let wait = Duration::from_secs(self.settings.wait_period_ssh_timeout);
        let out = with_backoff("qsub", wait, || {
            system_call(self.gateway.as_deref(), &qsub, Some(&script))
        })?;

        // expected: Your job-array <id>.<range> ("<name>") has been submitted
        let line = out.stdout.first().cloned().unwrap_or_default();
        let words: Vec<&str> = line.split_whitespace().collect();
        if out.status != 0 || words.len() != 7 || words[0] != "Your" || words[1] != "job-array" {
            error!("error submitting job");
            error!("qsub command: {}", qsub.join(" "));
            for l in out.stdout.iter().chain(out.stderr.iter()) {
                error!("output: {l}");
            }
            self.reset_cache();
            return Err(EngineError::SubmitFailed { cmd: qsub.join(" "), reason: line });
        }
        let job_id = words[2].split('.').next().unwrap_or_default().to_string();
        info!("submitted with job_id: {job_id} {name}");
        Ok(job_id)
    }

    fn queue_state(&self) -> Result<QueueMap, EngineError> {
        self.cache.get_or_refresh(|| {
            let user = std::env::var("USER").unwrap_or_default();
            let command =
                vec!["qstat".to_string(), "-xml".to_string(), "-u".to_string(), user];
            let wait = Duration::from_secs(self.settings.wait_period_qstat_parsing);
            with_backoff("qstat", wait, || {
                let out = system_call(self.gateway.as_deref(), &command, None)?;
                if out.status != 0 {
                    return Err(EngineError::SubmitFailed {
                        cmd: command.join(" "),
                        reason: format!("exit {}", out.status),
                    });
                }
                parse_qstat_xml(&out.stdout.join("\n")).map_err(|e| {
                    warn!("qstat -xml parsing error: {e}");
                    EngineError::SubmitFailed { cmd: command.join(" "), reason: e }
                })
            })
        })
    }
}

/// Parse the grid engine's XML queue listing.
///
pub fn parse_qstat_xml(xml: &str) -> Result<QueueMap, String> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| e.to_string())?;
    let mut map = QueueMap::new();
    for job in doc.descendants().filter(|n| n.has_tag_name("job_list")) {
        let field = |tag: &str| -> Option<String> {
            job.children()
                .find(|c| c.has_tag_name(tag))
                .and_then(|c| c.text())
                .map(|t| t.trim().to_string())
        };
        let (Some(name), Some(state), Some(number)) =
            (field("JB_name"), field("state"), field("JB_job_number"))
        else {
            continue;
        };
        for task_id in parse_task_ids(field("tasks").as_deref()) {
            map.entry((name.clone(), task_id))
                .or_default()
                .push((number.clone(), state.clone()));
        }
    }
    Ok(map)
}

/// The `tasks` element may be empty, a single id, a comma list or a
/// `start-end:step` range.
///
fn parse_task_ids(tasks: Option<&str>) -> Vec<TaskId> {
    let Some(tasks) = tasks else {
        return vec![1];
    };
    if let Ok(one) = tasks.parse::<TaskId>() {
        return vec![one];
    }
    if tasks.contains(',') {
        return tasks.split(',').flat_map(|t| parse_task_ids(Some(t.trim()))).collect();
    }
    if let Some((range, step)) = tasks.split_once(':') {
        if let Some((start, end)) = range.split_once('-') {
            if let (Ok(start), Ok(end), Ok(step)) =
                (start.parse::<TaskId>(), end.parse::<TaskId>(), step.parse::<TaskId>())
            {
                return (start..=end).step_by(step.max(1) as usize).collect();
            }
        }
    }
    warn!("can not parse task range: {tasks}");
    Vec::new()
}

/// Normalise a native grid-engine state.
pub fn classify_state(state: &str) -> EngineState {
    match state {
        "r" | "t" | "Rr" | "Rt" => EngineState::Running,
        "qw" => EngineState::Queue,
        _ => EngineState::QueueError,
    }
}

impl Engine for GridEngine {
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
            let job_id = self.submit_range(call, logpath, rqmt, &name, range)?;
            submitted.push(json!([[range.0, range.1, range.2], job_id]));
        }
        Ok(SubmitResult { engine_name: ENGINE_NAME.to_string(), engine_info: json!(submitted) })
    }

    fn get_task_id(&self, passed: Option<TaskId>) -> TaskId {
        if let Some(id) = passed {
            return id;
        }
        match std::env::var("SGE_TASK_ID").ok().as_deref() {
            None | Some("undefined") => {
                error!("job started without a task id, this should not happen! continuing with task_id=1");
                1
            }
            Some(id) => id.parse().unwrap_or(1),
        }
    }

    /// Hard-link the engine's stderr file (which carries the combined
    /// output) to the per-instance log location.
    ///
    fn init_worker(&self, task: &Task) -> Result<(), EngineError> {
        let task_id = self.get_task_id(None);
        let logpath = task.log_path(task_id);
        if logpath.is_file() {
            let _ = std::fs::remove_file(&logpath);
        }
        let Ok(engine_log) = std::env::var("SGE_STDERR_PATH") else {
            return Ok(());
        };
        let engine_log = std::path::PathBuf::from(engine_log);
        if engine_log.is_file() {
            let _ = std::fs::hard_link(&engine_log, &logpath);
        } else {
            warn!(
                "could not find engine logfile: {} creating soft link anyway",
                engine_log.display()
            );
            let _ = std::os::unix::fs::symlink(&engine_log, &logpath);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT_XML: &str = r#"<?xml version='1.0'?>
<job_info>
  <queue_info>
    <job_list state="running">
      <JB_job_number>4242</JB_job_number>
      <JB_name>task.test.Test.1a2B3c4D5e6F.run</JB_name>
      <state>r</state>
      <tasks>1</tasks>
    </job_list>
  </queue_info>
  <job_info>
    <job_list state="pending">
      <JB_job_number>4243</JB_job_number>
      <JB_name>task.test.Test.1a2B3c4D5e6F.run</JB_name>
      <state>qw</state>
      <tasks>2-6:2</tasks>
    </job_list>
    <job_list state="pending">
      <JB_job_number>4244</JB_job_number>
      <JB_name>stuck.job</JB_name>
      <state>Eqw</state>
    </job_list>
  </job_info>
</job_info>"#;

    #[test]
    fn test_parse_qstat_xml() {
        let map = parse_qstat_xml(QSTAT_XML).unwrap();
        let name = "task.test.Test.1a2B3c4D5e6F.run".to_string();
        assert_eq!(vec![("4242".to_string(), "r".to_string())], map[&(name.clone(), 1)]);
        for id in [2, 4, 6] {
            assert_eq!(vec![("4243".to_string(), "qw".to_string())], map[&(name.clone(), id)]);
        }
        assert!(!map.contains_key(&(name, 3)));
        assert_eq!("Eqw", map[&("stuck.job".to_string(), 1)][0].1);
    }

    #[test]
    fn test_classify_state() {
        assert_eq!(EngineState::Running, classify_state("r"));
        assert_eq!(EngineState::Running, classify_state("Rt"));
        assert_eq!(EngineState::Queue, classify_state("qw"));
        assert_eq!(EngineState::QueueError, classify_state("Eqw"));
        assert_eq!(EngineState::QueueError, classify_state("dr"));
    }

    #[test]
    fn test_multi_node_needs_parallel_environment() {
        let engine = GridEngine::new(Arc::new(Settings::immediate()), None, None, Rqmt::new());
        let rqmt = Rqmt::new().with("mem", 1.0).with("time", 1.0).with("multi_node_slots", 2);
        assert!(engine.options(&rqmt).is_err());

        let engine = GridEngine::new(
            Arc::new(Settings::immediate()),
            None,
            Some("mpi".to_string()),
            Rqmt::new(),
        );
        let opts = engine.options(&rqmt).unwrap();
        let pos = opts.iter().position(|o| o == "-pe").unwrap();
        assert_eq!("mpi", opts[pos + 1]);
        assert_eq!("2", opts[pos + 2]);
    }

    #[test]
    fn test_options_time_in_seconds() {
        let engine = GridEngine::new(Arc::new(Settings::immediate()), None, None, Rqmt::new());
        let rqmt = Rqmt::new().with("mem", 2.0).with("time", 0.5);
        let opts = engine.options(&rqmt).unwrap();
        assert!(opts.contains(&"h_rt=1800".to_string()), "{opts:?}");
        assert!(opts.contains(&"h_vmem=2G".to_string()));
        assert!(opts.contains(&"h_rss=2G".to_string()));
        assert!(opts.contains(&"h_fsize=50G".to_string()));
    }
}
