//! Slurm adapter: sbatch for submission, squeue for the queue listing.
//!

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use sisyphus_common::{MemoryAllocation, Settings};
use sisyphus_core::{
    Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId,
};

use super::{
    array_ranges, process_task_name, system_call, with_backoff, QueueCache, QueueMap,
};

const ENGINE_NAME: &str = "slurm";

pub struct SlurmEngine {
    settings: Arc<Settings>,
    gateway: Option<String>,
    memory_allocation: MemoryAllocation,
    default_rqmt: Rqmt,
    cache: QueueCache,
}

impl SlurmEngine {
    pub fn new(
        settings: Arc<Settings>,
        gateway: Option<String>,
        memory_allocation: MemoryAllocation,
        default_rqmt: Rqmt,
    ) -> SlurmEngine {
        SlurmEngine { settings, gateway, memory_allocation, default_rqmt, cache: QueueCache::new() }
    }

    /// Map a requirement table onto sbatch flags.
    ///
    pub fn options(&self, rqmt: &Rqmt) -> Vec<String> {
        let mut out = Vec::new();

        let mem = format!("{}G", rqmt.mem_gb().unwrap_or(1.0).ceil() as u64);
        match self.memory_allocation {
            MemoryAllocation::PerCpu => out.push(format!("--mem-per-cpu={mem}")),
            MemoryAllocation::PerNode => out.push(format!("--mem={mem}")),
        }

        if rqmt.gpu() > 0 {
            let mut gres = "--gres=gpu:".to_string();
            if let Some(name) = rqmt.get("gpu_name").and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    gres.push_str(name);
                    gres.push(':');
                }
            }
            gres.push_str(&rqmt.gpu().to_string());
            out.push(gres);
        }

        out.push(format!("--cpus-per-task={}", rqmt.cpu()));

        let minutes = (rqmt.time_hours().unwrap_or(1.0) * 60.0).ceil() as u64;
        out.push(format!("--time={minutes}"));
        out.push("--export=all".to_string());

        if rqmt.multi_node_slots() > 1 {
            out.push(format!("--ntasks={}", rqmt.multi_node_slots()));
            out.push(format!("--nodes={}", rqmt.multi_node_slots()));
        }

        if let Some(extra) = rqmt.get("sbatch_args") {
            match extra {
                serde_json::Value::String(s) => {
                    out.extend(shlex::split(s).unwrap_or_default());
                }
                serde_json::Value::Array(items) => out.extend(
                    items.iter().filter_map(|v| v.as_str()).map(str::to_string),
                ),
                _ => {}
            }
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
    ) -> Result<String, EngineError> {
        let (start, end, step) = range;
        let out_log = format!("{}/%x.%A.%t.%a", logpath.display());
        let mut sbatch = vec![
            "sbatch".to_string(),
            "-J".to_string(),
            name.to_string(),
            "--mail-type=None".to_string(),
        ];
        sbatch.extend(self.options(rqmt));
        sbatch.push("-a".to_string());
        sbatch.push(format!("{start}-{end}:{step}"));
        sbatch.push(format!("--wrap=srun -o {out_log} {}", call.join(" ")));

        let wait = Duration::from_secs(self.settings.wait_period_ssh_timeout);
        let out = with_backoff("sbatch", wait, || {
            system_call(self.gateway.as_deref(), &sbatch, None)
        })?;

        // expected: Submitted batch job <id>
        let line = out.stdout.first().cloned().unwrap_or_default();
        let words: Vec<&str> = line.split_whitespace().collect();
        if out.status != 0 || words.len() != 4 || words[0..3] != ["Submitted", "batch", "job"] {
            error!("error submitting job");
            error!("sbatch command: {}", sbatch.join(" "));
            for l in &out.stdout {
                error!("output: {l}");
            }
            for l in &out.stderr {
                error!("error: {l}");
            }
            self.reset_cache();
            return Err(EngineError::SubmitFailed {
                cmd: sbatch.join(" "),
                reason: line,
            });
        }
        let job_id = words[3].to_string();
        info!("submitted with job_id: {job_id} {name}");
        if !out.stderr.is_empty() {
            warn!("got stderr while submitting (job {job_id} went through anyway)");
            for l in &out.stderr {
                warn!("error: {l}");
            }
        }
        Ok(job_id)
    }

    fn queue_state(&self) -> Result<QueueMap, EngineError> {
        self.cache.get_or_refresh(|| {
            let user = std::env::var("USER").unwrap_or_default();
            let command = vec![
                "squeue".to_string(),
                "-h".to_string(),
                "--array".to_string(),
                "-u".to_string(),
                user,
                "-O".to_string(),
                "arrayjobid,arraytaskid,state,name:1000".to_string(),
            ];
            let wait = Duration::from_secs(self.settings.wait_period_qstat_parsing);
            let out = with_backoff("squeue", wait, || {
                let o = system_call(self.gateway.as_deref(), &command, None)?;
                if o.status != 0 {
                    return Err(EngineError::SubmitFailed {
                        cmd: command.join(" "),
                        reason: format!("exit {}", o.status),
                    });
                }
                Ok(o)
            })?;
            Ok(parse_squeue(&out.stdout))
        })
    }
}

/// Parse squeue's space-delimited listing.
///
pub fn parse_squeue(lines: &[String]) -> QueueMap {
    let mut map = QueueMap::new();
    for line in lines {
        let field: Vec<&str> = line.split_whitespace().collect();
        if field.len() < 4 {
            if !line.trim().is_empty() {
                warn!("failed to parse squeue output: {line}");
            }
            continue;
        }
        let number = field[0];
        let task: TaskId = if field[1] == "N/A" { 1 } else { field[1].parse().unwrap_or(1) };
        let state = field[2];
        let name = field[3];
        map.entry((name.to_string(), task))
            .or_default()
            .push((number.to_string(), state.to_string()));
    }
    map
}

/// Normalise a native Slurm state.
pub fn classify_state(state: &str) -> EngineState {
    match state {
        "RUNNING" | "COMPLETING" => EngineState::Running,
        "PENDING" | "CONFIGURING" => EngineState::Queue,
        _ => EngineState::QueueError,
    }
}

impl Engine for SlurmEngine {
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
                warn!("could not read squeue: {e}");
                return EngineState::Unknown;
            }
        };
        let Some(entries) = queue.get(&(name.clone(), task_id)) else {
            return EngineState::Unknown;
        };
        if entries.len() > 1 {
            warn!(
                "more than one matching slurm task, using first match <{name}.{task_id}>: {entries:?}"
            );
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
        match std::env::var("SLURM_ARRAY_TASK_ID").ok().as_deref() {
            None | Some("N/A") => {
                error!("job started without a task id, this should not happen! continuing with task_id=1");
                1
            }
            Some(id) => id.parse().unwrap_or(1),
        }
    }

    /// Link the engine's own log file to the expected per-instance log
    /// location; multi-node runs get a per-process suffix.
    ///
    fn init_worker(&self, task: &Task) -> Result<(), EngineError> {
        let num_tasks: u64 = ["SLURM_NTASKS", "SLURM_NPROCS"]
            .iter()
            .find_map(|v| std::env::var(v).ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let proc_id = std::env::var("SLURM_PROCID").unwrap_or_else(|_| "0".to_string());
        let array_task_id = self.get_task_id(None);

        let log_suffix = if num_tasks <= 1 {
            array_task_id.to_string()
        } else {
            format!("{array_task_id}.{proc_id}")
        };
        let logpath = task.log_path(1).with_file_name(format!("log.{}.{log_suffix}", task.name()));
        if logpath.is_file() {
            let _ = std::fs::remove_file(&logpath);
        }

        let job_id = ["SLURM_JOB_ID", "SLURM_JOBID", "SLURM_ARRAY_JOB_ID"]
            .iter()
            .find_map(|v| std::env::var(v).ok())
            .unwrap_or_else(|| "0".to_string());
        let engine_log = task.engine_log_dir().join(format!(
            "{}.{job_id}.{proc_id}.{}",
            std::env::var("SLURM_JOB_NAME").unwrap_or_default(),
            std::env::var("SLURM_ARRAY_TASK_ID").unwrap_or_else(|_| "1".to_string()),
        ));
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

    fn slurm() -> SlurmEngine {
        SlurmEngine::new(
            Arc::new(Settings::immediate()),
            None,
            MemoryAllocation::PerNode,
            Rqmt::new().with("cpu", 1).with("mem", 1.0).with("time", 1.0),
        )
    }

    #[test]
    fn test_options_mapping() {
        let engine = slurm();
        let mut rqmt = Rqmt::new()
            .with("cpu", 4)
            .with("gpu", 2)
            .with("gpu_name", "a100")
            .with("mem", 7.5)
            .with("time", 2.5);
        rqmt.normalize().unwrap();
        let opts = engine.options(&rqmt);
        assert!(opts.contains(&"--mem=8G".to_string()), "{opts:?}");
        assert!(opts.contains(&"--gres=gpu:a100:2".to_string()));
        assert!(opts.contains(&"--cpus-per-task=4".to_string()));
        assert!(opts.contains(&"--time=150".to_string()));
    }

    #[test]
    fn test_multi_node_options() {
        let engine = slurm();
        let rqmt = Rqmt::new().with("multi_node_slots", 4).with("mem", 1.0).with("time", 1.0);
        let opts = engine.options(&rqmt);
        assert!(opts.contains(&"--ntasks=4".to_string()));
        assert!(opts.contains(&"--nodes=4".to_string()));
    }

    #[test]
    fn test_sbatch_args_passthrough() {
        let engine = slurm();
        let rqmt = Rqmt::new().with("mem", 1.0).with("time", 1.0).with(
            "sbatch_args",
            "--partition=gpu --qos=long",
        );
        let opts = engine.options(&rqmt);
        assert!(opts.contains(&"--partition=gpu".to_string()));
        assert!(opts.contains(&"--qos=long".to_string()));
    }

    #[test]
    fn test_parse_squeue() {
        let lines: Vec<String> = [
            "1234 1 RUNNING task.test.Test.1a2B3c4D5e6F.run",
            "1234 2 PENDING task.test.Test.1a2B3c4D5e6F.run",
            "1235 N/A FAILED other.job.name",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let map = parse_squeue(&lines);
        let key = ("task.test.Test.1a2B3c4D5e6F.run".to_string(), 1);
        assert_eq!(vec![("1234".to_string(), "RUNNING".to_string())], map[&key]);
        assert_eq!(
            EngineState::Running,
            classify_state(&map[&key][0].1)
        );
        let key2 = ("task.test.Test.1a2B3c4D5e6F.run".to_string(), 2);
        assert_eq!(EngineState::Queue, classify_state(&map[&key2][0].1));
        let key3 = ("other.job.name".to_string(), 1);
        assert_eq!(EngineState::QueueError, classify_state(&map[&key3][0].1));
    }
}
