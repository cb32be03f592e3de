//! AWS Batch adapter, driving the `aws batch` CLI.
//!
//! Batch has no array-job renaming that survives our task ids, so each
//! instance is submitted as its own job under an escaped name.  The
//! queue listing is assembled from `list-jobs` per state; finished and
//! failed entries stay visible for a configurable grace window.
//!

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value as Json};
use tracing::{info, warn};

use sisyphus_common::Settings;
use sisyphus_core::{Engine, EngineError, EngineState, Rqmt, SubmitResult, Task, TaskId};

use super::{system_call, with_backoff, QUEUE_CACHE_TTL};

const ENGINE_NAME: &str = "aws_batch";

/// How long finished/failed entries are kept in the cached listing.
const IGNORE_FAILED_JOBS_AFTER: Duration = Duration::from_secs(3600);
const IGNORE_SUCCEEDED_JOBS_AFTER: Duration = Duration::from_secs(300);

const LISTED_STATES: [&str; 7] =
    ["SUCCEEDED", "FAILED", "SUBMITTED", "PENDING", "RUNNABLE", "STARTING", "RUNNING"];

pub struct AwsBatchEngine {
    settings: Arc<Settings>,
    job_queue: String,
    job_definition: String,
    default_rqmt: Rqmt,
    cache: Mutex<Option<(Instant, HashMap<String, String>)>>,
}

impl AwsBatchEngine {
    pub fn new(
        settings: Arc<Settings>,
        job_queue: String,
        job_definition: String,
        default_rqmt: Rqmt,
    ) -> AwsBatchEngine {
        AwsBatchEngine {
            settings,
            job_queue,
            job_definition,
            default_rqmt,
            cache: Mutex::new(None),
        }
    }

    fn submit_one(
        &self,
        call: &[String],
        rqmt: &Rqmt,
        name: &str,
        task_id: TaskId,
    ) -> Result<String, EngineError> {
        let vcpus = rqmt.cpu().max(1);
        let memory_mb = (rqmt.mem_gb().unwrap_or(1.0) * 1024.0).ceil() as u64;
        let mut command: Vec<String> = call.to_vec();
        command.push(task_id.to_string());

        let payload = json!({
            "jobName": escape_name(name, task_id),
            "jobQueue": self.job_queue,
            "jobDefinition": self.job_definition,
            "containerOverrides": {
                "vcpus": vcpus,
                "memory": memory_mb,
                "command": command,
            }
        });
        let aws_call = vec![
            "aws".to_string(),
            "batch".to_string(),
            "submit-job".to_string(),
            "--output".to_string(),
            "json".to_string(),
            "--cli-input-json".to_string(),
            payload.to_string(),
        ];
        let wait = Duration::from_secs(self.settings.wait_period_ssh_timeout);
        let out = with_backoff("aws batch submit-job", wait, || {
            let o = system_call(None, &aws_call, None)?;
            if o.status != 0 {
                return Err(EngineError::SubmitFailed {
                    cmd: "aws batch submit-job".to_string(),
                    reason: format!("exit {}", o.status),
                });
            }
            Ok(o)
        })?;
        let parsed: Json = serde_json::from_str(&out.stdout.join("\n")).map_err(|e| {
            self.reset_cache();
            EngineError::SubmitFailed { cmd: "aws batch submit-job".to_string(), reason: e.to_string() }
        })?;
        let job_id = parsed.get("jobId").and_then(Json::as_str).unwrap_or_default().to_string();
        info!("submitted with job_id: {job_id} {name}.{task_id}");
        Ok(job_id)
    }

    /// Job name → native state, assembled from one `list-jobs` call per
    /// state bucket.
    ///
    fn queue_state(&self) -> HashMap<String, String> {
        {
            let guard = self.cache.lock().unwrap();
            if let Some((at, map)) = guard.as_ref() {
                if at.elapsed() < QUEUE_CACHE_TTL {
                    return map.clone();
                }
            }
        }
        let mut map: HashMap<String, String> = self
            .cache
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, m)| m.clone())
            .unwrap_or_default();

        for state in LISTED_STATES {
            let command = vec![
                "aws".to_string(),
                "batch".to_string(),
                "list-jobs".to_string(),
                "--output".to_string(),
                "json".to_string(),
                "--job-queue".to_string(),
                self.job_queue.clone(),
                "--job-status".to_string(),
                state.to_string(),
            ];
            let out = match system_call(None, &command, None) {
                Ok(o) if o.status == 0 => o,
                other => {
                    warn!("aws batch list-jobs {state} failed: {other:?}");
                    continue;
                }
            };
            let Ok(parsed) = serde_json::from_str::<Json>(&out.stdout.join("\n")) else {
                warn!("unparsable list-jobs output for {state}");
                continue;
            };
            apply_job_summaries(&mut map, &parsed, state);
        }

        *self.cache.lock().unwrap() = Some((Instant::now(), map.clone()));
        map
    }
}

/// Fold one `list-jobs` answer into the name → state map, honoring the
/// grace windows for terminal states.
///
pub fn apply_job_summaries(map: &mut HashMap<String, String>, parsed: &Json, state: &str) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let Some(list) = parsed.get("jobSummaryList").and_then(Json::as_array) else {
        return;
    };
    for job in list {
        let (Some(name), Some(status)) = (
            job.get("jobName").and_then(Json::as_str),
            job.get("status").and_then(Json::as_str),
        ) else {
            continue;
        };
        let stopped_at = job.get("stoppedAt").and_then(Json::as_f64).map(|ms| ms / 1000.0);
        match state {
            "FAILED" => {
                let age = stopped_at.map(|s| now - s).unwrap_or(0.0);
                if age > IGNORE_FAILED_JOBS_AFTER.as_secs_f64() {
                    map.remove(name);
                } else {
                    map.insert(name.to_string(), status.to_string());
                }
            }
            "SUCCEEDED" => {
                let age = stopped_at.map(|s| now - s).unwrap_or(0.0);
                if age > IGNORE_SUCCEEDED_JOBS_AFTER.as_secs_f64() {
                    map.remove(name);
                } else {
                    map.insert(name.to_string(), status.to_string());
                }
            }
            _ => {
                map.insert(name.to_string(), status.to_string());
            }
        }
    }
}

/// Batch job names are limited to `[A-Za-z0-9_-]`.
pub fn escape_name(name: &str, task_id: TaskId) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("{safe}_{task_id}")
}

/// Normalise a native Batch state.  `FAILED` deliberately reports
/// unknown so the manager falls back to the on-disk markers and the
/// retry bookkeeping instead of a terminal queue error.
///
pub fn classify_state(state: Option<&str>) -> EngineState {
    match state {
        None => EngineState::Unknown,
        Some("SUBMITTED") | Some("PENDING") | Some("RUNNABLE") | Some("STARTING") => {
            EngineState::Queue
        }
        Some("RUNNING") => EngineState::Running,
        Some("FAILED") => EngineState::Unknown,
        Some(other) => {
            warn!("unknown AWS engine state {other}");
            EngineState::Unknown
        }
    }
}

impl Engine for AwsBatchEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn reset_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }

    fn get_default_rqmt(&self, _task: &Task) -> Rqmt {
        self.default_rqmt.clone()
    }

    fn task_state(&self, task: &Task, task_id: TaskId) -> EngineState {
        let name = escape_name(&task.task_name(), task_id);
        let queue = self.queue_state();
        classify_state(queue.get(&name).map(String::as_str))
    }

    fn submit_call(
        &self,
        call: &[String],
        _logpath: &Path,
        rqmt: &Rqmt,
        name: &str,
        _task_name: &str,
        task_ids: &[TaskId],
    ) -> Result<SubmitResult, EngineError> {
        let mut submitted = Vec::new();
        for task_id in task_ids {
            let job_id = self.submit_one(call, rqmt, name, *task_id)?;
            submitted.push(json!([[task_id], job_id]));
        }
        Ok(SubmitResult { engine_name: ENGINE_NAME.to_string(), engine_info: json!(submitted) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_name() {
        assert_eq!(
            "task_test_Test_1a2B3c4D5e6F_run_3",
            escape_name("task/test/Test.1a2B3c4D5e6F.run", 3)
        );
    }

    #[test]
    fn test_classify_state_failed_reports_unknown() {
        assert_eq!(EngineState::Unknown, classify_state(Some("FAILED")));
        assert_eq!(EngineState::Unknown, classify_state(None));
        assert_eq!(EngineState::Queue, classify_state(Some("RUNNABLE")));
        assert_eq!(EngineState::Running, classify_state(Some("RUNNING")));
    }

    #[test]
    fn test_terminal_entries_respect_grace_window() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as f64;
        let fresh = json!({"jobSummaryList": [
            {"jobName": "a_1", "status": "FAILED", "stoppedAt": now_ms},
        ]});
        let stale = json!({"jobSummaryList": [
            {"jobName": "b_1", "status": "FAILED", "stoppedAt": now_ms - 2.0 * 3600.0 * 1000.0},
        ]});
        let mut map = HashMap::new();
        map.insert("b_1".to_string(), "RUNNING".to_string());
        apply_job_summaries(&mut map, &fresh, "FAILED");
        apply_job_summaries(&mut map, &stale, "FAILED");
        assert_eq!(Some(&"FAILED".to_string()), map.get("a_1"));
        assert!(!map.contains_key("b_1"), "stale failed entry evicted");
    }
}
