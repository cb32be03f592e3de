//! Shared plumbing for the batch-system adapters.
//!
//! Every adapter is a thin strategy over the same skeleton: build the
//! backend command (optionally through an ssh gateway), run it with a
//! bounded timeout, parse the queue listing into a per-instance map and
//! cache that parse for a short while.
//!

pub use aws::AwsBatchEngine;
pub use gridengine::GridEngine;
pub use lsf::LsfEngine;
pub use pbs::PbsEngine;
pub use slurm::SlurmEngine;

mod aws;
mod gridengine;
mod lsf;
mod pbs;
mod slurm;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use sisyphus_core::{EngineError, TaskId};

/// How long a backend call may take before it is killed and retried.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a parsed queue listing stays valid.
pub const QUEUE_CACHE_TTL: Duration = Duration::from_secs(30);

/// How often a failing backend call is retried before giving up.
pub const BACKEND_RETRIES: usize = 5;

/// Queue listing: `(job name, task id) → [(native id, native state)]`.
pub type QueueMap = HashMap<(String, TaskId), Vec<(String, String)>>;

#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub status: i32,
}

/// Run a backend command, optionally via `ssh <gateway>`, with the
/// shared timeout.  Output is split into lines.
///
pub fn system_call(
    gateway: Option<&str>,
    command: &[String],
    send_to_stdin: Option<&str>,
) -> Result<CmdOutput, EngineError> {
    let system_command: Vec<String> = match gateway {
        Some(gw) => {
            // parameters must be shell safe when sent through ssh
            let escaped: Vec<String> = command
                .iter()
                .map(|s| shlex::try_quote(s).map(|q| q.into_owned()).unwrap_or_else(|_| s.clone()))
                .collect();
            let cwd = std::env::current_dir().unwrap_or_default();
            vec![
                "ssh".to_string(),
                "-x".to_string(),
                gw.to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                format!("cd {} && {}", cwd.display(), escaped.join(" ")),
            ]
        }
        None => command.to_vec(),
    };
    debug!("shell_cmd: {}", system_command.join(" "));

    let mut child = Command::new(&system_command[0])
        .args(&system_command[1..])
        .stdin(if send_to_stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(data) = send_to_stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data.as_bytes());
        }
    }

    // drain the pipes off-thread so a chatty backend can not dead-lock us
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let out_reader = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(ref mut p) = stdout_pipe {
            let _ = p.read_to_string(&mut buf);
        }
        buf
    });
    let err_reader = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(ref mut p) = stderr_pipe {
            let _ = p.read_to_string(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + BACKEND_TIMEOUT;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::Timeout(system_command.join(" ")));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    Ok(CmdOutput {
        stdout: stdout.lines().map(str::to_string).collect(),
        stderr: stderr.lines().map(str::to_string).collect(),
        status: status.code().unwrap_or(-1),
    })
}

/// Retry wrapper for transient backend failures: timeouts and non-zero
/// listings back off and try again, bounded.
///
pub fn with_backoff<T>(
    what: &str,
    wait: Duration,
    mut f: impl FnMut() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let mut last = None;
    for attempt in 0..BACKEND_RETRIES {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!("{what} failed (attempt {}): {e}", attempt + 1);
                last = Some(e);
                std::thread::sleep(wait);
            }
        }
    }
    Err(last.unwrap_or_else(|| EngineError::Timeout(what.to_string())))
}

/// A parsed queue listing with a TTL.
///
pub struct QueueCache {
    inner: Mutex<Option<(Instant, QueueMap)>>,
}

impl QueueCache {
    pub fn new() -> QueueCache {
        QueueCache { inner: Mutex::new(None) }
    }

    /// Return the cached map, refreshing through `f` once it expired.
    pub fn get_or_refresh(
        &self,
        f: impl FnOnce() -> Result<QueueMap, EngineError>,
    ) -> Result<QueueMap, EngineError> {
        let mut guard = self.inner.lock().unwrap();
        if let Some((at, map)) = guard.as_ref() {
            if at.elapsed() < QUEUE_CACHE_TTL {
                return Ok(map.clone());
            }
        }
        let map = f()?;
        *guard = Some((Instant::now(), map.clone()));
        Ok(map)
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

impl Default for QueueCache {
    fn default() -> Self {
        QueueCache::new()
    }
}

/// Group sorted task ids into contiguous `(start, end, step)` runs, the
/// shape every array-job syntax wants.
///
pub fn array_ranges(task_ids: &[TaskId]) -> Vec<(TaskId, TaskId, TaskId)> {
    let mut out = Vec::new();
    let mut ids = task_ids.to_vec();
    ids.sort_unstable();
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        if i + 1 >= ids.len() {
            out.push((start, start, 1));
            break;
        }
        let step = ids[i + 1] - ids[i];
        let mut end = ids[i + 1];
        let mut j = i + 1;
        while j + 1 < ids.len() && ids[j + 1] - ids[j] == step {
            end = ids[j + 1];
            j += 1;
        }
        out.push((start, end, step.max(1)));
        i = j + 1;
    }
    out
}

/// Engine-side job names must not contain slashes.
pub fn process_task_name(name: &str) -> String {
    name.replace('/', ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_ranges() {
        assert_eq!(vec![(1, 3, 1)], array_ranges(&[1, 2, 3]));
        assert_eq!(vec![(1, 1, 1)], array_ranges(&[1]));
        assert_eq!(vec![(1, 5, 2)], array_ranges(&[1, 3, 5]));
        assert_eq!(vec![(1, 2, 1), (7, 7, 1)], array_ranges(&[1, 2, 7]));
        assert!(array_ranges(&[]).is_empty());
    }

    #[test]
    fn test_process_task_name() {
        assert_eq!(
            "task.test.Test.1a2B3c4D5e6F.run",
            process_task_name("task/test/Test.1a2B3c4D5e6F.run")
        );
    }

    #[test]
    fn test_system_call_splits_lines() {
        let out = system_call(
            None,
            &["/bin/sh".into(), "-c".into(), "echo one; echo two 1>&2".into()],
            None,
        )
        .unwrap();
        assert_eq!(vec!["one"], out.stdout);
        assert_eq!(vec!["two"], out.stderr);
        assert_eq!(0, out.status);
    }

    #[test]
    fn test_system_call_stdin() {
        let out =
            system_call(None, &["/bin/cat".into()], Some("submit script\n")).unwrap();
        assert_eq!(vec!["submit script"], out.stdout);
    }
}
