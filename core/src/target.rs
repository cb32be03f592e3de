//! Output targets: the named roots of the graph.
//!
//! A target names one or more paths that must be computed.  Once every
//! required path is available the target fires: an output link, a
//! rendered report, or a callback.
//!

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use sisyphus_common::Settings;

use crate::delayed::{py_str, Delayed};
use crate::error::JobError;
use crate::paths::SisPath;
use crate::value::Value;

type Callback = Box<dyn Fn() -> Result<(), JobError> + Send + Sync>;

enum TargetKind {
    /// Symlink a single path into the output namespace when ready.
    Path { output_path: String, sis_path: SisPath },
    /// Render a template with values periodically and once done.
    Report {
        output_path: String,
        template: Option<String>,
        values: Vec<(String, Value)>,
        update_frequency: Duration,
        last_update: Mutex<Option<Instant>>,
    },
    /// Run a callback when the dependencies are ready.
    Call { callback: Callback },
}

/// A named output request.
///
pub struct Target {
    name: String,
    required: Mutex<BTreeSet<SisPath>>,
    required_full: Vec<SisPath>,
    kind: TargetKind,
}

impl Target {
    /// Link `<output-dir>/<subdir>/<output_path>` to the given path.
    pub fn output_path(output_path: &str, sis_path: SisPath) -> Target {
        Target {
            name: output_path.to_string(),
            required: Mutex::new(BTreeSet::from([sis_path.clone()])),
            required_full: vec![sis_path.clone()],
            kind: TargetKind::Path { output_path: output_path.to_string(), sis_path },
        }
    }

    /// Render `template` with `values` into `<output-dir>/<output_path>`.
    pub fn report(
        output_path: &str,
        template: Option<String>,
        values: Vec<(String, Value)>,
        update_frequency: Duration,
    ) -> Target {
        let mut required = Vec::new();
        for (_, v) in &values {
            v.extract_paths(&mut required);
        }
        Target {
            name: output_path.to_string(),
            required: Mutex::new(required.iter().cloned().collect()),
            required_full: required,
            kind: TargetKind::Report {
                output_path: output_path.to_string(),
                template,
                values,
                update_frequency,
                last_update: Mutex::new(None),
            },
        }
    }

    /// Run `callback` once all of `required` are available.
    pub fn call(name: &str, required: Vec<SisPath>, callback: Callback) -> Target {
        Target {
            name: name.to_string(),
            required: Mutex::new(required.iter().cloned().collect()),
            required_full: required,
            kind: TargetKind::Call { callback },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every path this target ever required, available or not.
    pub fn required_full_list(&self) -> &[SisPath] {
        &self.required_full
    }

    /// Paths still missing.
    pub fn required(&self) -> BTreeSet<SisPath> {
        self.required.lock().unwrap().clone()
    }

    /// Drop requirements that became available; reports also refresh
    /// their rendered file when due.
    ///
    pub fn update_requirements(&self, write_output: bool, settings: &Settings) {
        {
            let mut req = self.required.lock().unwrap();
            let done: Vec<SisPath> = req.iter().filter(|p| p.available()).cloned().collect();
            for p in done {
                req.remove(&p);
            }
        }
        if let TargetKind::Report { update_frequency, last_update, .. } = &self.kind {
            let mut last = last_update.lock().unwrap();
            let due = last.map_or(true, |at| at.elapsed() >= *update_frequency);
            if due && write_output {
                *last = Some(Instant::now());
                if let Err(e) = self.write_report(settings) {
                    warn!("could not write report {}: {e}", self.name);
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.required.lock().unwrap().is_empty()
    }

    /// Fire the target.  Linking is idempotent.
    ///
    pub fn run_when_done(&self, write_output: bool, settings: &Settings) -> Result<(), JobError> {
        match &self.kind {
            TargetKind::Path { output_path, sis_path } => {
                if !write_output {
                    return Ok(());
                }
                let outfile = settings
                    .output_dir
                    .join(&settings.alias_and_output_subdir)
                    .join(output_path);
                if let Some(dir) = outfile.parent() {
                    fs::create_dir_all(dir)?;
                }
                let target: PathBuf = sis_path.get_path();
                let target = target.canonicalize().unwrap_or(target);

                // drop a link pointing somewhere else
                if outfile.is_symlink() && outfile.canonicalize().ok().as_deref() != Some(&target) {
                    fs::remove_file(&outfile)?;
                }
                if !outfile.is_symlink() {
                    info!("finished output: {}", outfile.display());
                    std::os::unix::fs::symlink(&target, &outfile)?;
                }
                Ok(())
            }
            TargetKind::Report { .. } => {
                if write_output {
                    self.write_report(settings)?;
                }
                Ok(())
            }
            TargetKind::Call { callback } => callback(),
        }
    }

    fn write_report(&self, settings: &Settings) -> Result<(), JobError> {
        let TargetKind::Report { output_path, template, values, .. } = &self.kind else {
            return Ok(());
        };
        let outfile = settings.output_dir.join(output_path);
        if let Some(dir) = outfile.parent() {
            fs::create_dir_all(dir)?;
        }
        // never write through someone else's link
        if outfile.is_symlink() {
            fs::remove_file(&outfile)?;
        }

        let mut rendered = String::new();
        match template {
            Some(t) => {
                rendered = t.clone();
                for (key, value) in values {
                    let forced = Delayed::Leaf(value.clone())
                        .get()
                        .map(|v| py_str(&v))
                        .unwrap_or_else(|_| "<unfinished>".to_string());
                    rendered = rendered.replace(&format!("{{{key}}}"), &forced);
                }
            }
            None => {
                for (key, value) in values {
                    let forced = Delayed::Leaf(value.clone())
                        .get()
                        .map(|v| py_str(&v))
                        .unwrap_or_else(|_| "<unfinished>".to_string());
                    rendered.push_str(&format!("{key}: {forced}\n"));
                }
            }
        }
        fs::write(&outfile, rendered)?;
        Ok(())
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("missing", &self.required.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_target_links_when_done() {
        let dir = tempfile::tempdir().unwrap();
        let settings = sisyphus_common::Settings::immediate().rooted_at(dir.path());

        let produced = dir.path().join("produced.txt");
        fs::write(&produced, "data").unwrap();
        let path = SisPath::external(produced.to_str().unwrap());

        let target = Target::output_path("result.txt", path);
        assert!(!target.is_done());
        target.update_requirements(false, &settings);
        assert!(target.is_done());

        target.run_when_done(true, &settings).unwrap();
        let link = settings.output_dir.join("result.txt");
        assert!(link.is_symlink());
        assert_eq!(produced.canonicalize().unwrap(), link.canonicalize().unwrap());

        // idempotent
        target.run_when_done(true, &settings).unwrap();
        assert!(link.is_symlink());
    }

    #[test]
    fn test_report_renders_template() {
        let dir = tempfile::tempdir().unwrap();
        let settings = sisyphus_common::Settings::immediate().rooted_at(dir.path());

        let target = Target::report(
            "summary.txt",
            Some("wer={wer} ok={ok}".to_string()),
            vec![
                ("wer".to_string(), Value::Float(12.5)),
                ("ok".to_string(), Value::Bool(true)),
            ],
            Duration::from_secs(300),
        );
        assert!(target.is_done());
        target.run_when_done(true, &settings).unwrap();
        let text = fs::read_to_string(settings.output_dir.join("summary.txt")).unwrap();
        assert_eq!("wer=12.5 ok=True", text);
    }

    #[test]
    fn test_call_target_fires() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let settings = sisyphus_common::Settings::immediate().rooted_at(dir.path());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let target = Target::call(
            "notify",
            vec![],
            Box::new(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(target.is_done());
        target.run_when_done(true, &settings).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
