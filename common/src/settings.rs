//! The immutable settings record.
//!
//! Everything that used to be a tweakable global lives here: directory
//! names, wait periods, worker counts, and the engine table.  The record
//! is loaded once from `sisyphus.hcl` (every field has a default) and is
//! then passed down through constructors, never mutated.
//!

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

/// Default settings file, looked up in the current directory.
pub const SETTINGS_FILE: &str = "sisyphus.hcl";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("can not read settings file {0}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("settings file {0} does not parse: {1}")]
    Invalid(PathBuf, String),
}

/// Per-engine default requirements.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultRqmt {
    pub cpu: u32,
    pub gpu: u32,
    /// Memory in GiB.
    pub mem: f64,
    /// Wall time in hours.
    pub time: f64,
}

impl Default for DefaultRqmt {
    fn default() -> Self {
        DefaultRqmt { cpu: 1, gpu: 0, mem: 1.0, time: 1.0 }
    }
}

/// How a cluster engine requests memory from the backend.
///
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAllocation {
    PerCpu,
    #[default]
    PerNode,
}

/// One named entry of the engine table.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// In-process pool, bounded by the given resources.
    Local {
        #[serde(default = "default_cpu")]
        cpu: u32,
        #[serde(default)]
        gpu: u32,
        #[serde(default)]
        mem: Option<f64>,
    },
    /// Slurm via sbatch/squeue.
    Slurm {
        #[serde(default)]
        gateway: Option<String>,
        #[serde(default)]
        memory_allocation: MemoryAllocation,
        #[serde(default)]
        default_rqmt: DefaultRqmt,
    },
    /// Grid-engine family via qsub/qstat -xml.
    GridEngine {
        #[serde(default)]
        gateway: Option<String>,
        #[serde(default)]
        parallel_environment: Option<String>,
        #[serde(default)]
        default_rqmt: DefaultRqmt,
    },
    /// LSF via bsub/bjobs.
    Lsf {
        #[serde(default)]
        gateway: Option<String>,
        #[serde(default)]
        default_rqmt: DefaultRqmt,
    },
    /// PBS/Torque via qsub/qstat -F json.
    Pbs {
        #[serde(default)]
        gateway: Option<String>,
        #[serde(default)]
        default_rqmt: DefaultRqmt,
    },
    /// AWS Batch via the aws CLI.
    AwsBatch {
        job_queue: String,
        job_definition: String,
        #[serde(default)]
        default_rqmt: DefaultRqmt,
    },
}

fn default_cpu() -> u32 {
    1
}

/// The engine table: named sub-engines plus the default route.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineTable {
    pub default: String,
    pub engines: BTreeMap<String, EngineConfig>,
}

impl Default for EngineTable {
    fn default() -> Self {
        let mut engines = BTreeMap::new();
        engines.insert(
            "local".to_string(),
            EngineConfig::Local { cpu: 4, gpu: 0, mem: None },
        );
        EngineTable { default: "local".to_string(), engines }
    }
}

/// The settings record.  All durations are in seconds.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    // Base directories
    pub work_dir: PathBuf,
    pub alias_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Non-empty to place aliases and outputs in a subdir, useful for
    /// setups with multiple configs.
    pub alias_and_output_subdir: String,
    /// If set, finished jobs are additionally linked below this directory.
    pub team_share_dir: Option<PathBuf>,

    // Worker pools
    pub graph_workers: usize,
    pub submit_workers: usize,
    pub cleaner_workers: usize,

    // Cleanup policy
    pub job_auto_cleanup: bool,
    pub job_cleaner_interval: u64,
    pub job_cleanup_keep_work: bool,
    pub job_default_keep_value: u8,

    // Wait periods
    pub wait_period_job_fs_sync: u64,
    pub wait_period_between_checks: u64,
    pub wait_period_cache: u64,
    pub wait_period_ssh_timeout: u64,
    pub wait_period_qstat_parsing: u64,
    pub wait_period_job_cleanup: u64,
    pub wait_period_mtime_of_inputs: u64,

    // Process control logging
    pub plogging_interval: u64,
    pub plogging_update_file_period: u64,
    pub plogging_min_change: f64,
    pub plogging_quiet: bool,

    // Error handling
    pub max_submit_retries: usize,
    pub clear_errors: bool,
    pub print_error_tasks: usize,
    pub print_error_lines: usize,
    /// Reading an unset variable without a backup either fails hard or
    /// yields a placeholder string.
    pub variable_not_set_is_error: bool,

    pub filesystem_cache_time: u64,

    /// The engine table.
    pub engine: EngineTable,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            work_dir: PathBuf::from("work"),
            alias_dir: PathBuf::from("alias"),
            output_dir: PathBuf::from("output"),
            alias_and_output_subdir: String::new(),
            team_share_dir: None,
            graph_workers: 16,
            submit_workers: 10,
            cleaner_workers: 5,
            job_auto_cleanup: true,
            job_cleaner_interval: 60,
            job_cleanup_keep_work: false,
            job_default_keep_value: 50,
            wait_period_job_fs_sync: 30,
            wait_period_between_checks: 30,
            wait_period_cache: 20,
            wait_period_ssh_timeout: 15,
            wait_period_qstat_parsing: 15,
            wait_period_job_cleanup: 10,
            wait_period_mtime_of_inputs: 60,
            plogging_interval: 5,
            plogging_update_file_period: 60,
            plogging_min_change: 0.1,
            plogging_quiet: false,
            max_submit_retries: 3,
            clear_errors: false,
            print_error_tasks: 1,
            print_error_lines: 40,
            variable_not_set_is_error: false,
            filesystem_cache_time: 30,
            engine: EngineTable::default(),
        }
    }
}

impl Settings {
    /// Load settings from the given file, or from `sisyphus.hcl` in the
    /// current directory.  A missing default file yields the defaults.
    ///
    #[tracing::instrument]
    pub fn load(fname: Option<PathBuf>) -> Result<Self, SettingsError> {
        trace!("settings::load");
        let (path, required) = match fname {
            Some(p) => (p, true),
            None => (PathBuf::from(SETTINGS_FILE), false),
        };
        if !path.exists() && !required {
            debug!("no {SETTINGS_FILE}, using defaults");
            return Ok(Settings::default());
        }
        let data =
            fs::read_to_string(&path).map_err(|e| SettingsError::Unreadable(path.clone(), e))?;
        let s: Settings =
            hcl::from_str(&data).map_err(|e| SettingsError::Invalid(path.clone(), e.to_string()))?;
        Ok(s)
    }

    /// Settings with all wait periods zeroed, used by tests that poke
    /// markers and do not want to sleep.
    ///
    pub fn immediate() -> Self {
        Settings {
            wait_period_job_fs_sync: 0,
            wait_period_between_checks: 0,
            wait_period_cache: 0,
            wait_period_ssh_timeout: 0,
            wait_period_qstat_parsing: 0,
            wait_period_job_cleanup: 0,
            wait_period_mtime_of_inputs: 0,
            ..Settings::default()
        }
    }

    /// Root a settings record below the given directory (work, alias and
    /// output dirs become absolute).
    ///
    pub fn rooted_at(mut self, base: &Path) -> Self {
        self.work_dir = base.join(&self.work_dir);
        self.alias_dir = base.join(&self.alias_dir);
        self.output_dir = base.join(&self.output_dir);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(PathBuf::from("work"), s.work_dir);
        assert_eq!(50, s.job_default_keep_value);
        assert_eq!("local", s.engine.default);
    }

    #[test]
    fn test_load_missing_default_is_ok() {
        let s = Settings::load(None).unwrap();
        assert_eq!(Settings::default(), s);
    }

    #[test]
    fn test_load_hcl() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
work_dir = "work2"
job_default_keep_value = 10

engine {{
  default = "long"

  engines = {{
    short = {{ kind = "local", cpu = 2 }}
    long  = {{ kind = "slurm", default_rqmt = {{ cpu = 1, mem = 2.0 }} }}
  }}
}}
"#
        )
        .unwrap();
        let s = Settings::load(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(PathBuf::from("work2"), s.work_dir);
        assert_eq!(10, s.job_default_keep_value);
        assert_eq!("long", s.engine.default);
        assert!(matches!(
            s.engine.engines.get("short"),
            Some(EngineConfig::Local { cpu: 2, .. })
        ));
        match s.engine.engines.get("long") {
            Some(EngineConfig::Slurm { default_rqmt, .. }) => {
                assert_eq!(2.0, default_rqmt.mem);
                assert_eq!(1.0, default_rqmt.time);
            }
            e => panic!("unexpected engine entry: {e:?}"),
        }
    }
}
