//! Cleanup of the work tree: archiving finished jobs, sweeping
//! directories that fell out of the graph, and applying the keep-value
//! policy.
//!
//! All destructive operations list the affected directories first and
//! ask for a typed confirmation unless forced or dry-running.
//!

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strum::{Display, EnumString};
use tracing::{error, info, warn};

use sisyphus_common::Settings;
use sisyphus_core::{Job, SisGraph};

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum CleanupMode {
    Remove,
    Move,
    Dryrun,
}

/// Why a directory is exempt from (or subject to) cleanup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirStatus {
    /// Parent directory of jobs in the graph.
    InGraph,
    /// Unfinished jobs are never touched.
    NotFinished,
    /// Finished, but an unfinished job still reads from it.
    StillNeeded,
    /// Subject to the keep-value threshold.
    KeepValue(Option<u8>),
}

/// Archive every finished, unarchived job: everything but `output/`
/// moves into `finished.tar.gz`.
///
pub fn cleanup_jobs(graph: &SisGraph) {
    for job in graph.jobs() {
        if job.cleanable() {
            info!("cleanup: {}", job.dir().display());
            if let Err(e) = job.cleanup() {
                warn!("could not clean {job}: {e}");
            }
        }
    }
}

/// The jobs still needed to compute anything unfinished: for a finished
/// job that is itself, for an unfinished one its finished ancestry.
///
fn needed_jobs(job: &Arc<Job>, memo: &mut HashMap<String, HashSet<String>>) -> HashSet<String> {
    if let Some(cached) = memo.get(job.id()) {
        return cached.clone();
    }
    // claim the slot first so shared ancestors are computed once
    memo.insert(job.id().to_string(), HashSet::new());
    let mut out = HashSet::new();
    if job.finished() {
        out.insert(job.id().to_string());
    } else {
        for input in job.inputs() {
            if let Some(creator) = input.creator().job() {
                out.extend(needed_jobs(&creator, memo));
            }
        }
    }
    memo.insert(job.id().to_string(), out.clone());
    out
}

/// Walk the graph and classify every job directory, plus the parent
/// directories leading to them.
///
pub fn extract_keep_values(graph: &SisGraph) -> HashMap<PathBuf, DirStatus> {
    let mut needed: HashSet<String> = HashSet::new();
    let mut memo = HashMap::new();
    for target in graph.targets() {
        for path in target.required_full_list() {
            if let Some(creator) = path.creator().job() {
                needed.extend(needed_jobs(&creator, &mut memo));
            }
        }
    }

    let mut dirs: HashMap<PathBuf, DirStatus> = HashMap::new();
    for job in graph.jobs() {
        let status = if needed.contains(job.id()) {
            DirStatus::StillNeeded
        } else if !job.finished() {
            DirStatus::NotFinished
        } else {
            DirStatus::KeepValue(job.keep_value())
        };
        let dir = job.dir();
        mark_parents(&mut dirs, &dir);
        dirs.insert(dir, status);
    }
    dirs
}

/// All directories used by the loaded graph, cleanup-exempt.
pub fn list_all_graph_directories(graph: &SisGraph) -> HashMap<PathBuf, DirStatus> {
    let mut dirs: HashMap<PathBuf, DirStatus> = HashMap::new();
    for job in graph.jobs() {
        let dir = job.dir();
        mark_parents(&mut dirs, &dir);
        dirs.insert(dir, DirStatus::StillNeeded);
    }
    dirs
}

fn mark_parents(dirs: &mut HashMap<PathBuf, DirStatus>, dir: &Path) {
    let mut parent = dir.parent();
    while let Some(p) = parent {
        if p.as_os_str().is_empty() {
            break;
        }
        dirs.entry(p.to_path_buf()).or_insert(DirStatus::InGraph);
        parent = p.parent();
    }
}

/// Directories whose keep value falls below the threshold.  A job with
/// no declared value uses the configured default.
///
pub fn find_too_low_keep_value(
    dirs: &HashMap<PathBuf, DirStatus>,
    min_keep_value: u8,
    settings: &Settings,
) -> BTreeSet<PathBuf> {
    let mut out = BTreeSet::new();
    for (path, status) in dirs {
        if let DirStatus::KeepValue(kv) = status {
            let kv = kv.unwrap_or(settings.job_default_keep_value);
            if kv < min_keep_value {
                out.insert(path.clone());
            }
        }
    }
    out
}

/// Walk the on-disk work tree and list every directory the graph does
/// not know about.
///
pub fn search_for_unused(
    dirs: &HashMap<PathBuf, DirStatus>,
    current: &Path,
) -> BTreeSet<PathBuf> {
    let mut unused = BTreeSet::new();
    let Ok(entries) = fs::read_dir(current) else {
        return unused;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match dirs.get(&path) {
            None => {
                unused.insert(path);
            }
            Some(DirStatus::InGraph) => {
                let found = search_for_unused(dirs, &path);
                info!(
                    "found {} unused directories in {} (total so far: {})",
                    found.len(),
                    path.display(),
                    unused.len() + found.len()
                );
                unused.extend(found);
            }
            // belongs to the graph, keep it
            Some(_) => {}
        }
    }
    unused
}

/// List the affected directories and, after confirmation, remove or
/// move them.
///
pub fn remove_directories(
    dirs: &BTreeSet<PathBuf>,
    message: &str,
    mode: CleanupMode,
    force: bool,
) -> eyre::Result<()> {
    info!("{message}");
    info!("number of affected directories: {}", dirs.len());
    if dirs.is_empty() {
        return Ok(());
    }
    for dir in dirs {
        info!("  {}", dir.display());
    }

    let confirmed = match mode {
        CleanupMode::Dryrun => false,
        _ if force => true,
        _ => {
            let verb = if mode == CleanupMode::Move { "Move" } else { "Delete" };
            print!("{verb} directories? (y/n): ");
            let _ = io::stdout().flush();
            let mut answer = String::new();
            let _ = io::stdin().lock().read_line(&mut answer);
            answer.trim().eq_ignore_ascii_case("y")
        }
    };
    if !confirmed {
        if mode != CleanupMode::Dryrun {
            error!("abort");
        }
        return Ok(());
    }

    for (num, dir) in dirs.iter().enumerate() {
        match mode {
            CleanupMode::Move => {
                let dirname = dir.file_name().unwrap_or_default().to_string_lossy().into_owned();
                let dest = (1..)
                    .map(|i| dir.with_file_name(format!("{dirname}.cleanup.{i:04}")))
                    .find(|p| !p.exists())
                    .unwrap();
                info!("move: {} to {}", dir.display(), dest.display());
                fs::rename(dir, &dest)?;
            }
            CleanupMode::Remove => {
                info!("delete: ({}/{}) {}", num + 1, dirs.len(), dir.display());
                let result = if dir.is_symlink() {
                    fs::remove_file(dir)
                } else {
                    fs::remove_dir_all(dir)
                };
                if let Err(e) = result {
                    error!("{e}");
                }
            }
            CleanupMode::Dryrun => {}
        }
    }
    Ok(())
}

/// Remove work directories that do not belong to the current graph.
///
pub fn cleanup_unused(
    graph: &SisGraph,
    settings: &Settings,
    mode: CleanupMode,
    force: bool,
) -> eyre::Result<()> {
    let dirs = list_all_graph_directories(graph);
    let unused = search_for_unused(&dirs, &settings.work_dir);
    remove_directories(&unused, "not used in graph", mode, force)
}

/// Apply the keep-value filter below the given threshold.
///
pub fn cleanup_keep_value(
    graph: &SisGraph,
    settings: &Settings,
    min_keep_value: u8,
    mode: CleanupMode,
    force: bool,
) -> eyre::Result<()> {
    if min_keep_value == 0 {
        error!("keep value must be larger than 0");
        return Ok(());
    }
    let dirs = extract_keep_values(graph);
    let to_remove = find_too_low_keep_value(&dirs, min_keep_value, settings);
    remove_directories(&to_remove, "jobs with keep value below the threshold", mode, force)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_value_defaults_when_unset() {
        // A job without a declared keep value behaves as if it had the
        // configured default.  Call sites disagree on what an unset
        // value means; this pins the "use the default" reading.
        let settings = Settings { job_default_keep_value: 50, ..Settings::immediate() };
        let mut dirs = HashMap::new();
        dirs.insert(PathBuf::from("work/a"), DirStatus::KeepValue(None));
        dirs.insert(PathBuf::from("work/b"), DirStatus::KeepValue(Some(10)));
        dirs.insert(PathBuf::from("work/c"), DirStatus::KeepValue(Some(90)));
        dirs.insert(PathBuf::from("work/d"), DirStatus::StillNeeded);

        let low = find_too_low_keep_value(&dirs, 40, &settings);
        assert_eq!(BTreeSet::from([PathBuf::from("work/b")]), low);

        // a threshold above the default also claims undeclared jobs
        let low = find_too_low_keep_value(&dirs, 60, &settings);
        assert!(low.contains(&PathBuf::from("work/a")));
        assert!(low.contains(&PathBuf::from("work/b")));
        assert!(!low.contains(&PathBuf::from("work/c")));
        assert!(!low.contains(&PathBuf::from("work/d")));
    }

    #[test]
    fn test_search_for_unused() {
        let base = tempfile::tempdir().unwrap();
        let work = base.path().join("work");
        fs::create_dir_all(work.join("task/known")).unwrap();
        fs::create_dir_all(work.join("task/stray")).unwrap();
        fs::create_dir_all(work.join("orphan")).unwrap();

        let mut dirs = HashMap::new();
        dirs.insert(work.join("task"), DirStatus::InGraph);
        dirs.insert(work.join("task/known"), DirStatus::StillNeeded);

        let unused = search_for_unused(&dirs, &work);
        assert_eq!(
            BTreeSet::from([work.join("task/stray"), work.join("orphan")]),
            unused
        );
    }

    #[test]
    fn test_remove_directories_dryrun_keeps_everything() {
        let base = tempfile::tempdir().unwrap();
        let victim = base.path().join("victim");
        fs::create_dir_all(&victim).unwrap();
        let set = BTreeSet::from([victim.clone()]);
        remove_directories(&set, "test", CleanupMode::Dryrun, false).unwrap();
        assert!(victim.is_dir());
    }

    #[test]
    fn test_remove_directories_move_is_dense() {
        let base = tempfile::tempdir().unwrap();
        let victim = base.path().join("victim");
        fs::create_dir_all(&victim).unwrap();
        let set = BTreeSet::from([victim.clone()]);
        remove_directories(&set, "test", CleanupMode::Move, true).unwrap();
        assert!(!victim.exists());
        assert!(base.path().join("victim.cleanup.0001").is_dir());

        fs::create_dir_all(&victim).unwrap();
        remove_directories(&set, "test", CleanupMode::Move, true).unwrap();
        assert!(base.path().join("victim.cleanup.0002").is_dir());
    }

    #[test]
    fn test_remove_directories_force_removes() {
        let base = tempfile::tempdir().unwrap();
        let victim = base.path().join("victim");
        fs::create_dir_all(&victim).unwrap();
        let set = BTreeSet::from([victim.clone()]);
        remove_directories(&set, "test", CleanupMode::Remove, true).unwrap();
        assert!(!victim.exists());
    }
}
