//! Typed handles to files and values produced by jobs.
//!
//! A [`SisPath`] carries provenance (its creator job) and defers any
//! formatting until it is consumed; its hash depends only on the creator
//! id and the relative name, never on filesystem state.  A variable is a
//! path whose content is a single structured value.
//!

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::consts::{JOB_FINISHED_ARCHIVE, JOB_FINISHED_MARKER, JOB_OUTPUT};
use crate::error::VariableError;
use crate::hash::sis_hash;
use crate::job::Job;
use crate::literal::{parse_literal, repr_value};
use crate::value::{Value, ValueRepr};

// ----- worker context

static IN_WORKER: AtomicBool = AtomicBool::new(false);
static STRICT_WORKER_CHECK: AtomicBool = AtomicBool::new(false);

/// Mark this process as a worker; variables may be read from now on.
pub fn enter_worker_context() {
    IN_WORKER.store(true, Ordering::SeqCst);
}

pub fn in_worker() -> bool {
    IN_WORKER.load(Ordering::SeqCst)
}

/// When strict, reading a variable outside a worker is an error instead
/// of a quiet allowance.
pub fn set_strict_worker_check(strict: bool) {
    STRICT_WORKER_CHECK.store(strict, Ordering::SeqCst);
}

// ----- file caching hook

type FileCacher = Box<dyn Fn(&Path) -> PathBuf + Send + Sync>;

static FILE_CACHER: OnceCell<FileCacher> = OnceCell::new();
static CACHING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install a site-specific cache manager, e.g. one that copies inputs to
/// node-local storage.  Workers enable consumption-time caching.
pub fn set_file_caching(f: FileCacher) {
    let _ = FILE_CACHER.set(f);
}

pub fn enable_file_caching() {
    CACHING_ENABLED.store(true, Ordering::SeqCst);
}

// ----- creator reference

/// Where a path comes from.  The strong topology stays acyclic: the
/// session owns the jobs, paths only hold weak references.  On the
/// worker side creators appear as detached ids plus their directory.
///
#[derive(Clone, Default)]
pub enum Creator {
    #[default]
    None,
    Job(Weak<Job>),
    Detached {
        id: String,
        dir: PathBuf,
    },
}

impl Creator {
    pub fn job(&self) -> Option<Arc<Job>> {
        match self {
            Creator::Job(w) => w.upgrade(),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<String> {
        match self {
            Creator::None => None,
            Creator::Job(w) => w.upgrade().map(|j| j.id().to_string()),
            Creator::Detached { id, .. } => Some(id.clone()),
        }
    }
}

/// Plain file or structured value.
///
#[derive(Clone, Debug, PartialEq)]
pub enum PathKind {
    Plain,
    Variable { pickled: bool, backup: Option<Box<Value>> },
}

/// A reference to a file with provenance.
///
#[derive(Clone)]
pub struct SisPath {
    creator: Creator,
    path: String,
    cached: bool,
    hash_overwrite: Option<(Option<String>, String)>,
    tags: Option<BTreeSet<String>>,
    available_fn: Option<fn(&SisPath) -> bool>,
    kind: PathKind,
}

impl SisPath {
    /// A path without a creator: an external input, absolute or relative
    /// to the base directory.
    pub fn external(path: &str) -> Self {
        Self::with_kind(Creator::None, path, PathKind::Plain)
    }

    pub(crate) fn with_kind(creator: Creator, path: &str, kind: PathKind) -> Self {
        SisPath {
            creator,
            path: path.to_string(),
            cached: false,
            hash_overwrite: None,
            tags: None,
            available_fn: None,
            kind,
        }
    }

    /// Request file caching when this path is consumed.
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Replace the hash contribution, used to move or rename outputs
    /// without invalidating older digests.
    pub fn hash_overwrite(mut self, creator: Option<String>, path: String) -> Self {
        self.hash_overwrite = Some((creator, path));
        self
    }

    pub fn tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Override the availability test with a named predicate.
    pub fn available_fn(mut self, f: fn(&SisPath) -> bool) -> Self {
        self.available_fn = Some(f);
        self
    }

    pub fn creator(&self) -> &Creator {
        &self.creator
    }

    pub fn creator_id(&self) -> Option<String> {
        self.creator.id()
    }

    pub fn rel_name(&self) -> &str {
        &self.path
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn kind(&self) -> &PathKind {
        &self.kind
    }

    pub(crate) fn hash_overwrite_ref(&self) -> Option<&(Option<String>, String)> {
        self.hash_overwrite.as_ref()
    }

    pub fn get_tags(&self) -> BTreeSet<String> {
        match (&self.tags, self.creator.job()) {
            (Some(t), _) => t.clone(),
            (None, Some(job)) => job.tags().clone(),
            (None, None) => BTreeSet::new(),
        }
    }

    /// The path relative to the base directory.
    ///
    pub fn rel_path(&self) -> PathBuf {
        match &self.creator {
            Creator::None => PathBuf::from(&self.path),
            Creator::Job(w) => match w.upgrade() {
                Some(job) => job.dir().join(JOB_OUTPUT).join(&self.path),
                None => PathBuf::from(&self.path),
            },
            Creator::Detached { dir, .. } => dir.join(JOB_OUTPUT).join(&self.path),
        }
    }

    /// Absolute location on disk.
    ///
    pub fn get_path(&self) -> PathBuf {
        let rel = self.rel_path();
        if rel.is_absolute() {
            rel
        } else {
            std::env::current_dir().map(|c| c.join(&rel)).unwrap_or(rel)
        }
    }

    /// The real path, or a site-cached copy when caching is enabled and
    /// this path asked for it.
    ///
    pub fn get_cached_path(&self) -> PathBuf {
        let path = self.get_path();
        if self.cached && CACHING_ENABLED.load(Ordering::SeqCst) {
            if let Some(f) = FILE_CACHER.get() {
                return f(&path);
            }
        }
        path
    }

    /// True once the computation producing this path is complete.
    ///
    pub fn available(&self) -> bool {
        if let Some(f) = self.available_fn {
            return f(self);
        }
        match &self.creator {
            Creator::None => {
                let p = self.get_path();
                p.is_file() || p.is_dir()
            }
            Creator::Job(w) => match w.upgrade() {
                Some(job) => {
                    let ok = job.path_available(self);
                    if job.finished() && !ok {
                        warn!("job marked as finished but requested output is not available: {self:?}");
                    }
                    ok
                }
                None => false,
            },
            Creator::Detached { dir, .. } => {
                dir.join(JOB_FINISHED_MARKER).is_file() || dir.join(JOB_FINISHED_ARCHIVE).is_file()
            }
        }
    }

    /// Set the keep value of the producing job.
    pub fn keep_value(&self, value: u8) {
        match self.creator.job() {
            Some(job) => {
                let _ = job.set_keep_value(value);
            }
            None => warn!("try to set keep value for input path: {self:?}"),
        }
    }

    /// Canonical hash contribution: `(Path, (creator, path))`, with the
    /// creator collapsed to `<id>/output`.
    ///
    pub(crate) fn hash_bytes(&self) -> Vec<u8> {
        let (creator, path) = match &self.hash_overwrite {
            Some((c, o)) => (c.clone(), o.clone()),
            None => (self.creator_id().map(|id| format!("{id}/{JOB_OUTPUT}")), self.path.clone()),
        };
        let tuple = Value::Tuple(vec![
            creator.map_or(Value::Null, Value::Str),
            Value::Str(path),
        ]);
        let mut out = b"(Path, ".to_vec();
        out.extend(sis_hash(&tuple));
        out.push(b')');
        out
    }

    /// Start a delayed expression from this path.
    pub fn delayed(&self) -> crate::delayed::Delayed {
        crate::delayed::Delayed::Leaf(Value::Path(self.clone()))
    }

    // ----- variable interface

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, PathKind::Variable { .. })
    }

    /// True once a value has been written.
    pub fn is_set(&self) -> bool {
        self.get_path().is_file()
    }

    /// Read the stored value.  Unset variables yield the backup value
    /// when one was configured.
    ///
    pub fn read_value(&self) -> Result<Value, VariableError> {
        let path = self.get_path();
        let (pickled, backup) = match &self.kind {
            PathKind::Variable { pickled, backup } => (*pickled, backup.clone()),
            PathKind::Plain => (false, None),
        };
        if STRICT_WORKER_CHECK.load(Ordering::SeqCst) && !in_worker() {
            return Err(VariableError::NotInWorker(path));
        }
        if !self.is_set() {
            if let Some(b) = backup {
                return Ok(*b);
            }
            return Err(VariableError::NotSet(path));
        }
        if pickled {
            let f = fs::File::open(&path)?;
            let mut data = String::new();
            GzDecoder::new(f).read_to_string(&mut data)?;
            let repr: ValueRepr = serde_json::from_str(&data)
                .map_err(|e| VariableError::Decode(path.clone(), e.to_string()))?;
            Ok(repr.into_value(Path::new("")))
        } else {
            let data = fs::read_to_string(&path)?;
            parse_literal(data.trim()).map_err(|e| VariableError::Decode(path, e))
        }
    }

    /// Write a value, replacing any previous content.
    ///
    pub fn write_value(&self, value: &Value) -> Result<(), VariableError> {
        let path = self.get_path();
        let pickled = matches!(self.kind, PathKind::Variable { pickled: true, .. });
        if pickled {
            let f = fs::File::create(&path)?;
            let mut enc = GzEncoder::new(f, Compression::default());
            let data = serde_json::to_string(&ValueRepr::from_value(value))
                .map_err(|e| VariableError::Decode(path.clone(), e.to_string()))?;
            enc.write_all(data.as_bytes())?;
            enc.finish()?;
        } else {
            fs::write(&path, format!("{}\n", repr_value(value)))?;
        }
        Ok(())
    }

    fn sort_key(&self) -> (String, &str) {
        (self.creator_id().unwrap_or_default(), self.path.as_str())
    }
}

impl fmt::Debug for SisPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_variable() { "Variable" } else { "Path" };
        match self.creator_id() {
            Some(id) => write!(f, "<{kind} {id}/{JOB_OUTPUT}/{}>", self.path),
            None => write!(f, "<{kind} {}>", self.path),
        }
    }
}

impl fmt::Display for SisPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rel_path().display())
    }
}

impl PartialEq for SisPath {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key() && self.is_variable() == other.is_variable()
    }
}

impl Eq for SisPath {}

impl PartialOrd for SisPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SisPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl std::hash::Hash for SisPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.creator_id().hash(state);
        self.path.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_availability_tracks_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        let p = SisPath::external(file.to_str().unwrap());
        assert!(!p.available());
        fs::write(&file, "x").unwrap();
        assert!(p.available());
    }

    #[test]
    fn test_hash_ignores_overwrite_target_state() {
        let p = SisPath::external("a.txt");
        let q = SisPath::external("b.txt").hash_overwrite(None, "a.txt".to_string());
        assert_eq!(p.hash_bytes(), q.hash_bytes());
    }

    #[test]
    fn test_variable_text_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("var");
        let v = SisPath::with_kind(
            Creator::None,
            file.to_str().unwrap(),
            PathKind::Variable { pickled: false, backup: None },
        );
        assert!(!v.is_set());
        v.write_value(&Value::List(vec![Value::Int(1), Value::Float(f64::INFINITY)])).unwrap();
        assert!(v.is_set());
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Float(f64::INFINITY)]),
            v.read_value().unwrap()
        );
    }

    #[test]
    fn test_variable_pickled_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("var.gz");
        let v = SisPath::with_kind(
            Creator::None,
            file.to_str().unwrap(),
            PathKind::Variable { pickled: true, backup: None },
        );
        let value = Value::Map(vec![(Value::Str("wer".into()), Value::Float(0.25))]);
        v.write_value(&value).unwrap();
        assert_eq!(value, v.read_value().unwrap());
    }

    #[test]
    fn test_variable_backup() {
        let v = SisPath::with_kind(
            Creator::None,
            "/nonexistent/backup-var",
            PathKind::Variable { pickled: false, backup: Some(Box::new(Value::Int(0))) },
        );
        assert_eq!(Value::Int(0), v.read_value().unwrap());
    }

    #[test]
    fn test_unset_variable_errors_without_backup() {
        let v = SisPath::with_kind(
            Creator::None,
            "/nonexistent/no-backup-var",
            PathKind::Variable { pickled: false, backup: None },
        );
        assert!(matches!(v.read_value(), Err(VariableError::NotSet(_))));
    }
}
