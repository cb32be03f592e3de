//! Workflow configuration loader.
//!
//! A config file names registered workflow functions plus a parameter
//! table; each function builds its jobs and targets through the core
//! API.  Recipes themselves are compiled in, so this stays a thin
//! dispatcher rather than a full pipeline-description language.
//!
//! ```hcl
//! workflow "main" {
//!   corpus = "data/corpus.gz"
//!   epochs = 12
//! }
//! ```
//!

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use sisyphus_core::{Session, SisGraph, Value};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("can not read config {0}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("config {0} does not parse: {1}")]
    Invalid(PathBuf, String),
    #[error("no workflow registered under {0}")]
    UnknownWorkflow(String),
}

type WorkflowFn =
    Box<dyn Fn(&Arc<Session>, &SisGraph, &Value) -> eyre::Result<()> + Send + Sync>;

/// The registered workflow functions, keyed by name.
///
#[derive(Default)]
pub struct WorkflowSet {
    map: BTreeMap<String, WorkflowFn>,
}

impl WorkflowSet {
    pub fn new() -> WorkflowSet {
        WorkflowSet::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        f: impl Fn(&Arc<Session>, &SisGraph, &Value) -> eyre::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.map.insert(name.to_string(), Box::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowFn> {
        self.map.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.map.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    workflow: BTreeMap<String, hcl::Value>,
}

/// Load every config file and run the named workflows against the
/// session and graph.
///
#[tracing::instrument(skip(workflows, session, graph))]
pub fn load_configs(
    files: &[PathBuf],
    workflows: &WorkflowSet,
    session: &Arc<Session>,
    graph: &SisGraph,
) -> eyre::Result<()> {
    for file in files {
        load_config_file(file, workflows, session, graph)?;
    }
    Ok(())
}

pub fn load_config_file(
    file: &Path,
    workflows: &WorkflowSet,
    session: &Arc<Session>,
    graph: &SisGraph,
) -> eyre::Result<()> {
    let data = fs::read_to_string(file)
        .map_err(|e| LoaderError::Unreadable(file.to_path_buf(), e))?;
    let config: ConfigFile = hcl::from_str(&data)
        .map_err(|e| LoaderError::Invalid(file.to_path_buf(), e.to_string()))?;

    for (name, params) in &config.workflow {
        let f = workflows
            .get(name)
            .ok_or_else(|| LoaderError::UnknownWorkflow(name.clone()))?;
        info!("loading workflow {name} from {}", file.display());
        let params = hcl_to_value(params);
        debug!("params: {params:?}");
        f(session, graph, &params)?;
    }
    Ok(())
}

/// Translate an HCL parameter table into the core value model.
///
pub fn hcl_to_value(v: &hcl::Value) -> Value {
    match v {
        hcl::Value::Null => Value::Null,
        hcl::Value::Bool(b) => Value::Bool(*b),
        hcl::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        hcl::Value::String(s) => Value::Str(s.clone()),
        hcl::Value::Array(items) => Value::List(items.iter().map(hcl_to_value).collect()),
        hcl::Value::Object(table) => Value::Map(
            table
                .iter()
                .map(|(k, v)| (Value::Str(k.clone()), hcl_to_value(v)))
                .collect(),
        ),
    }
}

/// Fetch one key of a workflow parameter table.
pub fn param<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
    match params {
        Value::Map(pairs) => pairs
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use sisyphus_common::Settings;

    #[test]
    fn test_hcl_to_value() {
        let parsed: hcl::Value = hcl::from_str(r#"a = 1
b = "x"
c = [1, 2.5]"#)
            .unwrap();
        let v = hcl_to_value(&parsed);
        assert_eq!(Some(&Value::Int(1)), param(&v, "a"));
        assert_eq!(Some(&Value::Str("x".into())), param(&v, "b"));
        assert_eq!(
            Some(&Value::List(vec![Value::Int(1), Value::Float(2.5)])),
            param(&v, "c")
        );
    }

    #[test]
    fn test_load_config_runs_registered_workflow() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(Settings::immediate().rooted_at(dir.path()));
        let graph = SisGraph::new(session.clone());

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let mut workflows = WorkflowSet::new();
        workflows.register("main", |_session, _graph, params| {
            assert_eq!(Some(&Value::Int(12)), param(params, "epochs"));
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "workflow \"main\" {{\n  epochs = 12\n}}").unwrap();
        load_configs(&[f.path().to_path_buf()], &workflows, &session, &graph).unwrap();
        assert_eq!(1, CALLS.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unknown_workflow_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(Settings::immediate().rooted_at(dir.path()));
        let graph = SisGraph::new(session.clone());
        let workflows = WorkflowSet::new();

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "workflow \"missing\" {{}}").unwrap();
        let err = load_configs(&[f.path().to_path_buf()], &workflows, &session, &graph)
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
