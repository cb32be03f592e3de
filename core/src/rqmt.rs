//! Requirement tables and the usage snapshot.
//!
//! A requirement table is an open map: the scheduler understands `cpu`,
//! `gpu`, `mem`, `time`, `rss`, `multi_node_slots` and `engine`, and
//! passes engine-specific extras (`sbatch_args`, `qsub_args`, …) through
//! verbatim.
//!

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use sisyphus_common::{str_to_gb, str_to_hours, UnitError};

/// A requirement table.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rqmt(pub BTreeMap<String, Json>);

impl Rqmt {
    pub fn new() -> Self {
        Rqmt::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Json>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Overlay `other` on top of this table.
    pub fn update(&mut self, other: &Rqmt) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    fn num(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(Json::Number(n)) => n.as_f64(),
            Some(Json::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn cpu(&self) -> u32 {
        self.num("cpu").map(|v| v as u32).unwrap_or(1)
    }

    pub fn gpu(&self) -> u32 {
        self.num("gpu").map(|v| v as u32).unwrap_or(0)
    }

    /// Memory in GiB, accepting unit-suffixed strings.
    pub fn mem_gb(&self) -> Option<f64> {
        match self.0.get("mem") {
            Some(Json::Number(n)) => n.as_f64(),
            Some(Json::String(s)) => str_to_gb(s).ok(),
            _ => None,
        }
    }

    /// Wall time in hours, accepting `H:M:S` strings.
    pub fn time_hours(&self) -> Option<f64> {
        match self.0.get("time") {
            Some(Json::Number(n)) => n.as_f64(),
            Some(Json::String(s)) => str_to_hours(s).ok(),
            _ => None,
        }
    }

    pub fn multi_node_slots(&self) -> u32 {
        self.num("multi_node_slots").map(|v| v as u32).unwrap_or(1)
    }

    pub fn engine_name(&self) -> Option<&str> {
        self.0.get("engine").and_then(|v| v.as_str())
    }

    /// Normalise `mem` to a GiB float and `time` to an hour float.
    ///
    pub fn normalize(&mut self) -> Result<(), UnitError> {
        if let Some(Json::String(s)) = self.0.get("mem") {
            let v = str_to_gb(s)?;
            self.0.insert("mem".into(), json_f64(v));
        }
        if let Some(Json::String(s)) = self.0.get("time") {
            let v = str_to_hours(s)?;
            self.0.insert("time".into(), json_f64(v));
        }
        Ok(())
    }

    /// Clamp against the default hardware limits: at most a week of wall
    /// time, and long jobs get the smaller memory ceiling.
    ///
    pub fn check_engine_limits(&mut self) {
        let time = self.time_hours().unwrap_or(2.0).min(168.0);
        self.0.insert("time".into(), json_f64(time));
        if let Some(mem) = self.mem_gb() {
            let ceiling = if time > 24.0 { 63.0 } else { 127.0 };
            self.0.insert("mem".into(), json_f64(mem.min(ceiling)));
        }
    }

    /// Stable key used to batch task ids with identical requirements.
    ///
    pub fn bucket_key(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

fn json_f64(v: f64) -> Json {
    serde_json::Number::from_f64(v).map(Json::Number).unwrap_or(Json::Null)
}

// ----- usage snapshot

/// One resource sample over a process tree.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Resident set size in GiB.
    #[serde(default)]
    pub rss: f64,
    /// Virtual memory in GiB.
    #[serde(default)]
    pub vms: f64,
    /// CPU usage in percent, summed over the tree.
    #[serde(default)]
    pub cpu: f64,
}

/// The worker heartbeat: continuously rewritten snapshot of pid, host
/// and resource consumption.  Its mtime doubles as the liveness signal.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub max: ResourceSample,
    #[serde(default)]
    pub current: ResourceSample,
    pub pid: u32,
    #[serde(default)]
    pub user: String,
    /// Hours since the task instance started.
    #[serde(default)]
    pub used_time: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub current_time: String,
    #[serde(default)]
    pub out_of_memory: bool,
    #[serde(default)]
    pub requested_resources: Rqmt,
}

impl Usage {
    pub fn load(path: &Path) -> std::io::Result<Usage> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Atomic rewrite: write to a sibling and rename over the old
    /// snapshot so readers never see a torn file.
    ///
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let tmp = path.with_file_name(format!(".{name}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(self).unwrap_or_default())?;
        fs::rename(&tmp, path)
    }
}

/// Requirement escalation after an interruption: double whatever was
/// exhausted.  Time counts as exhausted within 0.1 h of the request,
/// memory within 0.25 GiB or on an explicit OOM flag.
///
pub fn update_engine_rqmt(initial: &Rqmt, last_usage: &Usage) -> Rqmt {
    let requested = &last_usage.requested_resources;
    let mut requested_time =
        requested.time_hours().or(initial.time_hours()).unwrap_or(1.0);
    let mut requested_memory = requested.mem_gb().or(initial.mem_gb()).unwrap_or(1.0);

    let used_time = last_usage.used_time;
    let used_memory = last_usage.max.rss;

    let out_of_memory = last_usage.out_of_memory || requested_memory - used_memory < 0.25;
    let out_of_time = requested_time - used_time < 0.1;

    if out_of_time {
        requested_time = initial.time_hours().unwrap_or(0.0).max(requested_time * 2.0);
    }
    if out_of_memory {
        requested_memory = initial.mem_gb().unwrap_or(0.0).max(requested_memory * 2.0);
    }

    let mut out = initial.clone();
    out.update(requested);
    out.set("time", json_f64(requested_time));
    out.set("mem", json_f64(requested_memory));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_units() {
        let mut r = Rqmt::new().with("mem", "512M").with("time", "2:30:00");
        r.normalize().unwrap();
        assert_eq!(Some(0.5), r.mem_gb());
        assert_eq!(Some(2.5), r.time_hours());
    }

    #[test]
    fn test_limits_clamp() {
        let mut r = Rqmt::new().with("time", 200.0).with("mem", 100.0);
        r.check_engine_limits();
        assert_eq!(Some(168.0), r.time_hours());
        assert_eq!(Some(63.0), r.mem_gb());

        let mut r = Rqmt::new().with("time", 12.0).with("mem", 200.0);
        r.check_engine_limits();
        assert_eq!(Some(127.0), r.mem_gb());
    }

    #[test]
    fn test_update_rqmt_doubles_exhausted_dimensions() {
        let initial = Rqmt::new().with("mem", 4.0).with("time", 1.0);
        let usage = Usage {
            used_time: 0.95,
            max: ResourceSample { rss: 3.8, vms: 4.0, cpu: 100.0 },
            out_of_memory: false,
            requested_resources: Rqmt::new().with("mem", 4.0).with("time", 1.0),
            ..Usage::default()
        };
        let mut next = update_engine_rqmt(&initial, &usage);
        assert_eq!(Some(8.0), next.mem_gb());
        assert_eq!(Some(2.0), next.time_hours());
        next.check_engine_limits();
        assert_eq!(Some(8.0), next.mem_gb());
        assert_eq!(Some(2.0), next.time_hours());
    }

    #[test]
    fn test_update_rqmt_keeps_comfortable_request() {
        let initial = Rqmt::new().with("mem", 4.0).with("time", 8.0);
        let usage = Usage {
            used_time: 2.0,
            max: ResourceSample { rss: 1.0, vms: 2.0, cpu: 100.0 },
            requested_resources: Rqmt::new().with("mem", 4.0).with("time", 8.0),
            ..Usage::default()
        };
        let next = update_engine_rqmt(&initial, &usage);
        assert_eq!(Some(4.0), next.mem_gb());
        assert_eq!(Some(8.0), next.time_hours());
    }

    #[test]
    fn test_bucket_key_is_order_independent() {
        let a = Rqmt::new().with("cpu", 2).with("mem", 4.0);
        let b = Rqmt::new().with("mem", 4.0).with("cpu", 2);
        assert_eq!(a.bucket_key(), b.bucket_key());
        let c = Rqmt::new().with("cpu", 3).with("mem", 4.0);
        assert_ne!(a.bucket_key(), c.bucket_key());
    }

    #[test]
    fn test_usage_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.start.1");
        let usage = Usage {
            pid: 4321,
            host: "node01".into(),
            user: "wer".into(),
            used_time: 0.5,
            max: ResourceSample { rss: 1.5, vms: 2.0, cpu: 180.0 },
            ..Usage::default()
        };
        usage.save(&path).unwrap();
        let back = Usage::load(&path).unwrap();
        assert_eq!(4321, back.pid);
        assert_eq!("node01", back.host);
        assert_eq!(1.5, back.max.rss);
    }
}
