//! The metadata record stored as `experiment.json` in every run folder.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Tag reserved for archived runs; hidden from tag aggregation.
pub const ARCHIVE_TAG: &str = "archive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value: number, string, or bool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ParamValue { fn from(v: bool) -> Self { Self::Bool(v) } }
impl From<i64> for ParamValue { fn from(v: i64) -> Self { Self::Int(v) } }
impl From<i32> for ParamValue { fn from(v: i32) -> Self { Self::Int(v.into()) } }
impl From<u32> for ParamValue { fn from(v: u32) -> Self { Self::Int(v.into()) } }
impl From<f64> for ParamValue { fn from(v: f64) -> Self { Self::Float(v) } }
impl From<f32> for ParamValue { fn from(v: f32) -> Self { Self::Float(v.into()) } }
impl From<String> for ParamValue { fn from(v: String) -> Self { Self::Text(v) } }
impl From<&str> for ParamValue { fn from(v: &str) -> Self { Self::Text(v.to_string()) } }

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub sha: String,
    pub short: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conclusion: String,
    pub tags: Vec<String>,
    pub status: RunStatus,
    pub started_datetime: NaiveDateTime,
    pub ended_datetime: Option<NaiveDateTime>,
    pub filename: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub runtime_version: String,
    pub os_version: String,
    pub pid: u32,
    pub git: Option<GitInfo>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    /// Referenced run id -> filenames read from that run, in first-read order.
    #[serde(default)]
    pub file_dependencies: BTreeMap<String, Vec<String>>,
    pub exception_type: Option<String>,
    pub exception_value: Option<String>,
    /// Fields written by other tools, kept intact across updates.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_archived(&self) -> bool {
        self.has_tag(ARCHIVE_TAG)
    }

    /// Ids of the runs this run read files from.
    pub fn parents(&self) -> Vec<&str> {
        self.file_dependencies.keys().map(String::as_str).collect()
    }

    /// Records `filename` under `run_id`; a repeated pair is a no-op.
    /// Returns true if the edge was new.
    pub fn add_dependency(&mut self, run_id: &str, filename: &str) -> bool {
        let files = self.file_dependencies.entry(run_id.to_string()).or_default();
        if files.iter().any(|f| f == filename) {
            return false;
        }
        files.push(filename.to_string());
        true
    }

    /// Moves a running record into its terminal state. A record that already
    /// finished is left untouched and `false` is returned.
    pub fn finish(&mut self, status: RunStatus, ended: NaiveDateTime, exception: Option<(String, String)>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_datetime = Some(ended);
        if let Some((kind, value)) = exception {
            self.exception_type = Some(kind);
            self.exception_value = Some(value);
        }
        true
    }

    pub fn normalize_tags(&mut self) {
        self.tags.sort();
        self.tags.dedup();
    }
}

#[cfg(test)]
pub(crate) fn sample_record() -> RunRecord {
    RunRecord {
        name: String::new(),
        title: "baseline".into(),
        description: String::new(),
        conclusion: String::new(),
        tags: vec!["a".into()],
        status: RunStatus::Running,
        started_datetime: chrono::Local::now().naive_local(),
        ended_datetime: None,
        filename: "train".into(),
        arguments: vec![],
        runtime_version: "rustc 1.80.0".into(),
        os_version: "linux x86_64".into(),
        pid: 42,
        git: None,
        parameters: BTreeMap::new(),
        file_dependencies: BTreeMap::new(),
        exception_type: None,
        exception_value: None,
        extra: serde_json::Map::new(),
    }
}
