//! Enumerating runs under a root, aggregating names, tag filtering.
//!
//! Runs whose record is missing or unreadable are skipped with a warning;
//! one corrupt folder never breaks a listing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::fs;
use tracing::warn;

use crate::error::Result;
use crate::id::{resolve_prefix, short_ids};
use crate::layout::{RunPaths, METADATA_FILENAME};
use crate::record::{ParamValue, RunRecord, RunStatus, ARCHIVE_TAG};
use crate::scalars;
use crate::store::load_record;

/// Ids of every run under `root`, in creation order. A child folder counts
/// as a run only if it holds a metadata record.
pub async fn list_run_ids(root: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut rd = match fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        if !entry.file_type().await?.is_dir() { continue; }
        if !fs::try_exists(entry.path().join(METADATA_FILENAME)).await.unwrap_or(false) { continue; }
        ids.push(entry.file_name().to_string_lossy().into_owned());
    }
    ids.sort();
    Ok(ids)
}

/// Loads the records of `ids`, skipping any that cannot be read.
pub async fn load_records(root: &Path, ids: &[String]) -> Vec<(String, RunRecord)> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        match load_record(&RunPaths::new(root, id).metadata()).await {
            Ok(rec) => out.push((id.clone(), rec)),
            Err(e) => warn!(run_id = %id, error = %e, "skipping unreadable run"),
        }
    }
    out
}

/// Sorted union of tags across `ids`, without the archive marker.
pub async fn all_tags(root: &Path, ids: &[String]) -> Vec<String> {
    let mut tags = BTreeSet::new();
    for (_, rec) in load_records(root, ids).await {
        tags.extend(rec.tags);
    }
    tags.remove(ARCHIVE_TAG);
    tags.into_iter().collect()
}

/// Sorted union of parameter names across `ids`.
pub async fn all_parameters(root: &Path, ids: &[String]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for (_, rec) in load_records(root, ids).await {
        names.extend(rec.parameters.into_keys());
    }
    names.into_iter().collect()
}

/// Sorted union of scalar series names across `ids`.
pub async fn all_scalars(root: &Path, ids: &[String]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for id in ids {
        match scalars::series_names(&RunPaths::new(root, id).scalars()).await {
            Ok(found) => names.extend(found),
            Err(e) => warn!(run_id = %id, error = %e, "skipping unreadable scalars"),
        }
    }
    names.into_iter().collect()
}

/// Allow/deny lists over tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    #[serde(default)]
    pub allow: BTreeSet<String>,
    #[serde(default)]
    pub deny: BTreeSet<String>,
}

impl TagFilter {
    /// Hides archived runs, shows everything else.
    pub fn hide_archived() -> Self {
        Self { allow: BTreeSet::new(), deny: BTreeSet::from([ARCHIVE_TAG.to_string()]) }
    }

    /// A run is shown if none of its tags are denied and, when an allow-list
    /// is set, at least one of its tags is allowed.
    pub fn shows<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        if tags.iter().any(|t| self.deny.contains(t.as_ref())) {
            return false;
        }
        self.allow.is_empty() || tags.iter().any(|t| self.allow.contains(t.as_ref()))
    }
}

/// What a table row needs to know about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub title: String,
    pub status: RunStatus,
    /// Whether the recording process is still alive. Only checked for
    /// running runs; a `Running` run whose process is gone has crashed.
    pub process_alive: bool,
    pub started: NaiveDateTime,
    pub ended: Option<NaiveDateTime>,
    /// Whole seconds; measured against now while the run is still going.
    pub duration_secs: i64,
    pub tags: Vec<String>,
    pub parameters: BTreeMap<String, ParamValue>,
    /// Last recorded value of each scalar series.
    pub scalars: BTreeMap<String, Option<f64>>,
    pub parents: Vec<String>,
}

/// Summaries of the runs under `root` that pass `filter`, newest first.
pub async fn summaries(root: &Path, filter: &TagFilter) -> Result<Vec<RunSummary>> {
    let ids = list_run_ids(root).await?;
    let shorts = short_ids(&ids);
    let mut sys = System::new();
    let mut rows = Vec::new();
    for (id, rec) in load_records(root, &ids).await {
        if !filter.shows(&rec.tags) { continue; }
        let paths = RunPaths::new(root, &id);
        let mut last = BTreeMap::new();
        for name in scalars::series_names(&paths.scalars()).await.unwrap_or_default() {
            let value = scalars::last_value(&paths.scalar_series(&name)).await.unwrap_or_else(|e| {
                warn!(run_id = %id, series = %name, error = %e, "unreadable scalar series");
                None
            });
            last.insert(name, value);
        }
        let end = rec.ended_datetime.unwrap_or_else(|| Local::now().naive_local());
        let duration = end - rec.started_datetime;
        let process_alive = rec.status == RunStatus::Running && sys.refresh_process(Pid::from_u32(rec.pid));
        rows.push(RunSummary {
            short_id: shorts.get(&id).cloned().unwrap_or_else(|| id.clone()),
            parents: rec.parents().into_iter().map(String::from).collect(),
            id,
            name: rec.name,
            title: rec.title,
            status: rec.status,
            process_alive,
            started: rec.started_datetime,
            ended: rec.ended_datetime,
            duration_secs: duration.num_seconds(),
            tags: rec.tags,
            parameters: rec.parameters,
            scalars: last,
        });
    }
    rows.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(rows)
}

/// Resolves a short id typed by a user to the full id of a run under `root`.
pub async fn resolve(root: &Path, prefix: &str) -> Result<String> {
    let ids = list_run_ids(root).await?;
    resolve_prefix(&ids, prefix)
}

/// The id of the run currently holding `name`, if any.
pub async fn find_by_name(root: &Path, name: &str) -> Result<Option<String>> {
    if name.is_empty() {
        return Ok(None);
    }
    let ids = list_run_ids(root).await?;
    Ok(load_records(root, &ids)
        .await
        .into_iter()
        .find(|(_, rec)| rec.name == name)
        .map(|(id, _)| id))
}
