//! Recursive unified diffs between source trees.
//!
//! An empty string means the trees hold the same text; it is never an error.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use similar::TextDiff;

use crate::error::{ExprecError, Result};
use crate::layout::RunPaths;
use crate::snapshot::{collect_files, SnapshotFilter};

const CONTEXT_LINES: usize = 3;
const NULL_LABEL: &str = "/dev/null";

/// Diffs every non-hidden file under `a` and `b` that passes `filter`.
/// Files are visited in path order; a file found on one side only is diffed
/// against an empty file labelled `/dev/null`.
pub fn diff_trees(a: &Path, b: &Path, filter: &SnapshotFilter) -> Result<String> {
    let mut paths: BTreeSet<PathBuf> = collect_side(a, filter)?.into_iter().collect();
    paths.extend(collect_side(b, filter)?);

    let mut out = String::new();
    for rel in paths {
        let left = read_side(a, &rel)?;
        let right = read_side(b, &rel)?;
        if left == right {
            continue;
        }
        let shown = rel.to_string_lossy().replace('\\', "/");
        let old_label = if left.is_some() { format!("a/{shown}") } else { NULL_LABEL.to_string() };
        let new_label = if right.is_some() { format!("b/{shown}") } else { NULL_LABEL.to_string() };
        let left = left.unwrap_or_default();
        let right = right.unwrap_or_default();

        match (std::str::from_utf8(&left), std::str::from_utf8(&right)) {
            (Ok(old), Ok(new)) => {
                let diff = TextDiff::from_lines(old, new);
                let text = diff.unified_diff().context_radius(CONTEXT_LINES).header(&old_label, &new_label).to_string();
                out.push_str(&text);
            }
            _ => {
                let _ = writeln!(out, "Binary files {old_label} and {new_label} differ");
            }
        }
    }
    Ok(out)
}

/// Diff of run `a`'s source snapshot against run `b`'s.
pub async fn diff_runs(root: &Path, a: &str, b: &str) -> Result<String> {
    let left = snapshot_dir(root, a).await?;
    let right = snapshot_dir(root, b).await?;
    blocking(move || diff_trees(&left, &right, &SnapshotFilter::default())).await
}

/// Diff of a run's source snapshot against the working tree at `local`.
/// Only files with `extensions` are compared, matching what a snapshot
/// carries; the experiments root is skipped.
pub async fn diff_with_local(root: &Path, id: &str, local: &Path, extensions: &[String]) -> Result<String> {
    let snapshot = snapshot_dir(root, id).await?;
    let local = std::path::absolute(local)?;
    let filter = SnapshotFilter::new(extensions).exclude(std::path::absolute(root)?).exclude("target");
    blocking(move || diff_trees(&snapshot, &local, &filter)).await
}

async fn snapshot_dir(root: &Path, id: &str) -> Result<PathBuf> {
    let paths = RunPaths::new(root, id);
    if !tokio::fs::try_exists(paths.metadata()).await? {
        return Err(ExprecError::not_found(format!("run {id}")));
    }
    Ok(paths.source())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExprecError::Io(std::io::Error::other(e)))?
}

/// A side that does not exist is an empty tree.
fn collect_side(root: &Path, filter: &SnapshotFilter) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    collect_files(root, filter)
}

fn read_side(root: &Path, rel: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(root.join(rel)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
