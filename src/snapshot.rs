//! Source snapshots: copying the working tree into a run folder and back.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ExprecError, Result};
use crate::layout::is_hidden;

/// Which files a snapshot carries.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// File extensions to copy, without the dot. Empty means every file.
    pub extensions: Vec<String>,
    /// Absolute or source-relative directories never copied (the
    /// experiments root, build output).
    pub exclude: Vec<PathBuf>,
}

impl SnapshotFilter {
    pub fn new(extensions: &[String]) -> Self {
        Self { extensions: extensions.to_vec(), exclude: Vec::new() }
    }

    pub fn exclude(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exclude.push(dir.into());
        self
    }

    fn wants(&self, rel: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        rel.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|want| want == e))
            .unwrap_or(false)
    }

    fn excluded(&self, root: &Path, path: &Path) -> bool {
        self.exclude.iter().any(|ex| {
            let ex = if ex.is_absolute() { ex.clone() } else { root.join(ex) };
            path.starts_with(&ex)
        })
    }
}

/// Copies every non-hidden file under `src` that passes `filter` into `dst`,
/// preserving relative paths. Returns the copied relative paths, sorted.
pub fn copy_tree(src: &Path, dst: &Path, filter: &SnapshotFilter) -> Result<Vec<PathBuf>> {
    let files = collect_files(src, filter)?;
    fs::create_dir_all(dst)?;
    for rel in &files {
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src.join(rel), &target)?;
    }
    debug!(from = %src.display(), to = %dst.display(), files = files.len(), "copied source tree");
    Ok(files)
}

/// Relative paths of the non-hidden files under `root` that pass `filter`.
pub fn collect_files(root: &Path, filter: &SnapshotFilter) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(root).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true; // root entry
        }
        !is_hidden(rel) && !filter.excluded(root, e.path())
    });
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .map(ExprecError::from)
                .unwrap_or_else(|| ExprecError::InvalidArgument("filesystem loop in source tree".into()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
        if filter.wants(&rel) {
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

/// Replaces the matching files of `target` with the snapshot at `snapshot`.
/// Non-hidden files under `target` that pass `filter` are removed first, so
/// files created after the snapshot do not linger.
pub fn restore_tree(snapshot: &Path, target: &Path, filter: &SnapshotFilter) -> Result<Vec<PathBuf>> {
    if !snapshot.is_dir() {
        return Err(ExprecError::not_found(snapshot.display().to_string()));
    }
    for rel in collect_files(target, filter)? {
        fs::remove_file(target.join(rel))?;
    }
    copy_tree(snapshot, target, &SnapshotFilter { extensions: filter.extensions.clone(), exclude: Vec::new() })
}

/// Async wrapper running [`copy_tree`] on the blocking pool.
pub async fn snapshot_source(src: PathBuf, dst: PathBuf, filter: SnapshotFilter) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst, &filter))
        .await
        .map_err(|e| ExprecError::Io(std::io::Error::other(e)))?
}
