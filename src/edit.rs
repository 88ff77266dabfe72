//! Edits made from outside the owning process: tags, notes, archiving,
//! deleting runs and their files, restoring a source snapshot.
//!
//! Record edits go through [`with_record`] like the recorder's own writes and
//! race with a live run on last-write-wins terms.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use walkdir::WalkDir;

use crate::error::{ExprecError, Result};
use crate::layout::RunPaths;
use crate::record::ARCHIVE_TAG;
use crate::snapshot::{restore_tree, SnapshotFilter};
use crate::store::with_record;

/// Free-text fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteField {
    Title,
    Description,
    Conclusion,
}

/// Adds tags; tags already present are ignored. Returns the new tag list.
pub async fn add_tags<S: AsRef<str>>(root: &Path, id: &str, tags: &[S]) -> Result<Vec<String>> {
    with_record(&RunPaths::new(root, id).metadata(), |rec| {
        for tag in tags {
            let tag = tag.as_ref().trim();
            if tag.is_empty() {
                return Err(ExprecError::InvalidArgument("empty tag".into()));
            }
            rec.tags.push(tag.to_string());
        }
        rec.normalize_tags();
        Ok(rec.tags.clone())
    })
    .await
}

/// Removes tags; tags not present are ignored. Returns the new tag list.
pub async fn remove_tags<S: AsRef<str>>(root: &Path, id: &str, tags: &[S]) -> Result<Vec<String>> {
    with_record(&RunPaths::new(root, id).metadata(), |rec| {
        rec.tags.retain(|t| !tags.iter().any(|gone| gone.as_ref() == t));
        Ok(rec.tags.clone())
    })
    .await
}

pub async fn archive(root: &Path, id: &str) -> Result<()> {
    add_tags(root, id, &[ARCHIVE_TAG]).await.map(drop)
}

pub async fn unarchive(root: &Path, id: &str) -> Result<()> {
    remove_tags(root, id, &[ARCHIVE_TAG]).await.map(drop)
}

pub async fn set_note(root: &Path, id: &str, field: NoteField, text: &str) -> Result<()> {
    with_record(&RunPaths::new(root, id).metadata(), |rec| {
        let slot = match field {
            NoteField::Title => &mut rec.title,
            NoteField::Description => &mut rec.description,
            NoteField::Conclusion => &mut rec.conclusion,
        };
        *slot = text.to_string();
        Ok(())
    })
    .await
}

/// Removes a run's folder and everything in it. Its name becomes free.
pub async fn delete_run(root: &Path, id: &str) -> Result<()> {
    let paths = RunPaths::new(root, id);
    if !fs::try_exists(paths.metadata()).await? {
        return Err(ExprecError::not_found(format!("run {id}")));
    }
    fs::remove_dir_all(paths.dir()).await?;
    info!(run_id = %id, "run deleted");
    Ok(())
}

/// Empties the run's free-form files area.
pub async fn delete_files(root: &Path, id: &str) -> Result<()> {
    let paths = RunPaths::new(root, id);
    if !fs::try_exists(paths.metadata()).await? {
        return Err(ExprecError::not_found(format!("run {id}")));
    }
    match fs::remove_dir_all(paths.files()).await {
        Ok(()) => {
            info!(run_id = %id, "run files deleted");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Bytes used by the run's free-form files area; zero if it was never created.
pub async fn files_size(root: &Path, id: &str) -> Result<u64> {
    let dir = RunPaths::new(root, id).files();
    tokio::task::spawn_blocking(move || {
        let mut total = 0;
        for entry in WalkDir::new(&dir) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.depth() == 0 && e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => {
                    return Ok(0);
                }
                Err(e) => return Err(ExprecError::Io(e.into())),
            };
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(|e| ExprecError::Io(e.into()))?.len();
            }
        }
        Ok(total)
    })
    .await
    .map_err(|e| ExprecError::Io(std::io::Error::other(e)))?
}

/// Puts a run's source snapshot back into `target`. Non-hidden files under
/// `target` with one of `extensions` are removed first. Returns the restored
/// relative paths.
pub async fn restore_source(root: &Path, id: &str, target: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let snapshot = RunPaths::new(root, id).source();
    let target = std::path::absolute(target)?;
    let filter = SnapshotFilter::new(extensions).exclude(std::path::absolute(root)?);
    let restored = tokio::task::spawn_blocking(move || restore_tree(&snapshot, &target, &filter))
        .await
        .map_err(|e| ExprecError::Io(std::io::Error::other(e)))??;
    info!(run_id = %id, files = restored.len(), "source restored");
    Ok(restored)
}
