//! Scoped read-modify-write access to a run's metadata record.
//!
//! Every write goes to a sibling temp file that is renamed over the record,
//! so a reader sees either the old document or the new one. There is no
//! cross-process locking: two writers racing on the same record keep
//! whichever rename lands last.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{fs, io::AsyncWriteExt};

use crate::error::{ExprecError, Result};
use crate::record::RunRecord;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reads and parses the record at `path`.
pub async fn load_record(path: &Path) -> Result<RunRecord> {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExprecError::not_found(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|source| ExprecError::MalformedRecord {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes the first version of a record. Fails with `AlreadyExists` if one is
/// already present.
pub async fn create_record(path: &Path, record: &RunRecord) -> Result<()> {
    if fs::try_exists(path).await? {
        return Err(ExprecError::AlreadyExists(path.to_path_buf()));
    }
    write_atomic(path, record).await
}

/// Loads the record, hands it to `f` for mutation, and persists it if `f`
/// returns `Ok`. On any error the file keeps its last durable contents.
pub async fn with_record<R, F>(path: &Path, f: F) -> Result<R>
where
    F: FnOnce(&mut RunRecord) -> Result<R>,
{
    let mut record = load_record(path).await?;
    let out = f(&mut record)?;
    write_atomic(path, &record).await?;
    Ok(out)
}

async fn write_atomic(path: &Path, record: &RunRecord) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(ExprecError::Encode)?;
    let tmp = tmp_path(path);
    {
        let mut f = fs::File::create(&tmp).await?;
        if let Err(e) = write_and_sync(&mut f, &bytes).await {
            drop(f);
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn write_and_sync(f: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    f.write_all(bytes).await?;
    f.write_all(b"\n").await?;
    f.flush().await?;
    let _ = f.sync_all().await; // best-effort
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{sample_record, RunStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trip_matches_mutated_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.json");
        create_record(&path, &sample_record()).await.unwrap();

        let expected = with_record(&path, |rec| {
            rec.parameters.insert("lr".into(), 0.01.into());
            rec.tags.push("zeta".into());
            rec.add_dependency("other", "weights.bin");
            Ok(rec.clone())
        })
        .await
        .unwrap();

        let back = load_record(&path).await.unwrap();
        assert_eq!(back, expected);
    }

    #[tokio::test]
    async fn failed_mutation_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.json");
        create_record(&path, &sample_record()).await.unwrap();
        let before = fs::read(&path).await.unwrap();

        let res: Result<()> = with_record(&path, |rec| {
            rec.status = RunStatus::Failed;
            Err(ExprecError::InvalidArgument("abort".into()))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(fs::read(&path).await.unwrap(), before);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.json");
        let res = with_record(&path, |_| Ok(())).await;
        assert!(matches!(res, Err(ExprecError::NotFound(_))));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn malformed_record_is_reported_and_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.json");
        fs::write(&path, b"{ not json").await.unwrap();
        let res = with_record(&path, |_| Ok(())).await;
        assert!(matches!(res, Err(ExprecError::MalformedRecord { .. })));
        assert_eq!(fs::read(&path).await.unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.json");
        create_record(&path, &sample_record()).await.unwrap();
        let res = create_record(&path, &sample_record()).await;
        assert!(matches!(res, Err(ExprecError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.json");
        create_record(&path, &sample_record()).await.unwrap();
        for _ in 0..5 {
            with_record(&path, |rec| {
                rec.title.push('!');
                Ok(())
            })
            .await
            .unwrap();
        }
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["experiment.json"]);
    }
}
