//! Scalar series: one append-only CSV file per series name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use tracing::warn;

use crate::error::{ExprecError, Result};

pub const HEADER: &str = "step,value,timestamp";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalarPoint {
    /// Position in the series, used for ordering when `step` is absent.
    pub index: usize,
    pub step: Option<u64>,
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

impl ScalarPoint {
    /// The x coordinate a chart would use.
    pub fn x(&self) -> u64 {
        self.step.unwrap_or(self.index as u64)
    }
}

/// Appender for a single series file.
#[derive(Clone)]
pub struct ScalarWriter {
    file: Arc<Mutex<fs::File>>,
}

impl ScalarWriter {
    /// Opens the series for appending, writing the header on first use.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() { fs::create_dir_all(parent).await?; }
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let mut len = file.metadata().await?.len();
        if len > 0 {
            len = drop_torn_tail(&path).await?;
        }
        if len == 0 {
            file.write_all(HEADER.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        Ok(Self { file: Arc::new(Mutex::new(file)) })
    }

    /// Appends one point stamped with the current local time.
    pub async fn append(&self, value: f64, step: Option<u64>) -> Result<NaiveDateTime> {
        let now = Local::now().naive_local();
        let step = step.map(|s| s.to_string()).unwrap_or_default();
        let line = format!("{step},{value},{}\n", now.format("%Y-%m-%dT%H:%M:%S%.6f"));
        let mut f = self.file.lock().await;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(now)
    }
}

/// Reads every point of a series in append order.
///
/// A row cut short by a crash can only be the last one: an unterminated or
/// unparsable final row is skipped with a warning. A bad row anywhere else
/// is an error.
pub async fn read_series(path: &Path) -> Result<Vec<ScalarPoint>> {
    let text = match fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExprecError::not_found(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let rows: Vec<&str> = text.lines().collect();
    let last = rows.len().saturating_sub(1);
    let mut points = Vec::new();
    for (i, line) in rows.iter().enumerate() {
        if i == 0 && line.trim() == HEADER { continue; }
        if line.trim().is_empty() { continue; }
        let torn = i == last && !text.ends_with('\n');
        match parse_row(line, points.len(), path) {
            Ok(p) if !torn => points.push(p),
            Ok(_) => warn!(path = %path.display(), row = %line, "skipping unterminated scalar row"),
            Err(e) if i == last => warn!(path = %path.display(), error = %e, "skipping torn scalar row"),
            Err(e) => return Err(e),
        }
    }
    Ok(points)
}

/// Cuts an unterminated trailing row so the next append starts on a fresh
/// line. Returns the resulting file length.
async fn drop_torn_tail(path: &Path) -> Result<u64> {
    let bytes = fs::read(path).await?;
    if bytes.last() == Some(&b'\n') {
        return Ok(bytes.len() as u64);
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1) as u64;
    warn!(path = %path.display(), dropped = bytes.len() as u64 - keep, "dropping torn scalar row");
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep).await?;
    file.sync_all().await?;
    Ok(keep)
}

/// Final value of a series, `None` when only the header has been written.
pub async fn last_value(path: &Path) -> Result<Option<f64>> {
    Ok(read_series(path).await?.last().map(|p| p.value))
}

/// Names of every series stored under `scalars_dir`, sorted.
pub async fn series_names(scalars_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut rd = match fs::read_dir(scalars_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("csv") { continue; }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn parse_row(line: &str, index: usize, path: &Path) -> Result<ScalarPoint> {
    let bad = || ExprecError::InvalidArgument(format!("bad scalar row in {}: {line}", path.display()));
    let mut cols = line.splitn(3, ',');
    let (step, value, ts) = match (cols.next(), cols.next(), cols.next()) {
        (Some(s), Some(v), Some(t)) => (s.trim(), v.trim(), t.trim()),
        _ => return Err(bad()),
    };
    let step = if step.is_empty() { None } else { Some(step.parse().map_err(|_| bad())?) };
    let value = value.parse().map_err(|_| bad())?;
    let timestamp = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").map_err(|_| bad())?;
    Ok(ScalarPoint { index, step, value, timestamp })
}
