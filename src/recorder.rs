//! Run lifecycle: `Created -> Running -> {Succeeded, Failed}`.
//!
//! [`Run::start`] claims the name, creates the folder and record, snapshots
//! the source tree, and starts mirroring output. [`Run::finish`] releases the
//! mirrored streams and writes the terminal status exactly once. [`record`]
//! wraps both around a body so the exit path runs on every outcome,
//! including a panic.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use image::DynamicImage;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExprecConfig;
use crate::environment::{self, Environment, PackageSource};
use crate::error::{ExprecError, Result};
use crate::events::{EventSink, RunEvent};
use crate::id::{short_ids, RunId};
use crate::images;
use crate::layout::{ensure_component, ensure_relative, RunPaths};
use crate::listing;
use crate::mirror::{OutputMirror, StdStreams, StreamTee};
use crate::record::{ParamValue, RunRecord, RunStatus};
use crate::scalars::ScalarWriter;
use crate::snapshot::{snapshot_source, SnapshotFilter};
use crate::store;

/// Failure kind of [`Interrupted`]; non-fatal by default.
pub const INTERRUPTED_KIND: &str = "Interrupted";
pub const PANIC_KIND: &str = "Panic";

/// Signals that the user stopped the run. Ends the run as succeeded unless
/// removed from the non-fatal set.
#[derive(Debug, thiserror::Error)]
#[error("interrupted by user")]
pub struct Interrupted;

/// How a run body ended badly: a kind (the error's type name) and message.
///
/// Any `std::error::Error` converts into a `Failure` with `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: String,
    pub message: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    pub fn interrupted() -> Self {
        Self::new(INTERRUPTED_KIND, Interrupted.to_string())
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if err.is::<Interrupted>() {
            return Self::interrupted();
        }
        Self::new("Error", format!("{err:#}"))
    }

    fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        Self::new(PANIC_KIND, message)
    }
}

impl<E: std::error::Error + 'static> From<E> for Failure {
    fn from(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Everything needed to start a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: PathBuf,
    pub name: String,
    pub title: String,
    pub tags: Vec<String>,
    /// Tree copied into the snapshot; also where git and `Cargo.lock` are read.
    pub source_dir: PathBuf,
    pub source_extensions: Vec<String>,
    pub package_source: PackageSource,
    pub package_command: Vec<String>,
    pub non_fatal: BTreeSet<String>,
    pub verbose: bool,
    pub events: EventSink,
}

impl RunOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(&ExprecConfig { root: root.into(), ..ExprecConfig::default() })
    }

    pub fn from_config(cfg: &ExprecConfig) -> Self {
        Self {
            root: cfg.root.clone(),
            name: String::new(),
            title: String::new(),
            tags: Vec::new(),
            source_dir: PathBuf::from("."),
            source_extensions: cfg.source_extensions.clone(),
            package_source: cfg.package_source.clone(),
            package_command: cfg.package_command.clone(),
            non_fatal: cfg.non_fatal.clone(),
            verbose: cfg.verbose,
            events: EventSink::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
    pub fn source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }
    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
    pub fn package_source(mut self, source: PackageSource) -> Self {
        self.package_source = source;
        self
    }

    /// Replaces the set of failure kinds that still end a run as succeeded.
    pub fn non_fatal<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_fatal = kinds.into_iter().map(Into::into).collect();
        self
    }
}

/// A running experiment. Owned by the process executing it; consumed by
/// [`Run::finish`], so no recording call can follow the terminal write.
pub struct Run {
    id: RunId,
    id_str: String,
    name: String,
    root: PathBuf,
    paths: RunPaths,
    /// Held around every read-modify-write of this run's record.
    record_lock: Arc<Mutex<()>>,
    mirror: OutputMirror,
    scalars: HashMap<String, ScalarWriter>,
    non_fatal: BTreeSet<String>,
    events: EventSink,
}

/// Result of a finished run.
pub struct Finished {
    pub id: String,
    pub status: RunStatus,
    /// The streams the run mirrored, handed back.
    pub streams: StdStreams,
}

impl Run {
    /// Starts a run: `Created -> Running`.
    pub async fn start(opts: RunOptions, streams: StdStreams) -> Result<Run> {
        let name = opts.name.trim().to_string();
        let title = opts.title.trim().to_string();
        fs::create_dir_all(&opts.root).await?;

        if let Some(holder) = listing::find_by_name(&opts.root, &name).await? {
            debug!(name = %name, holder = %holder, "name already taken");
            return Err(ExprecError::NameTaken(name));
        }

        let id = RunId::generate();
        let id_str = id.to_string();
        let paths = RunPaths::new(&opts.root, &id_str);
        match fs::create_dir(paths.dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ExprecError::AlreadyExists(paths.dir().to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let mirror = match Self::setup(&opts, &paths, &id_str, &name, &title, streams).await {
            Ok(m) => m,
            Err(e) => {
                if let Err(rm) = fs::remove_dir_all(paths.dir()).await {
                    warn!(run_id = %id_str, error = %rm, "could not remove partial run folder");
                }
                return Err(e);
            }
        };

        info!(run_id = %id_str, name = %name, "run started");
        opts.events.emit(RunEvent::Started { run_id: id_str.clone(), name: name.clone() });

        Ok(Run {
            id,
            id_str,
            name,
            root: opts.root,
            paths,
            record_lock: Arc::new(Mutex::new(())),
            mirror,
            scalars: HashMap::new(),
            non_fatal: opts.non_fatal,
            events: opts.events,
        })
    }

    async fn setup(
        opts: &RunOptions,
        paths: &RunPaths,
        id_str: &str,
        name: &str,
        title: &str,
        mut streams: StdStreams,
    ) -> Result<OutputMirror> {
        let env = Environment::capture(&opts.source_dir).await;
        let mut record = RunRecord {
            name: name.to_string(),
            title: title.to_string(),
            description: String::new(),
            conclusion: String::new(),
            tags: opts.tags.clone(),
            status: RunStatus::Running,
            started_datetime: Local::now().naive_local(),
            ended_datetime: None,
            filename: env.program,
            arguments: env.arguments,
            runtime_version: env.runtime_version,
            os_version: env.os_version,
            pid: env.pid,
            git: env.git,
            parameters: Default::default(),
            file_dependencies: Default::default(),
            exception_type: None,
            exception_value: None,
            extra: Default::default(),
        };
        record.normalize_tags();
        store::create_record(&paths.metadata(), &record).await?;

        let packages = environment::packages(&opts.source_dir, &opts.package_source, &opts.package_command).await;
        fs::write(paths.packages(), packages.join("\n")).await?;

        let filter = SnapshotFilter::new(&opts.source_extensions)
            .exclude(absolute(&opts.root))
            .exclude("target");
        let copied = snapshot_source(absolute(&opts.source_dir), paths.source(), filter).await?;
        debug!(run_id = %id_str, files = copied.len(), "source snapshot taken");

        if opts.verbose {
            let ids = listing::list_run_ids(&opts.root).await?;
            let short = short_ids(&ids).remove(id_str).unwrap_or_else(|| id_str.to_string());
            let mut banner = format!("Running experiment {short}");
            if !name.is_empty() {
                banner.push_str(&format!(" (alias '{name}')"));
            }
            if !title.is_empty() {
                banner.push_str(&format!(": {title}"));
            }
            writeln!(streams.stdout, "{banner}")?;
        }

        Ok(OutputMirror::open(paths, streams)?)
    }

    pub fn id(&self) -> &RunId { &self.id }
    pub fn id_str(&self) -> &str { &self.id_str }
    pub fn name(&self) -> &str { &self.name }
    pub fn paths(&self) -> &RunPaths { &self.paths }

    /// Mirrored standard output of this run.
    pub fn stdout(&mut self) -> &mut StreamTee { self.mirror.stdout() }

    /// Mirrored standard error of this run.
    pub fn stderr(&mut self) -> &mut StreamTee { self.mirror.stderr() }

    /// Writes a line to the mirrored stdout and publishes it as an event.
    pub fn log(&mut self, msg: &str) -> Result<()> {
        writeln!(self.mirror.stdout(), "{msg}")?;
        self.events.emit(RunEvent::Log { run_id: self.id_str.clone(), msg: msg.to_string() });
        Ok(())
    }

    /// Sets a parameter; the last value written wins.
    pub async fn set_parameter(&self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        if name.is_empty() {
            return Err(ExprecError::InvalidArgument("empty parameter name".into()));
        }
        let value = value.into();
        let _guard = self.record_lock.lock().await;
        store::with_record(&self.paths.metadata(), |rec| {
            rec.parameters.insert(name.to_string(), value);
            Ok(())
        })
        .await
    }

    /// Appends one point to a scalar series, creating the series on first use.
    pub async fn add_scalar(&mut self, name: &str, value: f64, step: Option<u64>) -> Result<()> {
        ensure_component(name)?;
        let writer = match self.scalars.get(name) {
            Some(w) => w.clone(),
            None => {
                let w = ScalarWriter::open(self.paths.scalar_series(name)).await?;
                self.scalars.insert(name.to_string(), w.clone());
                w
            }
        };
        writer.append(value, step).await?;
        self.events.emit(RunEvent::Scalar { run_id: self.id_str.clone(), name: name.to_string(), value, step });
        Ok(())
    }

    /// Stores an image for `(name, step)`.
    pub async fn add_image(&self, name: &str, image: &DynamicImage, step: u64) -> Result<PathBuf> {
        images::save_image(&self.paths, name, image, step).await
    }

    /// Opens (creating if needed) a file in this run's files area for
    /// reading and writing. Parent directories are created on demand.
    pub async fn open_file(&self, filename: &str) -> Result<fs::File> {
        let path = self.paths.file(filename)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path).await?)
    }

    /// Opens `filename` from this run (`from_run` = `None`) or read-only from
    /// another, finished run, recording the dependency edge in the latter case.
    pub async fn open_dependency(&self, filename: &str, from_run: Option<&str>) -> Result<fs::File> {
        ensure_relative(filename)?;
        let Some(other) = from_run else {
            return self.open_file(filename).await;
        };
        if other == self.id_str {
            return Err(ExprecError::SelfDependency(other.to_string()));
        }
        ensure_component(other)?;

        let other_paths = RunPaths::new(&self.root, other);
        let other_record = store::load_record(&other_paths.metadata()).await?;
        if other_record.status == RunStatus::Running {
            return Err(ExprecError::SourceStillRunning(other.to_string()));
        }
        let path = other_paths.file(filename)?;
        if !fs::try_exists(&path).await? {
            return Err(ExprecError::not_found(path.display().to_string()));
        }

        let added = {
            let _guard = self.record_lock.lock().await;
            store::with_record(&self.paths.metadata(), |rec| Ok(rec.add_dependency(other, filename))).await?
        };
        if added {
            info!(run_id = %self.id_str, from = %other, file = %filename, "recorded file dependency");
        }
        Ok(fs::File::open(&path).await?)
    }

    /// Ends the run: `Running -> {Succeeded, Failed}`.
    ///
    /// The mirrored streams are released first and come back in the result;
    /// the terminal status is then written once. A failure whose kind is in
    /// the non-fatal set still ends the run as succeeded.
    pub async fn finish(self, outcome: std::result::Result<(), Failure>) -> Result<Finished> {
        let Run { id_str, paths, record_lock, mut mirror, scalars, non_fatal, events, .. } = self;
        drop(scalars);

        let failure = outcome.err().filter(|f| !non_fatal.contains(&f.kind));
        if let Some(f) = &failure {
            // Lands in stderr.txt and stdcombined.txt before the logs close.
            let _ = writeln!(mirror.stderr(), "{}: {}", f.kind, f.message);
        }
        let (streams, flushed) = mirror.close();

        let status = if failure.is_some() { RunStatus::Failed } else { RunStatus::Succeeded };
        let exception = failure.as_ref().map(|f| (f.kind.clone(), f.message.clone()));
        let ended = Local::now().naive_local();
        let changed = {
            let _guard = record_lock.lock().await;
            store::with_record(&paths.metadata(), |rec| Ok(rec.finish(status, ended, exception))).await?
        };
        if !changed {
            warn!(run_id = %id_str, "record was already finished; terminal status left as is");
        }

        match &failure {
            Some(f) => {
                info!(run_id = %id_str, kind = %f.kind, "run failed");
                events.emit(RunEvent::Failed { run_id: id_str.clone(), kind: f.kind.clone(), error: f.message.clone() });
            }
            None => {
                info!(run_id = %id_str, "run succeeded");
                events.emit(RunEvent::Finished { run_id: id_str.clone(), status });
            }
        }
        flushed?;
        Ok(Finished { id: id_str, status, streams })
    }
}

/// What [`record`] returns when the body did not fail fatally.
pub struct Report<T> {
    pub id: String,
    pub status: RunStatus,
    /// `None` when the body stopped with a non-fatal failure.
    pub value: Option<T>,
    pub streams: StdStreams,
}

/// Runs `body` inside a run. The exit bookkeeping happens on every path. A
/// fatal failure comes back as [`ExprecError::RunFailed`] after the run is
/// marked failed; a panic is recorded and then resumed.
pub async fn record<T, F>(opts: RunOptions, streams: StdStreams, body: F) -> Result<Report<T>>
where
    T: Send,
    F: for<'a> FnOnce(&'a mut Run) -> BoxFuture<'a, std::result::Result<T, Failure>>,
{
    let mut run = Run::start(opts, streams).await?;
    let caught = AssertUnwindSafe(body(&mut run)).catch_unwind().await;

    let (value, outcome, panic) = match caught {
        Ok(Ok(v)) => (Some(v), Ok(()), None),
        Ok(Err(f)) => (None, Err(f), None),
        Err(payload) => (None, Err(Failure::from_panic(payload.as_ref())), Some(payload)),
    };
    let fatal = outcome.as_ref().err().filter(|f| !run.non_fatal.contains(&f.kind)).cloned();

    let finished = match (run.finish(outcome).await, panic) {
        (Ok(finished), None) => finished,
        (Err(e), None) => return Err(e),
        (res, Some(payload)) => {
            if let Err(e) = res {
                warn!(error = %e, "could not record the panicked run");
            }
            std::panic::resume_unwind(payload);
        }
    };
    if let Some(f) = fatal {
        return Err(ExprecError::RunFailed { run_id: finished.id, kind: f.kind, message: f.message });
    }
    Ok(Report { id: finished.id, status: finished.status, value, streams: finished.streams })
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}
