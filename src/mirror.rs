//! Output mirroring: every write to a run's stdout/stderr handle goes to the
//! original stream, a per-stream log file, and the combined log.
//!
//! The original streams are passed in explicitly and handed back by
//! [`OutputMirror::close`]; nothing process-global is swapped out.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::layout::RunPaths;

/// The pair of streams a run mirrors.
pub struct StdStreams {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl StdStreams {
    /// The process's own stdout and stderr.
    pub fn process() -> Self {
        Self { stdout: Box::new(io::stdout()), stderr: Box::new(io::stderr()) }
    }

    /// Discards the original-stream copy; only the log files are written.
    pub fn sink() -> Self {
        Self { stdout: Box::new(io::sink()), stderr: Box::new(io::sink()) }
    }
}

impl Default for StdStreams {
    fn default() -> Self {
        Self::process()
    }
}

/// One mirrored stream.
pub struct StreamTee {
    original: Box<dyn Write + Send>,
    log: File,
    combined: Arc<Mutex<File>>,
}

impl Write for StreamTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.original.write_all(buf)?;
        self.log.write_all(buf)?;
        self.combined.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.original.flush()?;
        self.log.flush()?;
        self.combined.lock().flush()
    }
}

pub struct OutputMirror {
    stdout: StreamTee,
    stderr: StreamTee,
}

impl OutputMirror {
    /// Creates (truncating) the three log files and wraps `streams`.
    pub fn open(paths: &RunPaths, streams: StdStreams) -> io::Result<Self> {
        let combined = Arc::new(Mutex::new(create_log(&paths.combined_log())?));
        Ok(Self {
            stdout: StreamTee {
                original: streams.stdout,
                log: create_log(&paths.stdout_log())?,
                combined: combined.clone(),
            },
            stderr: StreamTee {
                original: streams.stderr,
                log: create_log(&paths.stderr_log())?,
                combined,
            },
        })
    }

    pub fn stdout(&mut self) -> &mut StreamTee { &mut self.stdout }
    pub fn stderr(&mut self) -> &mut StreamTee { &mut self.stderr }

    /// Flushes and closes the log files and returns the original streams.
    /// The streams come back even when the final flush fails; the flush
    /// error is returned alongside them.
    pub fn close(mut self) -> (StdStreams, io::Result<()>) {
        let flushed = self.stdout.flush().and(self.stderr.flush());
        let streams = StdStreams { stdout: self.stdout.original, stderr: self.stderr.original };
        (streams, flushed)
    }
}

fn create_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).write(true).truncate(true).open(path)
}
