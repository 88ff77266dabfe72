//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use exprec::environment::PackageSource;
use exprec::{RunOptions, StdStreams};
use parking_lot::Mutex;
use tempfile::TempDir;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A scratch workspace: a source tree to snapshot and an experiments root
/// inside it, the way a project keeps `.experiments` next to its code.
pub struct Workspace {
    pub dir: TempDir,
    pub src: PathBuf,
    pub root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("project");
        let root = src.join(".experiments");
        write(&src, "src/main.rs", "fn main() {\n    train();\n}\n");
        write(&src, "Cargo.toml", "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n");
        write(
            &src,
            "Cargo.lock",
            "version = 3\n\n[[package]]\nname = \"serde\"\nversion = \"1.0.0\"\n\n[[package]]\nname = \"demo\"\nversion = \"0.1.0\"\n",
        );
        write(&src, ".secret/key.rs", "const KEY: &str = \"hidden\";\n");
        write(&src, "notes.md", "not snapshotted\n");
        Self { dir, src, root }
    }

    /// Options for a quiet run named `name` (empty for none).
    pub fn options(&self, name: &str) -> RunOptions {
        RunOptions::new(&self.root).name(name).source_dir(&self.src).verbose(false)
    }

    pub fn write_source(&self, rel: &str, body: &str) {
        write(&self.src, rel, body);
    }
}

pub fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, body).unwrap();
}

/// An in-memory stream standing in for a terminal.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streams that record what reaches the "terminal", plus handles to read it.
pub fn captured_streams() -> (StdStreams, Capture, Capture) {
    let out = Capture::default();
    let err = Capture::default();
    let streams = StdStreams { stdout: Box::new(out.clone()), stderr: Box::new(err.clone()) };
    (streams, out, err)
}

pub fn no_packages(opts: RunOptions) -> RunOptions {
    opts.package_source(PackageSource::None)
}
