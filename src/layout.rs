//! On-disk shape of a run folder.
//!
//! ```text
//! <root>/<run-id>/
//!     experiment.json     metadata record
//!     stdout.txt          stdout mirror
//!     stderr.txt          stderr mirror
//!     stdcombined.txt     both streams, interleaved in write order
//!     packages.txt        sorted package list
//!     src/                source snapshot
//!     scalars/<name>.csv  one append-only series per name
//!     images/<name>/<step>.png
//!     files/              free-form user files
//! ```

use std::path::{Component, Path, PathBuf};

use crate::error::{ExprecError, Result};

pub const DEFAULT_ROOT: &str = ".experiments";
pub const METADATA_FILENAME: &str = "experiment.json";
pub const STDOUT_FILENAME: &str = "stdout.txt";
pub const STDERR_FILENAME: &str = "stderr.txt";
pub const COMBINED_FILENAME: &str = "stdcombined.txt";
pub const PACKAGES_FILENAME: &str = "packages.txt";
pub const SOURCE_FOLDER: &str = "src";
pub const SCALARS_FOLDER: &str = "scalars";
pub const IMAGES_FOLDER: &str = "images";
pub const FILES_FOLDER: &str = "files";

/// Path helpers for a single run folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    dir: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path, id: &str) -> Self {
        Self { dir: root.join(id) }
    }

    pub fn dir(&self) -> &Path { &self.dir }
    pub fn metadata(&self) -> PathBuf { self.dir.join(METADATA_FILENAME) }
    pub fn stdout_log(&self) -> PathBuf { self.dir.join(STDOUT_FILENAME) }
    pub fn stderr_log(&self) -> PathBuf { self.dir.join(STDERR_FILENAME) }
    pub fn combined_log(&self) -> PathBuf { self.dir.join(COMBINED_FILENAME) }
    pub fn packages(&self) -> PathBuf { self.dir.join(PACKAGES_FILENAME) }
    pub fn source(&self) -> PathBuf { self.dir.join(SOURCE_FOLDER) }
    pub fn scalars(&self) -> PathBuf { self.dir.join(SCALARS_FOLDER) }
    pub fn images(&self) -> PathBuf { self.dir.join(IMAGES_FOLDER) }
    pub fn files(&self) -> PathBuf { self.dir.join(FILES_FOLDER) }

    pub fn scalar_series(&self, name: &str) -> PathBuf {
        self.scalars().join(format!("{name}.csv"))
    }

    pub fn image_series(&self, name: &str) -> PathBuf {
        self.images().join(name)
    }

    pub fn image_at(&self, name: &str, step: u64) -> PathBuf {
        self.image_series(name).join(format!("{step}.png"))
    }

    /// Resolves `relative` inside the free-form files area.
    pub fn file(&self, relative: &str) -> Result<PathBuf> {
        ensure_relative(relative)?;
        Ok(self.files().join(relative))
    }
}

/// Rejects paths that could leave the folder they are joined onto. Any `..`
/// substring is refused outright, as are absolute paths and empty strings.
pub fn ensure_relative(relative: &str) -> Result<()> {
    if relative.is_empty() {
        return Err(ExprecError::InvalidArgument("empty path".into()));
    }
    let escapes = Path::new(relative)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.contains("..") {
        return Err(ExprecError::PathTraversal(relative.to_string()));
    }
    Ok(())
}

/// Names used as single path components (scalar and image series).
pub fn ensure_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ExprecError::InvalidArgument("empty series name".into()));
    }
    let p = Path::new(name);
    let mut comps = p.components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(ExprecError::PathTraversal(name.to_string())),
    }
}

/// True if any component of `path` starts with a dot.
pub fn is_hidden(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_segments() {
        for bad in ["..", "../x", "a/../b", "a/..", "/etc/passwd", "a\\..\\b", "v..2.csv"] {
            assert!(
                matches!(ensure_relative(bad), Err(ExprecError::PathTraversal(_))),
                "{bad} should be rejected"
            );
        }
        assert!(ensure_relative("out.csv").is_ok());
        assert!(ensure_relative("nested/dir/out.csv").is_ok());
        assert!(ensure_relative("./out.csv").is_ok());
    }

    #[test]
    fn component_names_are_single_segments() {
        assert!(ensure_component("loss").is_ok());
        assert!(ensure_component("val.loss").is_ok());
        assert!(ensure_component("a/b").is_err());
        assert!(ensure_component("..").is_err());
        assert!(ensure_component("").is_err());
    }

    #[test]
    fn hidden_detection_checks_every_component() {
        assert!(is_hidden(Path::new(".git/config")));
        assert!(is_hidden(Path::new("src/.cache/x.rs")));
        assert!(!is_hidden(Path::new("src/main.rs")));
    }

    #[test]
    fn run_paths_layout() {
        let p = RunPaths::new(Path::new("/tmp/root"), "abc");
        assert_eq!(p.metadata(), Path::new("/tmp/root/abc/experiment.json"));
        assert_eq!(p.scalar_series("loss"), Path::new("/tmp/root/abc/scalars/loss.csv"));
        assert_eq!(p.image_at("grid", 12), Path::new("/tmp/root/abc/images/grid/12.png"));
        assert_eq!(p.file("x/y.txt").unwrap(), Path::new("/tmp/root/abc/files/x/y.txt"));
    }
}
