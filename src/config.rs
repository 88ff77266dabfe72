use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::environment::PackageSource;
use crate::layout::DEFAULT_ROOT;
use crate::recorder::INTERRUPTED_KIND;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExprecConfig {
    /// Folder holding one sub-folder per run.
    pub root: PathBuf,
    /// Extensions copied into source snapshots; empty copies every file.
    pub source_extensions: Vec<String>,
    pub package_source: PackageSource,
    /// Used when `package_source` is `command`, e.g. `["cargo", "tree", "--prefix", "none"]`.
    pub package_command: Vec<String>,
    /// Failure kinds that still end a run as succeeded.
    pub non_fatal: BTreeSet<String>,
    /// Print a one-line banner when a run starts.
    pub verbose: bool,
}

impl Default for ExprecConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            source_extensions: vec!["rs".into(), "toml".into()],
            package_source: PackageSource::CargoLock,
            package_command: Vec::new(),
            non_fatal: BTreeSet::from([INTERRUPTED_KIND.to_string()]),
            verbose: true,
        }
    }
}

impl ExprecConfig {
    /// Reads a YAML config; missing keys take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let cfg: ExprecConfig = serde_yaml::from_str(&txt).context("Failed to parse config YAML")?;
        Ok(cfg)
    }

    /// Defaults overlaid with `EXPREC_*` variables (a `.env` file is honored).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(root) = var("EXPREC_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(v) = var("EXPREC_VERBOSE") {
            self.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(exts) = var("EXPREC_SOURCE_EXTENSIONS") {
            self.source_extensions = exts
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
    }
}
