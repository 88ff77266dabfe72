//! Environment captured once when a run starts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::record::GitInfo;

pub const SHORT_SHA_LEN: usize = 7;

/// `rustc --version` of the toolchain that compiled this crate, and with it
/// the program recording runs.
pub const RUSTC_VERSION: &str = env!("EXPREC_RUSTC_VERSION");

/// Where the package list comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageSource {
    /// `name==version` for every package in the source dir's `Cargo.lock`.
    #[default]
    CargoLock,
    /// One package per stdout line of the configured command.
    Command,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub program: String,
    pub arguments: Vec<String>,
    pub runtime_version: String,
    pub os_version: String,
    pub pid: u32,
    pub git: Option<GitInfo>,
}

impl Environment {
    pub async fn capture(source_dir: &Path) -> Self {
        let mut args = std::env::args();
        let program = args.next().unwrap_or_default();
        Self {
            program,
            arguments: args.collect(),
            runtime_version: RUSTC_VERSION.to_string(),
            os_version: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            pid: std::process::id(),
            git: git_info(source_dir).await,
        }
    }
}

/// Sorted package list. Capture problems are logged and give an empty list.
pub async fn packages(source_dir: &Path, source: &PackageSource, command: &[String]) -> Vec<String> {
    let mut list = match source {
        PackageSource::CargoLock => match cargo_lock_packages(&source_dir.join("Cargo.lock")).await {
            Ok(list) => list,
            Err(e) => {
                debug!(error = %e, "no package list from Cargo.lock");
                Vec::new()
            }
        },
        PackageSource::Command => match command.split_first() {
            Some((prog, args)) => run_capture(prog, args, source_dir)
                .await
                .map(|out| out.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
                .unwrap_or_else(|| {
                    warn!(command = ?command, "package command failed");
                    Vec::new()
                }),
            None => Vec::new(),
        },
        PackageSource::None => Vec::new(),
    };
    list.sort();
    list.dedup();
    list
}

#[derive(Deserialize)]
struct CargoLock {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

#[derive(Deserialize)]
struct LockedPackage {
    name: String,
    version: String,
}

async fn cargo_lock_packages(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path).await?;
    let lock: CargoLock = toml::from_str(&text)?;
    Ok(lock.package.into_iter().map(|p| format!("{}=={}", p.name, p.version)).collect())
}

async fn git_info(dir: &Path) -> Option<GitInfo> {
    let sha = run_capture("git", &["rev-parse".into(), "HEAD".into()], dir).await?;
    let sha = sha.trim().to_string();
    if sha.is_empty() {
        return None;
    }
    let short = sha.chars().take(SHORT_SHA_LEN).collect();
    Some(GitInfo { sha, short })
}

async fn run_capture(program: &str, args: &[String], dir: &Path) -> Option<String> {
    let out = Command::new(program).args(args).current_dir(dir).output().await.ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout).ok()
}
