//! Scan-job resolution.
//!
//! Turns a [`ScanMode`] plus optional overrides into the concrete list of
//! traversal roots, and provides the `--dry-run` traversal that reports what
//! a scan would touch without reading file contents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Result};
use serde::Serialize;

use localrag_core::models::ScanMode;

use crate::config::ScanConfig;
use crate::loader::LoaderRegistry;
use crate::walk::{walk, WalkEvent, WalkOptions};

/// Caller overrides for one run. `None` fields fall back to `[scan]`.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub mode: Option<ScanMode>,
    pub root: Option<PathBuf>,
    pub include_globs: Option<Vec<String>>,
    pub exclude_globs: Option<Vec<String>>,
    pub on_permission_denied: Option<localrag_core::models::PermissionPolicy>,
}

/// A resolved scan job: mode, roots, and traversal settings.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub mode: ScanMode,
    pub roots: Vec<PathBuf>,
    pub scan: ScanConfig,
}

impl ScanJob {
    pub fn resolve(config: &ScanConfig, request: &ScanRequest) -> Result<Self> {
        let mut scan = config.clone();
        let mode = request.mode.unwrap_or(config.mode);
        scan.mode = mode;
        if let Some(include) = &request.include_globs {
            scan.include_globs = include.clone();
        }
        if let Some(exclude) = &request.exclude_globs {
            scan.exclude_globs = exclude.clone();
        }
        if let Some(policy) = request.on_permission_denied {
            scan.on_permission_denied = policy;
        }

        let roots = match (&request.root, mode) {
            (Some(root), _) => vec![root.clone()],
            (None, ScanMode::Manual) => match &config.root {
                Some(root) => vec![root.clone()],
                None => bail!("manual scan needs scan.root in config or --root"),
            },
            (None, ScanMode::Home) => vec![home_dir()?],
            (None, ScanMode::System) => system_roots(),
            (None, ScanMode::Custom) => {
                if config.paths.is_empty() {
                    bail!("custom scan needs scan.paths in config or --root");
                }
                config.paths.clone()
            }
        };

        let roots = roots.iter().map(|r| expand_tilde(r)).collect::<Result<Vec<_>>>()?;
        Ok(Self { mode, roots, scan })
    }

    /// Canonical roots; the removal pass only touches documents under these.
    pub fn coverage(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .filter_map(|r| r.canonicalize().ok())
            .collect()
    }

    pub fn covers(coverage: &[PathBuf], path: &Path) -> bool {
        coverage.iter().any(|root| path.starts_with(root))
    }
}

fn home_dir() -> Result<PathBuf> {
    match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(home)),
        _ => bail!("home scan: HOME is not set"),
    }
}

fn system_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        ('A'..='Z')
            .map(|d| PathBuf::from(format!("{}:\\", d)))
            .filter(|p| p.exists())
            .collect()
    } else {
        vec![PathBuf::from("/")]
    }
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

// ============ Dry run ============

#[derive(Debug, Clone, Default, Serialize)]
pub struct DryRunSummary {
    pub files: usize,
    pub total_bytes: u64,
    pub by_format: BTreeMap<String, usize>,
    pub directories: usize,
    pub permission_errors: Vec<String>,
    pub oversized: usize,
}

/// Traverse `job` without loading anything.
pub fn dry_run(job: &ScanJob, loaders: &LoaderRegistry, stop: &AtomicBool) -> Result<DryRunSummary> {
    let opts = WalkOptions::from_config(&job.scan)?;
    let mut summary = DryRunSummary::default();
    let walked = walk(&job.roots, &opts, stop, |event| {
        match event {
            WalkEvent::File(file) => {
                summary.files += 1;
                summary.total_bytes += file.size;
                let format = loaders.format_of(&file.path).unwrap_or("unsupported");
                *summary.by_format.entry(format.to_string()).or_insert(0) += 1;
            }
            WalkEvent::Oversized { .. } => summary.oversized += 1,
            WalkEvent::Denied(err) => summary.permission_errors.push(err.to_string()),
        }
        true
    });
    summary.directories = walked.directories;
    Ok(summary)
}
