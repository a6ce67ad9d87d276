//! Breadth-first filesystem traversal shared by every scan mode.
//!
//! Directories are visited level by level, children sorted by name, so two
//! walks over the same tree emit files in the same order. Include/exclude
//! globs are matched against the path relative to the walk root; an
//! excluded directory is pruned without being read. Symbolic links are
//! skipped unless `follow_symlinks` is set, in which case every directory
//! is canonicalized and entered at most once, which breaks link cycles.
//!
//! Unreadable entries are reported as [`WalkEvent::Denied`]. Under
//! [`PermissionPolicy::Skip`] traversal continues past them; under
//! [`PermissionPolicy::Abort`] it stops at the first one.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, trace};
use walkdir::WalkDir;

use localrag_core::error::ScanPermissionError;
use localrag_core::models::PermissionPolicy;

use crate::config::ScanConfig;

/// A regular file accepted by the include/exclude rules.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundFile {
    /// Canonical path.
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, unix seconds.
    pub modified_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalkEvent {
    File(FoundFile),
    /// Matched the include rules but exceeds `max_file_bytes`.
    Oversized { path: PathBuf, size: u64 },
    Denied(ScanPermissionError),
}

/// Counters for one traversal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalkSummary {
    pub directories: usize,
    pub files: usize,
    pub denied: usize,
    /// Traversal stopped on a permission error under the abort policy.
    pub aborted: bool,
    /// Traversal stopped early on the stop signal or at the sink's request.
    pub stopped: bool,
}

/// Compiled traversal rules.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    include: GlobSet,
    exclude: GlobSet,
    pub max_depth: usize,
    pub follow_symlinks: bool,
    pub on_permission_denied: PermissionPolicy,
    pub max_file_bytes: u64,
    pub skip_paths: Vec<PathBuf>,
}

impl WalkOptions {
    pub fn from_config(config: &ScanConfig) -> Result<Self> {
        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            max_depth: config.max_depth,
            follow_symlinks: config.follow_symlinks,
            on_permission_denied: config.on_permission_denied,
            max_file_bytes: config.max_file_bytes,
            skip_paths: config.skip_paths.clone(),
        })
    }

    fn is_included(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }

    fn is_skipped_dir(&self, path: &Path) -> bool {
        self.skip_paths.iter().any(|p| path.starts_with(p))
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn unix_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn denied(path: &Path, err: impl std::fmt::Display) -> ScanPermissionError {
    ScanPermissionError {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Walk `roots` breadth-first, passing every event to `sink`.
///
/// `sink` returns `false` to stop the walk. Blocking; run it on a blocking
/// thread.
pub fn walk<F>(roots: &[PathBuf], opts: &WalkOptions, stop: &AtomicBool, mut sink: F) -> WalkSummary
where
    F: FnMut(WalkEvent) -> bool,
{
    let mut summary = WalkSummary::default();
    let mut visited: HashSet<PathBuf> = HashSet::new();

    for root in roots {
        let root = match root.canonicalize() {
            Ok(r) => r,
            Err(e) => {
                summary.denied += 1;
                let go_on = sink(WalkEvent::Denied(denied(root, e)));
                if !go_on || opts.on_permission_denied == PermissionPolicy::Abort {
                    summary.aborted = opts.on_permission_denied == PermissionPolicy::Abort;
                    summary.stopped = !go_on;
                    return summary;
                }
                continue;
            }
        };

        if root.is_file() {
            let name = root.file_name().map(PathBuf::from).unwrap_or_default();
            if opts.is_included(&name) {
                if let Ok(meta) = std::fs::metadata(&root) {
                    summary.files += 1;
                    if !sink(file_event(root.clone(), &meta, opts)) {
                        summary.stopped = true;
                        return summary;
                    }
                }
            }
            continue;
        }

        let mut queue: VecDeque<(PathBuf, usize)> = VecDeque::new();
        if visited.insert(root.clone()) {
            queue.push_back((root.clone(), 0));
        }

        while let Some((dir, depth)) = queue.pop_front() {
            if stop.load(Ordering::Relaxed) {
                summary.stopped = true;
                return summary;
            }
            summary.directories += 1;
            trace!(dir = %dir.display(), depth, "entering directory");

            let listing = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(opts.follow_symlinks)
                .sort_by_file_name();

            for entry in listing {
                if stop.load(Ordering::Relaxed) {
                    summary.stopped = true;
                    return summary;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(&dir).to_path_buf();
                        let permission = e
                            .io_error()
                            .map(|io| io.kind() == std::io::ErrorKind::PermissionDenied)
                            .unwrap_or(false);
                        if !permission {
                            // Vanished mid-walk or a symlink loop; nothing to report.
                            debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                            continue;
                        }
                        summary.denied += 1;
                        let go_on = sink(WalkEvent::Denied(denied(&path, &e)));
                        if opts.on_permission_denied == PermissionPolicy::Abort {
                            summary.aborted = true;
                            return summary;
                        }
                        if !go_on {
                            summary.stopped = true;
                            return summary;
                        }
                        continue;
                    }
                };

                let path = entry.path();
                let relative = path.strip_prefix(&root).unwrap_or(path);
                let child_depth = depth + 1;
                let file_type = entry.file_type();

                if file_type.is_dir() {
                    if child_depth >= opts.max_depth
                        || opts.exclude.is_match(relative)
                        || opts.is_skipped_dir(path)
                    {
                        continue;
                    }
                    let canonical = if entry.path_is_symlink() {
                        match path.canonicalize() {
                            Ok(c) => c,
                            Err(_) => continue,
                        }
                    } else {
                        path.to_path_buf()
                    };
                    if visited.insert(canonical.clone()) {
                        queue.push_back((canonical, child_depth));
                    }
                } else if file_type.is_file() {
                    if child_depth > opts.max_depth || !opts.is_included(relative) {
                        continue;
                    }
                    let meta = match entry.metadata() {
                        Ok(m) => m,
                        Err(e) => {
                            summary.denied += 1;
                            let go_on = sink(WalkEvent::Denied(denied(path, &e)));
                            if opts.on_permission_denied == PermissionPolicy::Abort {
                                summary.aborted = true;
                                return summary;
                            }
                            if !go_on {
                                summary.stopped = true;
                                return summary;
                            }
                            continue;
                        }
                    };
                    let canonical = if entry.path_is_symlink() {
                        match path.canonicalize() {
                            Ok(c) => c,
                            Err(_) => continue,
                        }
                    } else {
                        path.to_path_buf()
                    };
                    summary.files += 1;
                    if !sink(file_event(canonical, &meta, opts)) {
                        summary.stopped = true;
                        return summary;
                    }
                }
            }
        }
    }

    summary
}

fn file_event(path: PathBuf, meta: &std::fs::Metadata, opts: &WalkOptions) -> WalkEvent {
    let size = meta.len();
    if size > opts.max_file_bytes {
        WalkEvent::Oversized { path, size }
    } else {
        WalkEvent::File(FoundFile {
            path,
            size,
            modified_at: unix_mtime(meta),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn opts() -> WalkOptions {
        WalkOptions::from_config(&ScanConfig::default()).unwrap()
    }

    fn collect(roots: &[PathBuf], opts: &WalkOptions) -> (Vec<WalkEvent>, WalkSummary) {
        let stop = AtomicBool::new(false);
        let mut events = Vec::new();
        let summary = walk(roots, opts, &stop, |e| {
            events.push(e);
            true
        });
        (events, summary)
    }

    fn file_names(events: &[WalkEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                WalkEvent::File(f) => Some(f.path.file_name()?.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn breadth_first_sorted_with_globs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("b/deep")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("z.md"), "z").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("image.png"), "x").unwrap();
        fs::write(root.join("b/c.md"), "c").unwrap();
        fs::write(root.join("b/deep/d.txt"), "d").unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "n").unwrap();

        let (events, summary) = collect(&[root.to_path_buf()], &opts());
        assert_eq!(file_names(&events), vec!["a.txt", "z.md", "c.md", "d.txt"]);
        assert_eq!(summary.files, 4);
        assert!(!summary.aborted);
    }

    #[test]
    fn respects_max_depth() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("one/two")).unwrap();
        fs::write(root.join("top.txt"), "t").unwrap();
        fs::write(root.join("one/mid.txt"), "m").unwrap();
        fs::write(root.join("one/two/low.txt"), "l").unwrap();

        let mut o = opts();
        o.max_depth = 2;
        let (events, _) = collect(&[root.to_path_buf()], &o);
        assert_eq!(file_names(&events), vec!["top.txt", "mid.txt"]);
    }

    #[test]
    fn oversized_files_are_reported_not_emitted() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("big.txt"), "0123456789").unwrap();
        let mut o = opts();
        o.max_file_bytes = 5;
        let (events, _) = collect(&[tmp.path().to_path_buf()], &o);
        assert!(matches!(&events[..], [WalkEvent::Oversized { size: 10, .. }]));
    }

    #[test]
    fn missing_root_is_denied_and_walk_continues() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let roots = vec![tmp.path().join("missing"), tmp.path().to_path_buf()];
        let (events, summary) = collect(&roots, &opts());
        assert_eq!(summary.denied, 1);
        assert!(matches!(events[0], WalkEvent::Denied(_)));
        assert_eq!(file_names(&events), vec!["a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_terminate() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("loop")).unwrap();
        fs::write(root.join("loop/a.txt"), "a").unwrap();
        std::os::unix::fs::symlink(root, root.join("loop/back")).unwrap();

        let mut o = opts();
        o.follow_symlinks = true;
        let (events, _) = collect(&[root.to_path_buf()], &o);
        assert_eq!(file_names(&events), vec!["a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed_by_default() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(root.join("real.txt"), "r").unwrap();
        fs::write(outside.join("linked.txt"), "l").unwrap();
        std::os::unix::fs::symlink(outside.join("linked.txt"), root.join("file-link.txt")).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("dir-link")).unwrap();

        let (events, summary) = collect(&[root.clone()], &opts());
        assert_eq!(file_names(&events), vec!["real.txt"]);
        assert_eq!(summary.directories, 1);

        let mut o = opts();
        o.follow_symlinks = true;
        let (events, _) = collect(&[root], &o);
        let names = file_names(&events);
        assert!(names.contains(&"real.txt".to_string()));
        assert!(names.contains(&"linked.txt".to_string()));
    }

    /// Make `dir` unreadable. Returns false when the process can read it
    /// anyway (running as root), in which case the caller skips.
    #[cfg(unix)]
    fn lock_dir(dir: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(dir).is_ok() {
            unlock_dir(dir);
            return false;
        }
        true
    }

    #[cfg(unix)]
    fn unlock_dir(dir: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn denied_directory_follows_policy() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("locked")).unwrap();
        fs::create_dir_all(root.join("open")).unwrap();
        fs::write(root.join("locked/secret.txt"), "s").unwrap();
        fs::write(root.join("open/note.txt"), "n").unwrap();
        if !lock_dir(&root.join("locked")) {
            return;
        }

        let (skip_events, skip_summary) = collect(&[root.clone()], &opts());

        let mut o = opts();
        o.on_permission_denied = PermissionPolicy::Abort;
        let (abort_events, abort_summary) = collect(&[root.clone()], &o);
        unlock_dir(&root.join("locked"));

        assert_eq!(skip_summary.denied, 1);
        assert!(!skip_summary.aborted);
        assert!(skip_events.iter().any(
            |e| matches!(e, WalkEvent::Denied(err) if err.path == root.join("locked"))
        ));
        assert_eq!(file_names(&skip_events), vec!["note.txt"]);

        assert!(abort_summary.aborted);
        assert!(file_names(&abort_events).is_empty());
    }

    #[test]
    fn stop_signal_halts_traversal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let stop = AtomicBool::new(true);
        let summary = walk(&[tmp.path().to_path_buf()], &opts(), &stop, |_| true);
        assert!(summary.stopped);
        assert_eq!(summary.files, 0);
    }
}
