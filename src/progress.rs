//! Scan progress reporting.
//!
//! Reports observable progress during `lrag scan` so users see what is being
//! walked, how much is done, and when the index is up to date. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use localrag_core::models::ScanMode;

/// A single progress event for a scan.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanProgressEvent {
    /// Traversal is running; `files` accepted so far.
    Walking { mode: ScanMode, files: u64 },
    /// `done` of `discovered` files have been processed (indexed, skipped or failed).
    Processing {
        mode: ScanMode,
        done: u64,
        discovered: u64,
    },
    /// The removal pass is checking `candidates` documents not seen in this scan.
    Removing { mode: ScanMode, candidates: u64 },
}

/// Reports scan progress. Implementations write to stderr (human or JSON).
pub trait ScanProgressReporter: Send + Sync {
    /// Emit a progress event. Called from worker tasks.
    fn report(&self, event: ScanProgressEvent);
}

/// Human-friendly progress on stderr: "scan home  processing  1,234 / 5,000 files".
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, event: ScanProgressEvent) {
        let line = match &event {
            ScanProgressEvent::Walking { mode, files } => {
                format!("scan {}  walking  {} files found\n", mode, format_number(*files))
            }
            ScanProgressEvent::Processing {
                mode,
                done,
                discovered,
            } => format!(
                "scan {}  processing  {} / {} files\n",
                mode,
                format_number(*done),
                format_number(*discovered)
            ),
            ScanProgressEvent::Removing { mode, candidates } => format!(
                "scan {}  removing  {} unseen documents\n",
                mode,
                format_number(*candidates)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, event: ScanProgressEvent) {
        let obj = match &event {
            ScanProgressEvent::Walking { mode, files } => serde_json::json!({
                "event": "progress",
                "mode": mode,
                "phase": "walking",
                "files": files
            }),
            ScanProgressEvent::Processing {
                mode,
                done,
                discovered,
            } => serde_json::json!({
                "event": "progress",
                "mode": mode,
                "phase": "processing",
                "n": done,
                "total": discovered
            }),
            ScanProgressEvent::Removing { mode, candidates } => serde_json::json!({
                "event": "progress",
                "mode": mode,
                "phase": "removing",
                "candidates": candidates
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _event: ScanProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}': expected off, human, or json",
                other
            )),
        }
    }
}
