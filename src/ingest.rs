//! Indexing orchestrator.
//!
//! Drives one scan job end to end:
//!
//! ```text
//!  walk (blocking thread) ──files──▶ dispatcher ──spawn──▶ workers (≤ N)
//!                                                           │  read, hash, fast path
//!                                                           │  load, chunk
//!                                                           ├──texts──▶ embed queue ──▶ Embedder
//!                                                           └──ops────▶ committer ──▶ Catalog
//! ```
//!
//! - Traversal streams files through a bounded channel, so a huge tree never
//!   sits in memory.
//! - A semaphore bounds concurrent workers.
//! - Every store mutation goes through one committer task, the single
//!   writer of the vector index. Queries read the stores directly and see
//!   only committed chunks.
//! - The stop signal is checked before each new document; documents already
//!   in flight finish their commit protocol.
//! - After a completed walk, documents under the scan roots that were not
//!   seen are removed through the deletion protocol. Interrupted or aborted
//!   runs skip this pass.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use localrag_core::catalog::Catalog;
use localrag_core::chunk::{chunk_text, ChunkParams};
use localrag_core::error::{IndexWriteError, LoadError};
use localrag_core::hash::sha256_hex;
use localrag_core::license::{require, OP_INDEX};
use localrag_core::models::{Chunk, Document, DocumentStatus, PermissionPolicy, ScanMode};

use crate::context::KnowledgeBase;
use crate::embed_queue::{EmbedQueue, RetryPolicy};
use crate::loader::LoaderRegistry;
use crate::progress::{ScanProgressEvent, ScanProgressReporter};
use crate::scan::ScanJob;
use crate::walk::{walk, FoundFile, WalkEvent, WalkOptions};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Report ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOutcome {
    Completed,
    /// The stop signal was raised.
    Interrupted,
    /// Stopped on a permission error under the abort policy, or on a
    /// store error that blocks further writes.
    Aborted,
}

impl std::fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScanOutcome::Completed => "completed",
            ScanOutcome::Interrupted => "interrupted",
            ScanOutcome::Aborted => "aborted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub job_id: String,
    pub mode: ScanMode,
    pub roots: Vec<PathBuf>,
    /// Files accepted by traversal.
    pub discovered: usize,
    pub indexed: usize,
    /// Loaded successfully but contained no text.
    pub indexed_empty: usize,
    /// Unchanged since the last scan.
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    pub oversized: usize,
    pub permission_denied: usize,
    /// Files left for a later run by `--limit`.
    pub deferred: usize,
    pub chunks_written: usize,
    pub failures: Vec<ScanFailure>,
    pub elapsed_ms: u64,
    pub outcome: ScanOutcome,
}

impl ScanReport {
    fn new(job: &ScanJob) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            mode: job.mode,
            roots: job.roots.clone(),
            discovered: 0,
            indexed: 0,
            indexed_empty: 0,
            skipped: 0,
            failed: 0,
            removed: 0,
            oversized: 0,
            permission_denied: 0,
            deferred: 0,
            chunks_written: 0,
            failures: Vec::new(),
            elapsed_ms: 0,
            outcome: ScanOutcome::Completed,
        }
    }

    fn record_failure(&mut self, path: &Path, cause: impl Into<String>) {
        self.failed += 1;
        self.failures.push(ScanFailure {
            path: path.to_path_buf(),
            cause: cause.into(),
        });
    }

    /// Print the report in the CLI's key/value layout.
    pub fn print(&self) {
        println!("scan {} ({})", self.mode, self.outcome);
        println!("  job: {}", self.job_id);
        for root in &self.roots {
            println!("  root: {}", root.display());
        }
        println!("  discovered: {}", self.discovered);
        println!("  indexed: {}", self.indexed);
        println!("  indexed (empty): {}", self.indexed_empty);
        println!("  skipped (unchanged): {}", self.skipped);
        println!("  failed: {}", self.failed);
        println!("  removed: {}", self.removed);
        if self.oversized > 0 {
            println!("  oversized: {}", self.oversized);
        }
        if self.permission_denied > 0 {
            println!("  permission denied: {}", self.permission_denied);
        }
        if self.deferred > 0 {
            println!("  deferred (limit): {}", self.deferred);
        }
        println!("  chunks written: {}", self.chunks_written);
        println!("  elapsed: {:.1}s", self.elapsed_ms as f64 / 1000.0);
        if !self.failures.is_empty() {
            println!("  failures:");
            for failure in &self.failures {
                println!("    {}: {}", failure.path.display(), failure.cause);
            }
        }
    }
}

// ============ Options ============

pub struct ScanOptions {
    pub job: ScanJob,
    /// Stop after this many documents have been (re)processed.
    pub limit: Option<usize>,
    /// Reprocess failed documents even if their content is unchanged.
    pub retry_failed: bool,
}

// ============ Committer ============

enum CommitOp {
    /// Drop any previous chunks of the path and move the new document to `loading`.
    Prepare {
        doc: Document,
        reply: oneshot::Sender<Result<Document, IndexWriteError>>,
    },
    Transition {
        doc: Document,
        next: DocumentStatus,
        error: Option<String>,
        reply: oneshot::Sender<Result<Document, IndexWriteError>>,
    },
    Commit {
        doc: Document,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
        model: String,
        reply: oneshot::Sender<Result<Document, IndexWriteError>>,
    },
    Remove {
        path: PathBuf,
        reply: oneshot::Sender<Result<usize, IndexWriteError>>,
    },
}

/// Handle to the single-writer commit task.
#[derive(Clone)]
struct Committer {
    tx: mpsc::Sender<CommitOp>,
}

fn stopped() -> IndexWriteError {
    IndexWriteError::Metadata("commit queue stopped".to_string())
}

impl Committer {
    fn spawn(catalog: Catalog, depth: usize) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CommitOp>(depth.max(1));
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    CommitOp::Prepare { doc, reply } => {
                        let _ = reply.send(prepare(&catalog, doc).await);
                    }
                    CommitOp::Transition {
                        doc,
                        next,
                        error,
                        reply,
                    } => {
                        let _ = reply.send(catalog.transition(&doc, next, error, now()).await);
                    }
                    CommitOp::Commit {
                        doc,
                        chunks,
                        vectors,
                        model,
                        reply,
                    } => {
                        let result = catalog
                            .commit_document(&doc, &chunks, &vectors, &model, now())
                            .await;
                        let _ = reply.send(result);
                    }
                    CommitOp::Remove { path, reply } => {
                        let result = catalog
                            .delete_document(&path, DocumentStatus::Removed, now())
                            .await;
                        let _ = reply.send(result);
                    }
                }
            }
            debug!("committer stopped");
        });
        (Self { tx }, handle)
    }

    async fn call<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<Result<T, IndexWriteError>>) -> CommitOp,
    ) -> Result<T, IndexWriteError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(op(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    async fn prepare(&self, doc: Document) -> Result<Document, IndexWriteError> {
        self.call(|reply| CommitOp::Prepare { doc, reply }).await
    }

    async fn transition(
        &self,
        doc: &Document,
        next: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document, IndexWriteError> {
        let doc = doc.clone();
        self.call(|reply| CommitOp::Transition {
            doc,
            next,
            error,
            reply,
        })
        .await
    }

    async fn commit(
        &self,
        doc: &Document,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
        model: String,
    ) -> Result<Document, IndexWriteError> {
        let doc = doc.clone();
        self.call(|reply| CommitOp::Commit {
            doc,
            chunks,
            vectors,
            model,
            reply,
        })
        .await
    }

    async fn remove(&self, path: PathBuf) -> Result<usize, IndexWriteError> {
        self.call(|reply| CommitOp::Remove { path, reply }).await
    }
}

/// Bring `doc.path` to `loading` through the legal lifecycle, running the
/// deletion protocol on any chunks the previous version owned.
async fn prepare(catalog: &Catalog, doc: Document) -> Result<Document, IndexWriteError> {
    let stored = catalog
        .metadata()
        .get_document(&doc.path)
        .await
        .map_err(|e| IndexWriteError::Metadata(format!("{:#}", e)))?;

    let ts = now();
    match stored.map(|s| s.status) {
        None | Some(DocumentStatus::Removed) => {
            let discovered = catalog
                .transition(&doc, DocumentStatus::Discovered, None, ts)
                .await?;
            catalog
                .transition(&discovered, DocumentStatus::Loading, None, ts)
                .await
        }
        Some(_) => {
            catalog
                .delete_document(&doc.path, DocumentStatus::Stale, ts)
                .await?;
            catalog
                .transition(&doc, DocumentStatus::Loading, None, ts)
                .await
        }
    }
}

// ============ Workers ============

enum DocOutcome {
    Skipped,
    /// Not processed because the `--limit` budget was spent.
    Deferred,
    Indexed { chunks: usize },
    IndexedEmpty,
    Failed(String),
    /// The file could be listed but not read.
    Denied(String),
    /// A store error that makes further writes pointless.
    Fatal(String),
}

struct Worker {
    catalog: Catalog,
    loaders: Arc<LoaderRegistry>,
    params: ChunkParams,
    embed: EmbedQueue,
    committer: Committer,
    model: String,
    mode: ScanMode,
    retry_failed: bool,
    limit: Option<usize>,
    processed: AtomicUsize,
}

impl Worker {
    /// Claim one unit of the `--limit` budget.
    fn claim(&self) -> bool {
        match self.limit {
            None => true,
            Some(limit) => self
                .processed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    fn budget_spent(&self) -> bool {
        self.limit
            .map(|l| self.processed.load(Ordering::SeqCst) >= l)
            .unwrap_or(false)
    }

    async fn process(&self, file: FoundFile) -> DocOutcome {
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(b) => b,
            Err(e) => {
                return match LoadError::from_io(&file.path, e) {
                    err @ LoadError::PermissionDenied(_) => DocOutcome::Denied(err.to_string()),
                    err => DocOutcome::Failed(err.to_string()),
                }
            }
        };
        let content_hash = sha256_hex(&bytes);

        let stored = match self.catalog.metadata().get_document(&file.path).await {
            Ok(s) => s,
            Err(e) => return DocOutcome::Failed(format!("{:#}", e)),
        };
        if let Some(stored) = &stored {
            let unchanged = stored.content_hash == content_hash && stored.status.is_settled();
            let retry = self.retry_failed && stored.status == DocumentStatus::Failed;
            if unchanged && !retry {
                return DocOutcome::Skipped;
            }
        }
        if !self.claim() {
            return DocOutcome::Deferred;
        }

        let doc = Document {
            path: file.path.clone(),
            title: None,
            content_hash,
            size_bytes: file.size,
            modified_at: file.modified_at,
            format: self
                .loaders
                .format_of(&file.path)
                .unwrap_or("unknown")
                .to_string(),
            scan_mode: self.mode,
            status: DocumentStatus::Discovered,
            error: None,
            updated_at: now(),
        };

        let doc = match self.committer.prepare(doc).await {
            Ok(d) => d,
            Err(e) => return write_failure(e),
        };
        self.index_loaded(doc, bytes).await
    }

    async fn index_loaded(&self, mut doc: Document, bytes: Vec<u8>) -> DocOutcome {
        let loaders = self.loaders.clone();
        let path = doc.path.clone();
        let loaded = tokio::task::spawn_blocking(move || loaders.load(&path, &bytes))
            .await
            .map_err(|e| format!("loader task failed: {}", e))
            .and_then(|r| r.map_err(|e| e.to_string()));
        let loaded = match loaded {
            Ok(l) => l,
            Err(cause) => return self.fail(&doc, cause).await,
        };
        doc.title = loaded.title.clone();

        let chunks = match chunk_text(&doc.id(), &loaded.text, &self.params) {
            Ok(c) => c,
            Err(e) => return self.fail(&doc, e.to_string()).await,
        };
        if chunks.is_empty() {
            return match self
                .committer
                .transition(&doc, DocumentStatus::IndexedEmpty, None)
                .await
            {
                Ok(_) => DocOutcome::IndexedEmpty,
                Err(e) => write_failure(e),
            };
        }

        let doc = match self
            .committer
            .transition(&doc, DocumentStatus::Chunked, None)
            .await
        {
            Ok(d) => d,
            Err(e) => return write_failure(e),
        };

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embed.embed(texts).await {
            Ok(v) => v,
            Err(e) => return self.fail(&doc, e.to_string()).await,
        };

        let count = chunks.len();
        match self
            .committer
            .commit(&doc, chunks, vectors, self.model.clone())
            .await
        {
            Ok(_) => DocOutcome::Indexed { chunks: count },
            Err(e) => write_failure(e),
        }
    }

    async fn fail(&self, doc: &Document, cause: String) -> DocOutcome {
        debug!(path = %doc.path.display(), cause = %cause, "document failed");
        match self
            .committer
            .transition(doc, DocumentStatus::Failed, Some(cause.clone()))
            .await
        {
            Ok(_) => DocOutcome::Failed(cause),
            Err(e) => write_failure(e),
        }
    }
}

fn write_failure(err: IndexWriteError) -> DocOutcome {
    match err {
        IndexWriteError::RepairRequired => DocOutcome::Fatal(err.to_string()),
        other => DocOutcome::Failed(other.to_string()),
    }
}

// ============ Scan ============

/// Run one scan job against `kb`.
///
/// Setting `stop` ends the run after in-flight documents commit; the report
/// is then marked [`ScanOutcome::Interrupted`].
pub async fn run_scan(
    kb: &KnowledgeBase,
    options: ScanOptions,
    stop: Arc<AtomicBool>,
    progress: Arc<dyn ScanProgressReporter>,
) -> Result<ScanReport> {
    require(kb.gate().as_ref(), OP_INDEX)?;
    let started = Instant::now();
    let ScanOptions {
        job,
        limit,
        retry_failed,
    } = options;
    let report = ScanReport::new(&job);
    let job_id = report.job_id.clone();

    let reconciled = kb.reconcile().await?;
    if reconciled.needs_repair {
        return Err(IndexWriteError::RepairRequired.into());
    }

    let embedder = kb.embedder().clone();
    let catalog = kb.catalog().clone();
    if let Some(change) = catalog.activate_model(embedder.model_id(), now()).await? {
        info!(
            previous = %change.previous,
            current = embedder.model_id(),
            retired_embeddings = change.retired_embeddings,
            invalidated_documents = change.invalidated_documents,
            "embedding model changed; documents will be re-embedded"
        );
    }

    info!(
        job_id = %job_id,
        mode = %job.mode,
        roots = ?job.roots,
        "scan started"
    );

    let config = &kb.config;
    let (embed, embed_handle) = EmbedQueue::spawn(
        embedder.clone(),
        catalog.metadata().clone(),
        RetryPolicy::from_config(&config.embedding),
        config.embedding.batch_size,
        config.indexing.embed_queue_depth,
    );
    let (committer, commit_handle) =
        Committer::spawn(catalog.clone(), config.indexing.commit_queue_depth);

    let worker = Arc::new(Worker {
        catalog: catalog.clone(),
        loaders: kb.loaders().clone(),
        params: config.chunking.to_params(),
        embed,
        committer: committer.clone(),
        model: embedder.model_id().to_string(),
        mode: job.mode,
        retry_failed,
        limit,
        processed: AtomicUsize::new(0),
    });

    // Traversal on a blocking thread, streaming into a bounded channel.
    let opts = WalkOptions::from_config(&job.scan)?;
    let (walk_tx, mut walk_rx) = mpsc::channel::<WalkEvent>(config.indexing.workers.max(1) * 4);
    let walk_stop = stop.clone();
    let roots = job.roots.clone();
    let walker = tokio::task::spawn_blocking(move || {
        walk(&roots, &opts, &walk_stop, |event| walk_tx.blocking_send(event).is_ok())
    });

    let tally = Arc::new(Mutex::new(report));
    let semaphore = Arc::new(Semaphore::new(config.indexing.workers.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut denied_dirs: Vec<PathBuf> = Vec::new();
    let discovered = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicU64::new(0));
    let fatal = Arc::new(AtomicBool::new(false));

    while let Some(event) = walk_rx.recv().await {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
            }
        }
        match event {
            WalkEvent::Denied(err) => {
                warn!(path = %err.path.display(), "{}", err.message);
                denied_dirs.push(err.path.clone());
                let mut t = lock(&tally)?;
                t.permission_denied += 1;
                t.record_failure(&err.path, format!("permission denied: {}", err.message));
            }
            WalkEvent::Oversized { path, size } => {
                // Left out of `seen`: an earlier, smaller version goes in the removal pass.
                debug!(path = %path.display(), size, "skipping oversized file");
                lock(&tally)?.oversized += 1;
            }
            WalkEvent::File(file) => {
                if !seen.insert(file.path.clone()) {
                    continue;
                }
                let n = discovered.fetch_add(1, Ordering::Relaxed) + 1;
                lock(&tally)?.discovered += 1;
                if n % 1000 == 0 {
                    progress.report(ScanProgressEvent::Walking {
                        mode: job.mode,
                        files: n,
                    });
                }
                if stop.load(Ordering::Relaxed) || fatal.load(Ordering::Relaxed) {
                    continue;
                }
                if worker.budget_spent() {
                    lock(&tally)?.deferred += 1;
                    continue;
                }

                let permit = semaphore.clone().acquire_owned().await?;
                let worker = worker.clone();
                let tally = tally.clone();
                let progress = progress.clone();
                let discovered = discovered.clone();
                let done = done.clone();
                let fatal = fatal.clone();
                let stop = stop.clone();
                let mode = job.mode;
                let policy = job.scan.on_permission_denied;
                tasks.spawn(async move {
                    let _permit = permit;
                    let path = file.path.clone();
                    let outcome = worker.process(file).await;
                    if let Ok(mut t) = tally.lock() {
                        match outcome {
                            DocOutcome::Skipped => t.skipped += 1,
                            DocOutcome::Deferred => t.deferred += 1,
                            DocOutcome::Indexed { chunks } => {
                                t.indexed += 1;
                                t.chunks_written += chunks;
                            }
                            DocOutcome::IndexedEmpty => t.indexed_empty += 1,
                            DocOutcome::Failed(cause) => {
                                warn!(path = %path.display(), cause = %cause, "failed to index");
                                t.record_failure(&path, cause);
                            }
                            DocOutcome::Denied(cause) => {
                                warn!(path = %path.display(), "{}", cause);
                                t.permission_denied += 1;
                                t.record_failure(&path, cause);
                                if policy == PermissionPolicy::Abort {
                                    fatal.store(true, Ordering::SeqCst);
                                    stop.store(true, Ordering::SeqCst);
                                }
                            }
                            DocOutcome::Fatal(cause) => {
                                warn!(cause = %cause, "stopping scan");
                                fatal.store(true, Ordering::SeqCst);
                                stop.store(true, Ordering::SeqCst);
                                t.record_failure(&path, cause);
                            }
                        }
                    }
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.report(ScanProgressEvent::Processing {
                        mode,
                        done: n,
                        discovered: discovered.load(Ordering::Relaxed),
                    });
                });
            }
        }
    }

    let walked = walker.await.map_err(|e| anyhow!("traversal task failed: {}", e))?;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "worker task failed");
        }
    }

    let outcome = if fatal.load(Ordering::SeqCst) || walked.aborted {
        ScanOutcome::Aborted
    } else if stop.load(Ordering::SeqCst) || walked.stopped {
        ScanOutcome::Interrupted
    } else {
        ScanOutcome::Completed
    };

    let mut removed = 0usize;
    let mut removal_failures = Vec::new();
    if outcome == ScanOutcome::Completed {
        let coverage = job.coverage();
        let candidates: Vec<Document> = catalog
            .metadata()
            .list_documents(None)
            .await?
            .into_iter()
            .filter(|d| d.status != DocumentStatus::Removed)
            .filter(|d| ScanJob::covers(&coverage, &d.path))
            .filter(|d| !seen.contains(&d.path))
            .filter(|d| !denied_dirs.iter().any(|p| d.path.starts_with(p)))
            .collect();
        if !candidates.is_empty() {
            progress.report(ScanProgressEvent::Removing {
                mode: job.mode,
                candidates: candidates.len() as u64,
            });
        }
        for doc in candidates {
            match committer.remove(doc.path.clone()).await {
                Ok(vectors) => {
                    debug!(path = %doc.path.display(), vectors, "removed vanished document");
                    removed += 1;
                }
                Err(e) => removal_failures.push((doc.path, e.to_string())),
            }
        }
    }

    // Close the queues so the dispatcher and committer drain and exit.
    drop(worker);
    drop(committer);
    let _ = embed_handle.await;
    let _ = commit_handle.await;

    let mut report = lock(&tally)?.clone();
    for (path, cause) in removal_failures {
        report.record_failure(&path, cause);
    }
    report.removed = removed;
    report.outcome = outcome;
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    info!(
        job_id = %report.job_id,
        outcome = %report.outcome,
        discovered = report.discovered,
        indexed = report.indexed,
        skipped = report.skipped,
        failed = report.failed,
        removed = report.removed,
        elapsed_ms = report.elapsed_ms,
        "scan finished"
    );
    Ok(report)
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("scan report lock poisoned"))
}
