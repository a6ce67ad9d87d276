//! In-process indexing tests against a real pair of SQLite stores.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use localrag::config::load_config;
use localrag::context::KnowledgeBase;
use localrag::embedding::HashEmbedder;
use localrag::ingest::{run_scan, ScanOptions, ScanOutcome, ScanReport};
use localrag::progress::NoProgress;
use localrag::scan::{ScanJob, ScanRequest};
use localrag_core::embedding::Embedder;
use localrag_core::error::EmbeddingError;
use localrag_core::models::{DocumentStatus, PermissionPolicy, RetrievalFilter, ScanMode};

/// Hash embedder that counts every text it is asked to embed and rejects
/// texts containing `poison`.
struct CountingEmbedder {
    inner: HashEmbedder,
    texts: AtomicUsize,
}

impl CountingEmbedder {
    fn new(model: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedder::new(64, Some(model.to_string())),
            texts: AtomicUsize::new(0),
        })
    }

    fn count(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbeddingError::Rejected("poisoned input".to_string()));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

struct Env {
    _tmp: TempDir,
    config_path: PathBuf,
    docs: PathBuf,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    let docs = root.join("docs");
    fs::create_dir_all(docs.join("nested")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    fs::write(
        docs.join("alpha.md"),
        "# Alpha\n\nThe alpha notes cover the garden irrigation schedule and the tomato beds.",
    )
    .unwrap();
    fs::write(
        docs.join("beta.txt"),
        "Beta is about the apartment lease, the deposit and the renewal date in March.",
    )
    .unwrap();
    fs::write(
        docs.join("nested/gamma.md"),
        "# Gamma\n\nGamma describes the home network: router, mesh nodes and the backup NAS.",
    )
    .unwrap();

    let config = format!(
        r#"[db]
path = "{root}/data/localrag.sqlite"

[embedding]
provider = "hash"
dims = 64
max_attempts = 2
backoff_base_ms = 1
backoff_max_ms = 2

[chunking]
unit = "chars"
window = 400
"#,
        root = root.display()
    );
    let config_path = root.join("localrag.toml");
    fs::write(&config_path, config).unwrap();

    Env {
        _tmp: tmp,
        config_path,
        docs,
    }
}

async fn open(env: &Env, embedder: Arc<CountingEmbedder>) -> KnowledgeBase {
    let cfg = load_config(&env.config_path).unwrap();
    KnowledgeBase::open(cfg).await.unwrap().with_embedder(embedder)
}

fn job(kb: &KnowledgeBase, root: &Path) -> ScanJob {
    let request = ScanRequest {
        mode: Some(ScanMode::Manual),
        root: Some(root.to_path_buf()),
        ..Default::default()
    };
    ScanJob::resolve(&kb.config.scan, &request).unwrap()
}

async fn scan(kb: &KnowledgeBase, root: &Path) -> ScanReport {
    scan_with(kb, root, None, false, Arc::new(AtomicBool::new(false))).await
}

async fn scan_with(
    kb: &KnowledgeBase,
    root: &Path,
    limit: Option<usize>,
    retry_failed: bool,
    stop: Arc<AtomicBool>,
) -> ScanReport {
    let options = ScanOptions {
        job: job(kb, root),
        limit,
        retry_failed,
    };
    run_scan(kb, options, stop, Arc::new(NoProgress))
        .await
        .unwrap()
}

async fn run_job(kb: &KnowledgeBase, job: ScanJob) -> ScanReport {
    let options = ScanOptions {
        job,
        limit: None,
        retry_failed: false,
    };
    run_scan(kb, options, Arc::new(AtomicBool::new(false)), Arc::new(NoProgress))
        .await
        .unwrap()
}

fn job_with_policy(kb: &KnowledgeBase, root: &Path, policy: PermissionPolicy) -> ScanJob {
    let request = ScanRequest {
        mode: Some(ScanMode::Manual),
        root: Some(root.to_path_buf()),
        on_permission_denied: Some(policy),
        ..Default::default()
    };
    ScanJob::resolve(&kb.config.scan, &request).unwrap()
}

async fn retrievable_paths(kb: &KnowledgeBase) -> Vec<PathBuf> {
    kb.catalog()
        .metadata()
        .retrievable_entries(&RetrievalFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect()
}

/// Set `mode` on `path`. Returns false when the path stays readable
/// (running as root), in which case the caller skips.
#[cfg(unix)]
fn lock(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o000)).unwrap();
    let readable = if path.is_dir() {
        fs::read_dir(path).is_ok()
    } else {
        fs::read(path).is_ok()
    };
    if readable {
        unlock(path);
    }
    !readable
}

#[cfg(unix)]
fn unlock(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

async fn assert_consistent(kb: &KnowledgeBase) {
    let report = kb.catalog().verify().await.unwrap();
    assert_eq!(report.committed_chunks, report.live_vectors);
    assert!(report.orphan_vectors.is_empty(), "{:?}", report);
    assert!(report.dangling_chunks.is_empty(), "{:?}", report);
}

async fn status_of(kb: &KnowledgeBase, path: &Path) -> Option<DocumentStatus> {
    kb.catalog()
        .metadata()
        .get_document(path)
        .await
        .unwrap()
        .map(|d| d.status)
}

#[tokio::test]
async fn test_first_scan_indexes_every_document() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;

    let report = scan(&kb, &env.docs).await;
    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.failed, 0);
    assert!(report.chunks_written >= 3);

    for name in ["alpha.md", "beta.txt", "nested/gamma.md"] {
        assert_eq!(
            status_of(&kb, &env.docs.join(name)).await,
            Some(DocumentStatus::Indexed)
        );
    }
    assert_eq!(
        kb.catalog().active_model().await.unwrap().as_deref(),
        Some("test-a")
    );
    assert_consistent(&kb).await;
    kb.close().await;
}

#[tokio::test]
async fn test_rescan_of_unchanged_tree_is_idempotent() {
    let env = setup();
    let embedder = CountingEmbedder::new("test-a");
    let kb = open(&env, embedder.clone()).await;

    let first = scan(&kb, &env.docs).await;
    let embedded = embedder.count();
    let before = kb.catalog().verify().await.unwrap();

    let second = scan(&kb, &env.docs).await;
    assert_eq!(second.indexed, 0);
    assert_eq!(second.skipped, first.indexed);
    assert_eq!(second.removed, 0);
    assert_eq!(second.chunks_written, 0);
    assert_eq!(embedder.count(), embedded, "no re-embedding on rescan");

    let after = kb.catalog().verify().await.unwrap();
    assert_eq!(before.committed_chunks, after.committed_chunks);
    assert_eq!(before.live_vectors, after.live_vectors);
    kb.close().await;
}

#[tokio::test]
async fn test_identical_content_is_embedded_once() {
    let env = setup();
    let body = "Shared checklist: water the plants, pay the electricity bill, call the plumber.";
    fs::write(env.docs.join("copy-one.txt"), body).unwrap();
    fs::write(env.docs.join("copy-two.txt"), body).unwrap();
    fs::write(env.docs.join("nested/copy-three.txt"), body).unwrap();

    let embedder = CountingEmbedder::new("test-a");
    let kb = open(&env, embedder.clone()).await;
    let report = scan(&kb, &env.docs).await;

    assert_eq!(report.indexed, 6);
    // Three distinct documents plus one shared chunk text.
    assert_eq!(embedder.count(), 4);

    // Each path still owns its own committed chunk and vector.
    for name in ["copy-one.txt", "copy-two.txt", "nested/copy-three.txt"] {
        let doc = kb
            .catalog()
            .metadata()
            .get_document(&env.docs.join(name))
            .await
            .unwrap()
            .unwrap();
        let chunks = kb
            .catalog()
            .metadata()
            .chunks_for_document(&doc.id())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
    }
    assert_consistent(&kb).await;
    kb.close().await;
}

#[tokio::test]
async fn test_changed_document_replaces_its_chunks() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    scan(&kb, &env.docs).await;

    let beta = env.docs.join("beta.txt");
    fs::write(
        &beta,
        "Beta now tracks the car insurance renewal and the winter tyre appointment.",
    )
    .unwrap();

    let report = scan(&kb, &env.docs).await;
    assert_eq!(report.indexed, 1);
    assert_eq!(report.skipped, 2);

    let doc = kb
        .catalog()
        .metadata()
        .get_document(&beta)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Indexed);
    let chunks = kb
        .catalog()
        .metadata()
        .chunks_for_document(&doc.id())
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| !c.chunk.text.contains("lease")));
    assert!(chunks.iter().any(|c| c.chunk.text.contains("insurance")));
    assert_consistent(&kb).await;
    kb.close().await;
}

#[tokio::test]
async fn test_deleted_file_is_removed_from_both_stores() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    let first = scan(&kb, &env.docs).await;
    let before = kb.catalog().verify().await.unwrap();

    let gamma = env.docs.join("nested/gamma.md");
    fs::remove_file(&gamma).unwrap();

    let report = scan(&kb, &env.docs).await;
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped, first.indexed - 1);
    assert_eq!(status_of(&kb, &gamma).await, Some(DocumentStatus::Removed));

    let after = kb.catalog().verify().await.unwrap();
    assert!(after.committed_chunks < before.committed_chunks);
    assert_consistent(&kb).await;

    // A file that comes back is indexed again.
    fs::write(&gamma, "# Gamma\n\nGamma is back with new router settings.").unwrap();
    let report = scan(&kb, &env.docs).await;
    assert_eq!(report.indexed, 1);
    assert_eq!(status_of(&kb, &gamma).await, Some(DocumentStatus::Indexed));
    kb.close().await;
}

#[tokio::test]
async fn test_bad_documents_fail_in_isolation() {
    let env = setup();
    // Invalid UTF-8 in a text file, and a document the embedder rejects.
    fs::write(env.docs.join("broken.txt"), [0xff, 0xfe, 0x00, 0xc3, 0x28]).unwrap();
    fs::write(
        env.docs.join("rejected.md"),
        "# Rejected\n\nThis page contains the word poison and will be refused.",
    )
    .unwrap();

    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    let report = scan(&kb, &env.docs).await;

    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(
        status_of(&kb, &env.docs.join("broken.txt")).await,
        Some(DocumentStatus::Failed)
    );
    assert_eq!(
        status_of(&kb, &env.docs.join("rejected.md")).await,
        Some(DocumentStatus::Failed)
    );
    assert_consistent(&kb).await;

    // Unchanged failures stay on the fast path until explicitly retried.
    let again = scan(&kb, &env.docs).await;
    assert_eq!(again.failed, 0);
    assert_eq!(again.skipped, 5);

    let retried = scan_with(
        &kb,
        &env.docs,
        None,
        true,
        Arc::new(AtomicBool::new(false)),
    )
    .await;
    assert_eq!(retried.failed, 2);
    assert_eq!(retried.skipped, 3);
    kb.close().await;
}

#[tokio::test]
async fn test_empty_document_is_indexed_empty() {
    let env = setup();
    fs::write(env.docs.join("blank.txt"), "   \n\n  \t\n").unwrap();

    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    let report = scan(&kb, &env.docs).await;
    assert_eq!(report.indexed_empty, 1);
    assert_eq!(
        status_of(&kb, &env.docs.join("blank.txt")).await,
        Some(DocumentStatus::IndexedEmpty)
    );

    let again = scan(&kb, &env.docs).await;
    assert_eq!(again.indexed_empty, 0);
    assert_eq!(again.skipped, 4);
    kb.close().await;
}

#[tokio::test]
async fn test_interrupted_scan_skips_removal() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    scan(&kb, &env.docs).await;

    let alpha = env.docs.join("alpha.md");
    fs::remove_file(&alpha).unwrap();

    let stop = Arc::new(AtomicBool::new(true));
    let report = scan_with(&kb, &env.docs, None, false, stop).await;
    assert_eq!(report.outcome, ScanOutcome::Interrupted);
    assert_eq!(report.removed, 0);
    assert_eq!(report.indexed, 0);
    assert_eq!(status_of(&kb, &alpha).await, Some(DocumentStatus::Indexed));
    assert_consistent(&kb).await;
    kb.close().await;
}

#[tokio::test]
async fn test_limit_defers_the_rest_to_later_runs() {
    let env = setup();
    fs::write(env.docs.join("delta.txt"), "Delta lists the bookshelf inventory.").unwrap();
    fs::write(env.docs.join("epsilon.txt"), "Epsilon holds recipes for sourdough.").unwrap();

    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    let stop = || Arc::new(AtomicBool::new(false));

    let first = scan_with(&kb, &env.docs, Some(2), false, stop()).await;
    assert_eq!(first.discovered, 5);
    assert_eq!(first.indexed, 2);
    assert_eq!(first.deferred, 3);
    assert_eq!(first.removed, 0);

    let second = scan_with(&kb, &env.docs, Some(2), false, stop()).await;
    assert_eq!(second.indexed, 2);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.deferred, 1);

    let third = scan(&kb, &env.docs).await;
    assert_eq!(third.indexed, 1);
    assert_eq!(third.skipped, 4);
    assert_consistent(&kb).await;
    kb.close().await;
}

#[tokio::test]
async fn test_model_change_reembeds_everything() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    let first = scan(&kb, &env.docs).await;
    kb.close().await;

    let embedder = CountingEmbedder::new("test-b");
    let kb = open(&env, embedder.clone()).await;
    let report = scan(&kb, &env.docs).await;

    assert_eq!(report.indexed, first.indexed);
    assert_eq!(report.skipped, 0);
    assert!(embedder.count() >= first.indexed);
    assert_eq!(
        kb.catalog().active_model().await.unwrap().as_deref(),
        Some("test-b")
    );

    let counts = kb.catalog().metadata().counts().await.unwrap();
    assert!(counts.retired_embeddings > 0);
    assert_consistent(&kb).await;
    kb.close().await;
}

#[tokio::test]
async fn test_scan_outside_root_keeps_other_documents() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    scan(&kb, &env.docs).await;

    // Scanning only the nested folder must not remove documents above it.
    let report = scan(&kb, &env.docs.join("nested")).await;
    assert_eq!(report.discovered, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(
        status_of(&kb, &env.docs.join("alpha.md")).await,
        Some(DocumentStatus::Indexed)
    );
    kb.close().await;
}

#[tokio::test]
async fn test_document_grown_past_size_limit_leaves_the_index() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    scan(&kb, &env.docs).await;
    let beta = env.docs.join("beta.txt");
    assert!(retrievable_paths(&kb).await.contains(&beta));

    fs::write(&beta, "lease ".repeat(200)).unwrap();
    let mut job = job(&kb, &env.docs);
    job.scan.max_file_bytes = 500;
    let report = run_job(&kb, job).await;

    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.oversized, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(status_of(&kb, &beta).await, Some(DocumentStatus::Removed));
    assert!(!retrievable_paths(&kb).await.contains(&beta));
    assert_consistent(&kb).await;
    kb.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_denied_directory_is_skipped_and_keeps_its_documents() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    scan(&kb, &env.docs).await;

    let nested = env.docs.join("nested");
    if !lock(&nested) {
        kb.close().await;
        return;
    }
    let report = run_job(&kb, job_with_policy(&kb, &env.docs, PermissionPolicy::Skip)).await;
    unlock(&nested);

    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.permission_denied, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.removed, 0);
    assert_eq!(
        status_of(&kb, &nested.join("gamma.md")).await,
        Some(DocumentStatus::Indexed)
    );
    assert_consistent(&kb).await;
    kb.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_abort_policy_stops_before_the_removal_pass() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;
    scan(&kb, &env.docs).await;

    let alpha = env.docs.join("alpha.md");
    fs::remove_file(&alpha).unwrap();
    let nested = env.docs.join("nested");
    if !lock(&nested) {
        kb.close().await;
        return;
    }
    let report = run_job(&kb, job_with_policy(&kb, &env.docs, PermissionPolicy::Abort)).await;
    unlock(&nested);

    assert_eq!(report.outcome, ScanOutcome::Aborted);
    assert_eq!(report.permission_denied, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(status_of(&kb, &alpha).await, Some(DocumentStatus::Indexed));
    assert_consistent(&kb).await;
    kb.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_unreadable_file_is_a_permission_denial() {
    let env = setup();
    let kb = open(&env, CountingEmbedder::new("test-a")).await;

    let beta = env.docs.join("beta.txt");
    if !lock(&beta) {
        kb.close().await;
        return;
    }
    let skipped = run_job(&kb, job_with_policy(&kb, &env.docs, PermissionPolicy::Skip)).await;

    // With alpha gone, an aborted run must not remove it.
    let alpha = env.docs.join("alpha.md");
    fs::remove_file(&alpha).unwrap();
    let aborted = run_job(&kb, job_with_policy(&kb, &env.docs, PermissionPolicy::Abort)).await;
    unlock(&beta);

    assert_eq!(skipped.outcome, ScanOutcome::Completed);
    assert_eq!(skipped.permission_denied, 1);
    assert_eq!(skipped.indexed, 2);
    assert_eq!(skipped.failures.len(), 1);
    assert_eq!(skipped.failures[0].path, beta);
    assert_eq!(status_of(&kb, &beta).await, None);

    assert_eq!(aborted.outcome, ScanOutcome::Aborted);
    assert_eq!(aborted.permission_denied, 1);
    assert_eq!(aborted.removed, 0);
    assert_eq!(status_of(&kb, &alpha).await, Some(DocumentStatus::Indexed));
    assert_consistent(&kb).await;
    kb.close().await;
}
