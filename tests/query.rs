//! Query-path tests: retrieval over a scanned corpus, filters, the empty
//! index short circuit, input validation and reads during indexing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use localrag::config::load_config;
use localrag::context::KnowledgeBase;
use localrag::generate::ExtractiveGenerator;
use localrag::ingest::{run_scan, ScanOptions, ScanOutcome};
use localrag::progress::NoProgress;
use localrag::scan::{ScanJob, ScanRequest};
use localrag_core::error::{LicenseDenied, QueryError};
use localrag_core::models::{ChunkStatus, RetrievalFilter, ScanMode};
use localrag_core::query::{QueryOrchestrator, QueryRequest, NO_RELEVANT_INFORMATION};

fn write_config(root: &Path, extra: &str) -> PathBuf {
    let config = format!(
        r#"[db]
path = "{root}/data/localrag.sqlite"

[embedding]
provider = "hash"
dims = 128

[chunking]
unit = "chars"
window = 300

[retrieval]
top_k = 5
{extra}
"#,
        root = root.display(),
        extra = extra
    );
    let path = root.join("localrag.toml");
    fs::write(&path, config).unwrap();
    path
}

fn write_corpus(docs: &Path) {
    fs::create_dir_all(docs.join("work")).unwrap();
    fs::create_dir_all(docs.join("home")).unwrap();
    fs::write(
        docs.join("home/lease.txt"),
        "The apartment lease runs until March. The deposit is refundable and renewal needs two months notice.",
    )
    .unwrap();
    fs::write(
        docs.join("home/garden.md"),
        "# Garden\n\nTomatoes need daily watering in July. The irrigation timer is set for six in the morning.",
    )
    .unwrap();
    fs::write(
        docs.join("work/roadmap.md"),
        "# Roadmap\n\nThe billing service migration ships in the third quarter after the database upgrade.",
    )
    .unwrap();
    fs::write(
        docs.join("work/oncall.txt"),
        "On call rotation: pager alerts go to the primary first, then escalate to the secondary after ten minutes.",
    )
    .unwrap();
}

async fn open(config_path: &Path) -> KnowledgeBase {
    KnowledgeBase::open(load_config(config_path).unwrap())
        .await
        .unwrap()
}

async fn scan(kb: &KnowledgeBase, root: &Path) {
    let request = ScanRequest {
        mode: Some(ScanMode::Manual),
        root: Some(root.to_path_buf()),
        ..Default::default()
    };
    let options = ScanOptions {
        job: ScanJob::resolve(&kb.config.scan, &request).unwrap(),
        limit: None,
        retry_failed: false,
    };
    let report = run_scan(
        kb,
        options,
        Arc::new(AtomicBool::new(false)),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();
    assert_eq!(report.outcome, ScanOutcome::Completed);
}

fn orchestrator(kb: &KnowledgeBase) -> QueryOrchestrator {
    kb.query_orchestrator(Arc::new(ExtractiveGenerator::default()))
}

struct Env {
    _tmp: TempDir,
    docs: PathBuf,
    kb: KnowledgeBase,
}

async fn indexed_env() -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    let docs = root.join("docs");
    write_corpus(&docs);
    let kb = open(&write_config(&root, "")).await;
    scan(&kb, &docs).await;
    Env {
        _tmp: tmp,
        docs,
        kb,
    }
}

#[tokio::test]
async fn test_empty_index_answers_without_generation() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    let kb = open(&write_config(&root, "")).await;

    let answer = orchestrator(&kb)
        .answer(&QueryRequest::new("where is the lease?"))
        .await
        .unwrap();
    assert_eq!(answer.answer, NO_RELEVANT_INFORMATION);
    assert!(answer.citations.is_empty());
    assert!(!answer.generated);
    kb.close().await;
}

#[tokio::test]
async fn test_answer_cites_the_relevant_document() {
    let env = indexed_env().await;
    let answer = orchestrator(&env.kb)
        .answer(&QueryRequest::new("lease deposit renewal"))
        .await
        .unwrap();

    assert!(answer.generated);
    assert!(!answer.citations.is_empty());
    assert_eq!(answer.citations[0].path, env.docs.join("home/lease.txt"));
    assert!(answer.answer.contains("[lease.txt]"));
    assert!(answer.answer.contains("deposit"));
    assert!(answer.citations[0].snippet.chars().count() <= 200);
    env.kb.close().await;
}

#[tokio::test]
async fn test_search_is_deterministic_and_ranked() {
    let env = indexed_env().await;
    let orch = orchestrator(&env.kb);
    let request = QueryRequest {
        k: Some(4),
        ..QueryRequest::new("irrigation timer watering")
    };

    let first = orch.search(&request).await.unwrap();
    let second = orch.search(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
    for (i, r) in first.iter().enumerate() {
        assert_eq!(r.rank, i + 1);
    }
    assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(first[0].citation.path, env.docs.join("home/garden.md"));
    assert_eq!(first[0].citation.title.as_deref(), Some("Garden"));
    env.kb.close().await;
}

#[tokio::test]
async fn test_filters_apply_before_ranking() {
    let env = indexed_env().await;
    let orch = orchestrator(&env.kb);
    let work = env.docs.join("work");

    // The best match overall lives under home/, so the filter must exclude it.
    let request = QueryRequest {
        filter: RetrievalFilter {
            path_prefix: Some(work.clone()),
            modified_since: None,
        },
        ..QueryRequest::new("lease deposit renewal")
    };
    let results = orch.search(&request).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.citation.path.starts_with(&work)));

    let far_future = chrono::Utc::now().timestamp() + 365 * 24 * 3600;
    let request = QueryRequest {
        filter: RetrievalFilter {
            path_prefix: None,
            modified_since: Some(far_future),
        },
        ..QueryRequest::new("lease deposit renewal")
    };
    let answer = orch.answer(&request).await.unwrap();
    assert!(!answer.generated);
    assert_eq!(answer.answer, NO_RELEVANT_INFORMATION);
    env.kb.close().await;
}

#[tokio::test]
async fn test_invalid_queries_are_rejected() {
    let env = indexed_env().await;
    let orch = orchestrator(&env.kb);

    let err = orch.search(&QueryRequest::new("   ")).await.unwrap_err();
    assert_eq!(err.downcast_ref::<QueryError>(), Some(&QueryError::Empty));

    for k in [0, 101] {
        let request = QueryRequest {
            k: Some(k),
            ..QueryRequest::new("lease")
        };
        let err = orch.search(&request).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::InvalidLimit { .. })
        ));
    }

    let request = QueryRequest {
        filter: RetrievalFilter {
            path_prefix: Some(PathBuf::from("relative/dir")),
            modified_since: None,
        },
        ..QueryRequest::new("lease")
    };
    let err = orch.search(&request).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<QueryError>(),
        Some(QueryError::InvalidFilter(_))
    ));
    env.kb.close().await;
}

#[tokio::test]
async fn test_license_gate_blocks_scan_and_query() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    let docs = root.join("docs");
    write_corpus(&docs);
    let key = root.join("license.key");
    let config_path = write_config(
        &root,
        &format!("\n[license]\nkey_file = \"{}\"\n", key.display()),
    );
    let kb = open(&config_path).await;

    let request = ScanRequest {
        mode: Some(ScanMode::Manual),
        root: Some(docs.clone()),
        ..Default::default()
    };
    let options = ScanOptions {
        job: ScanJob::resolve(&kb.config.scan, &request).unwrap(),
        limit: None,
        retry_failed: false,
    };
    let err = run_scan(
        &kb,
        options,
        Arc::new(AtomicBool::new(false)),
        Arc::new(NoProgress),
    )
    .await
    .unwrap_err();
    assert!(err.downcast_ref::<LicenseDenied>().is_some());

    let err = orchestrator(&kb)
        .search(&QueryRequest::new("lease"))
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<LicenseDenied>().is_some());

    // Installing a key takes effect immediately.
    fs::write(&key, "LRAG-1234-5678\n").unwrap();
    scan(&kb, &docs).await;
    assert!(!orchestrator(&kb)
        .search(&QueryRequest::new("lease"))
        .await
        .unwrap()
        .is_empty());
    kb.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_during_indexing_see_only_committed_chunks() {
    let env = indexed_env().await;
    let bulk = env.docs.join("bulk");
    fs::create_dir_all(&bulk).unwrap();
    for i in 0..60 {
        fs::write(
            bulk.join(format!("note-{:03}.txt", i)),
            format!(
                "Note {} about the lease, the garden and the roadmap. Entry number {} of the bulk import.",
                i, i
            ),
        )
        .unwrap();
    }

    let orch = orchestrator(&env.kb);
    let done = AtomicBool::new(false);
    let queries = AtomicUsize::new(0);

    let indexing = async {
        scan(&env.kb, &env.docs).await;
        done.store(true, Ordering::SeqCst);
    };
    let reading = async {
        loop {
            let finished = done.load(Ordering::SeqCst);
            let results = orch
                .search(&QueryRequest {
                    k: Some(20),
                    ..QueryRequest::new("lease garden roadmap bulk import")
                })
                .await
                .unwrap();
            for r in &results {
                let record = env
                    .kb
                    .catalog()
                    .metadata()
                    .get_chunk(&r.chunk_id)
                    .await
                    .unwrap();
                // A chunk may be deleted after the query, never returned while pending.
                if let Some(record) = record {
                    assert_eq!(record.status, ChunkStatus::Committed);
                }
            }
            queries.fetch_add(1, Ordering::SeqCst);
            if finished {
                break;
            }
            tokio::task::yield_now().await;
        }
    };
    tokio::join!(indexing, reading);

    assert!(queries.load(Ordering::SeqCst) >= 1);
    let report = env.kb.catalog().verify().await.unwrap();
    assert_eq!(report.committed_chunks, report.live_vectors);
    assert!(report.orphan_vectors.is_empty());
    assert!(report.dangling_chunks.is_empty());

    let results = orch
        .search(&QueryRequest {
            k: Some(100),
            filter: RetrievalFilter {
                path_prefix: Some(bulk.clone()),
                modified_since: None,
            },
            ..QueryRequest::new("bulk import entry")
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 60);
    env.kb.close().await;
}
