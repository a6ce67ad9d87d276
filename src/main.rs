//! # localrag CLI (`lrag`)
//!
//! The `lrag` binary is the user-facing shell over the knowledge base. It
//! provides commands for store initialization, scanning, querying, document
//! inspection, statistics and index repair.
//!
//! ## Usage
//!
//! ```bash
//! lrag --config ./config/localrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lrag init` | Create both SQLite stores and run schema migrations |
//! | `lrag scan` | Index documents (manual, home, system or custom mode) |
//! | `lrag query "<question>"` | Answer a question with citations |
//! | `lrag search "<query>"` | Ranked citations without generation |
//! | `lrag get <path>` | Show a document's status and chunks |
//! | `lrag stats` | Status counts, store sizes and consistency |
//! | `lrag reconcile` | Reconcile the stores; `--repair` clears corruption |
//!
//! ## Examples
//!
//! ```bash
//! # Index a notes folder
//! lrag scan --mode manual --root ~/notes
//!
//! # See what a home scan would pick up, without indexing
//! lrag scan --mode home --dry-run
//!
//! # Ask a question, restricted to recent work documents
//! lrag query "what did we decide about the lease?" --path-prefix ~/work --since 2024-01-01
//! ```
//!
//! Diagnostics go to stderr; command results go to stdout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::warn;

use localrag::config;
use localrag::context::KnowledgeBase;
use localrag::generate::create_generator;
use localrag::ingest::{run_scan, ScanOptions};
use localrag::loader::LoaderRegistry;
use localrag::logging::{self, Verbosity};
use localrag::progress::ProgressMode;
use localrag::scan::{dry_run, DryRunSummary, ScanJob, ScanRequest};
use localrag::{get, migrate, stats};
use localrag_core::error::{IndexWriteError, LicenseDenied, QueryError};
use localrag_core::models::{PermissionPolicy, RetrievalFilter, RetrievalResult, ScanMode};
use localrag_core::query::{Answer, QueryRequest};

/// localrag CLI: an offline personal knowledge base.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/localrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lrag",
    about = "localrag: an offline personal knowledge base",
    version,
    long_about = "localrag indexes documents from a folder, your home directory or the whole \
    filesystem into a local vector index, and answers questions grounded in them with citations. \
    Nothing leaves the machine."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/localrag.toml`.
    #[arg(long, global = true, default_value = "./config/localrag.toml")]
    config: PathBuf,

    /// Verbose diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print errors on stderr.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize both stores.
    ///
    /// Creates the metadata database and the vector database beside it,
    /// then runs schema migrations. Idempotent.
    Init,

    /// Index documents.
    ///
    /// Walks the roots of the chosen mode, loads and chunks every new or
    /// changed document, embeds the chunks and commits them. Documents that
    /// disappeared since the last completed scan are removed. Press Ctrl-C
    /// to stop after in-flight documents commit.
    Scan {
        /// Scan mode: `manual`, `home`, `system`, or `custom`. Defaults to `[scan] mode`.
        #[arg(long)]
        mode: Option<ScanMode>,

        /// Root folder. Overrides the mode's default roots.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Include glob (repeatable). Replaces `[scan] include_globs`.
        #[arg(long = "include")]
        include: Vec<String>,

        /// Exclude glob (repeatable). Replaces `[scan] exclude_globs`.
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// What to do on a permission denial: `skip` or `abort`.
        #[arg(long)]
        on_permission_denied: Option<PermissionPolicy>,

        /// Traverse only and print what would be indexed.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of documents to (re)process in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Reprocess failed documents even if unchanged.
        #[arg(long)]
        retry_failed: bool,

        /// Progress on stderr: `off`, `human`, or `json`. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<ProgressMode>,

        /// Print the scan report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the indexed documents.
    Query {
        /// The question.
        question: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Return ranked citations without generating an answer.
    Search {
        /// The search query.
        query: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Show a document's lifecycle status and chunks.
    Get {
        /// Path of the document.
        path: PathBuf,

        /// Print chunk text as well.
        #[arg(long)]
        chunks: bool,
    },

    /// Show index statistics and the consistency check.
    Stats,

    /// Reconcile the metadata store with the vector index.
    ///
    /// Purges pending chunks past the grace period, resets stuck
    /// documents and removes orphan vectors. With `--repair`, also clears
    /// detected corruption so writes are accepted again.
    Reconcile {
        /// Remove chunks of corrupted documents and mark them stale.
        #[arg(long)]
        repair: bool,
    },
}

/// Retrieval arguments shared by `query` and `search`.
#[derive(clap::Args)]
struct FilterArgs {
    /// Number of results (1 to 100). Defaults to `[retrieval] top_k`.
    #[arg(short = 'k', long)]
    k: Option<usize>,

    /// Only documents under this path.
    #[arg(long)]
    path_prefix: Option<PathBuf>,

    /// Only documents modified on or after this date (YYYY-MM-DD).
    #[arg(long)]
    since: Option<String>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,
}

impl FilterArgs {
    fn to_request(&self, question: &str) -> Result<QueryRequest> {
        let modified_since = match &self.since {
            Some(s) => {
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
                    QueryError::InvalidFilter(format!("--since '{}' is not a YYYY-MM-DD date", s))
                })?;
                date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp())
            }
            None => None,
        };
        let path_prefix = self
            .path_prefix
            .as_ref()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()));

        Ok(QueryRequest {
            question: question.to_string(),
            k: self.k,
            filter: RetrievalFilter {
                path_prefix,
                modified_since,
            },
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {}", user_message(&err));
        std::process::exit(1);
    }
}

/// Typed domain errors print as their own message; everything else with its context chain.
fn user_message(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<LicenseDenied>() {
        return e.to_string();
    }
    if let Some(e) = err.downcast_ref::<QueryError>() {
        return e.to_string();
    }
    if let Some(IndexWriteError::RepairRequired) = err.downcast_ref::<IndexWriteError>() {
        return "index needs repair; run `lrag reconcile --repair`".to_string();
    }
    format!("{:#}", err)
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_config(&cli.config)?;
    logging::init(
        Verbosity::from_flags(cli.verbose, cli.quiet),
        &cfg.logging.level,
    );

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
            println!("  metadata: {}", cfg.db.path.display());
            println!("  vectors:  {}", cfg.db.vector_path().display());
        }
        Commands::Scan {
            mode,
            root,
            include,
            exclude,
            on_permission_denied,
            dry_run: dry,
            limit,
            retry_failed,
            progress,
            json,
        } => {
            let request = ScanRequest {
                mode,
                root,
                include_globs: (!include.is_empty()).then_some(include),
                exclude_globs: (!exclude.is_empty()).then_some(exclude),
                on_permission_denied,
            };
            let job = ScanJob::resolve(&cfg.scan, &request)?;
            let stop = install_stop_signal();

            if dry {
                let (job, summary) = tokio::task::spawn_blocking(move || {
                    dry_run(&job, &LoaderRegistry::with_defaults(), &stop).map(|s| (job, s))
                })
                .await
                .context("dry run task panicked")??;
                print_dry_run(&job, &summary, json)?;
                return Ok(());
            }

            let kb = KnowledgeBase::open(cfg).await?;
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            let result = run_scan(
                &kb,
                ScanOptions {
                    job,
                    limit,
                    retry_failed,
                },
                stop,
                reporter,
            )
            .await;
            kb.close().await;

            let report = result?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
        }
        Commands::Query { question, filter } => {
            let request = filter.to_request(&question)?;
            let generator = create_generator(&cfg.generation)?;
            let kb = KnowledgeBase::open(cfg).await?;
            let result = kb.query_orchestrator(generator).answer(&request).await;
            kb.close().await;
            print_answer(&result?, filter.json)?;
        }
        Commands::Search { query, filter } => {
            let request = filter.to_request(&query)?;
            let generator = create_generator(&cfg.generation)?;
            let kb = KnowledgeBase::open(cfg).await?;
            let result = kb.query_orchestrator(generator).search(&request).await;
            kb.close().await;
            print_results(&result?, filter.json)?;
        }
        Commands::Get { path, chunks } => {
            let kb = KnowledgeBase::open(cfg).await?;
            let result = get::run_get(&kb, &path, chunks).await;
            kb.close().await;
            result?;
        }
        Commands::Stats => {
            let kb = KnowledgeBase::open(cfg).await?;
            let result = stats::run_stats(&kb).await;
            kb.close().await;
            result?;
        }
        Commands::Reconcile { repair } => {
            let kb = KnowledgeBase::open(cfg).await?;
            let result = reconcile(&kb, repair).await;
            kb.close().await;
            result?;
        }
    }

    Ok(())
}

/// Raise the stop flag on the first Ctrl-C.
fn install_stop_signal() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight documents");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

async fn reconcile(kb: &KnowledgeBase, repair: bool) -> Result<()> {
    let report = kb.reconcile().await?;
    println!("reconcile");
    println!("  purged pending chunks: {}", report.purged_pending);
    println!("  reset stuck documents: {}", report.reset_documents);
    println!("  removed orphan vectors: {}", report.removed_orphan_vectors);
    println!("  dangling chunks: {}", report.dangling_chunks);

    if repair {
        let repaired = kb.catalog().repair(chrono::Utc::now().timestamp()).await?;
        println!("repair");
        println!("  documents reset: {}", repaired.documents_reset);
        println!("  vectors removed: {}", repaired.vectors_removed);
    } else if report.needs_repair {
        println!("  index needs repair; rerun with --repair");
    }
    Ok(())
}

fn print_dry_run(job: &ScanJob, summary: &DryRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("dry run: scan {}", job.mode);
    for root in &job.roots {
        println!("  root: {}", root.display());
    }
    println!("  directories scanned: {}", summary.directories);
    println!(
        "  files: {} ({})",
        summary.files,
        stats::format_bytes(summary.total_bytes)
    );
    for (format, n) in &summary.by_format {
        println!("    {:<12} {:>8}", format, n);
    }
    if summary.oversized > 0 {
        println!("  oversized (skipped): {}", summary.oversized);
    }
    println!("  permission errors: {}", summary.permission_errors.len());
    for err in &summary.permission_errors {
        println!("    {}", err);
    }
    Ok(())
}

fn print_answer(answer: &Answer, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(answer)?);
        return Ok(());
    }
    println!("{}", answer.answer.trim());
    if !answer.citations.is_empty() {
        println!();
        println!("Sources:");
        for (i, c) in answer.citations.iter().enumerate() {
            println!(
                "  [{}] {} ({}..{}, score {:.2})",
                i + 1,
                display_label(&c.path, c.title.as_deref()),
                c.start,
                c.end,
                c.score
            );
        }
    }
    Ok(())
}

fn print_results(results: &[RetrievalResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for result in results {
        let c = &result.citation;
        println!(
            "{}. [{:.2}] {}",
            result.rank,
            result.score,
            display_label(&c.path, c.title.as_deref())
        );
        println!("    path: {}", c.path.display());
        println!("    chars: {}..{}", c.start, c.end);
        println!("    excerpt: \"{}\"", c.snippet.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

fn display_label(path: &Path, title: Option<&str>) -> String {
    match title {
        Some(t) => t.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
    }
}
