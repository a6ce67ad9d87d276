//! # localrag
//!
//! An offline personal knowledge base. localrag walks a folder, a home
//! directory or the whole filesystem, turns supported documents into
//! embedded chunks, and answers questions grounded in those chunks with
//! citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  Walk/Scan  │──▶│ Load+Chunk+Embed │──▶│ Metadata  Vector │
//! │ manual/home │   │  worker pool     │   │  SQLite   SQLite │
//! │ system/cust │   │  embed queue     │   └────────┬─────────┘
//! └─────────────┘   │  committer       │            │
//!                   └──────────────────┘            ▼
//!                                           ┌──────────────┐
//!                                           │ Query + Gen  │
//!                                           │   (lrag)     │
//!                                           └──────────────┘
//! ```
//!
//! The domain core (lifecycle, chunking, dual-store catalog, retrieval and
//! query orchestration) lives in the `localrag-core` crate. This crate adds
//! the SQLite stores, loaders, embedding providers, the indexing pipeline
//! and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! lrag init                            # create both stores
//! lrag scan --mode manual --root ~/notes
//! lrag query "when is the lease up?"
//! lrag stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite pools |
//! | [`migrate`] | Schema for both stores |
//! | [`sqlite_store`] | Durable metadata store |
//! | [`vector_index`] | Durable vector index |
//! | [`loader`] | Format registry and text extraction |
//! | [`embedding`] | Embedding providers |
//! | [`embed_queue`] | Cached, batched, retrying embedding dispatcher |
//! | [`walk`] | Breadth-first traversal |
//! | [`scan`] | Scan-job resolution and dry runs |
//! | [`ingest`] | Indexing orchestrator |
//! | [`generate`] | Answer generation adapters |
//! | [`license`] | Key-file license gate |
//! | [`context`] | The [`context::KnowledgeBase`] handle |
//! | [`progress`] | Scan progress reporting |
//! | [`stats`] | Index statistics |
//! | [`get`] | Document lookup |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod context;
pub mod db;
pub mod embed_queue;
pub mod embedding;
pub mod generate;
pub mod get;
pub mod ingest;
pub mod license;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod scan;
pub mod sqlite_store;
pub mod stats;
pub mod vector_index;
pub mod walk;
