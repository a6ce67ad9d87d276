//! # localrag core
//!
//! Runtime-free logic for localrag: data models, the error taxonomy, the
//! deterministic chunker, the embedder interface, the paired store traits
//! and the consistency protocol that binds them, retrieval, and query
//! orchestration.
//!
//! This crate contains no tokio runtime, sqlx, or filesystem I/O. The
//! `localrag` application crate supplies durable stores, loaders, embedding
//! providers and the indexing pipeline.
//!
//! | Module | Role |
//! |--------|------|
//! | [`models`] | Documents, chunks, lifecycle states, citations |
//! | [`error`] | Typed failures, one per taxonomy entry |
//! | [`chunk`] | Sliding-window chunker |
//! | [`embedding`] | [`embedding::Embedder`] trait and vector helpers |
//! | [`store`] | [`store::MetadataStore`] and [`store::VectorIndex`] |
//! | [`catalog`] | Write, delete, reconcile and repair protocols |
//! | [`retrieve`] | Filtered, tie-broken nearest-neighbor retrieval |
//! | [`query`] | Context assembly and the generation hand-off |
//! | [`license`] | Pass/fail license gate |

pub mod catalog;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod hash;
pub mod license;
pub mod models;
pub mod query;
pub mod retrieve;
pub mod store;
