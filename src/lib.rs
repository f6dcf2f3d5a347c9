//! # casetrace
//!
//! Ingestion and synchronization pipeline for UFDR mobile-forensic
//! extraction archives.
//!
//! A UFDR archive is a zip bundle of arbitrary-schema SQLite databases,
//! contact markup, property lists, and media. casetrace unpacks each
//! archive into an isolated workspace, classifies its members
//! heuristically, and keeps three independently-failing stores eventually
//! consistent:
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌───────────────────┐
//! │ UFDR archive │──▶│  classify +   │──▶│ SQLite ledger      │
//! │ (zip bundle) │   │  normalize    │   ├───────────────────┤
//! └──────────────┘   └──────┬────────┘   │ vector index       │
//!                           │            ├───────────────────┤
//!                           └───────────▶│ person graph       │
//!                                        └───────────────────┘
//! ```
//!
//! Re-ingesting the same or overlapping archives is safe by construction:
//! messages dedup on vector id, images merge by file path, and graph writes
//! are merges. Per-source and per-record failures are isolated into summary
//! notes; only archive-level failures surface to the caller.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`archive`] | Archive persistence and extraction |
//! | [`classify`] | File and table classification heuristics |
//! | [`normalize`] | Identifier, name, and timestamp normalization |
//! | [`source_db`] | Read-only access to source databases |
//! | [`ledger`] | Idempotent relational persistence |
//! | [`graph`] / [`graph_sync`] | Person graph collaborators and sync |
//! | [`vector_store`] / [`embedding`] | Vector index and text encoding |
//! | [`llm`] / [`caption`] | Vision captioning and answer generation |
//! | [`ingest`] | Per-archive orchestration |

pub mod archive;
pub mod caption;
pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod graph;
pub mod graph_sync;
pub mod ingest;
pub mod ledger;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod source_db;
pub mod vector_store;
