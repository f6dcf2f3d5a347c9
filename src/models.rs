//! Core data types flowing through the ingestion pipeline.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Serialize;

/// Best-effort summary of one archive ingestion run.
///
/// Partial failures never abort a run; each one is described by a note and
/// the counters reflect what actually landed in the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub archive_name: String,
    pub extraction_id: String,
    pub notes: Vec<String>,
    pub messages_ingested: u64,
    pub contacts_ingested: u64,
    pub system_records_ingested: u64,
    pub images_logged: u64,
    pub images_captioned: u64,
}

/// A piece of text queued for the batched embedding pass, produced by the
/// message and image pipelines and consumed once by the indexer.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub vector_id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

/// An image row eligible for captioning: either newly inserted or reset to
/// pending on rediscovery.
#[derive(Debug, Clone)]
pub struct ImageInventoryRecord {
    pub id: i64,
    pub file_path: PathBuf,
    pub relative_path: PathBuf,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Run-scoped graph registration tally. The seen-sets prevent the same
/// canonical identity or message from being counted twice within one run;
/// across runs the graph writes themselves are merges.
#[derive(Debug, Default)]
pub struct GraphStats {
    pub contacts_registered: u64,
    pub relationships_registered: u64,
    pub seen_contact_identifiers: HashSet<String>,
    pub seen_message_ids: HashSet<String>,
}
