//! Ingestion orchestration for one UFDR archive.
//!
//! The run is strictly sequential: unpack, classify, then contacts (so the
//! alias map is seeded), messages, system properties, images, captions, and
//! finally one batched embedding pass. Every source file and record is
//! isolated — a parse or
//! collaborator failure becomes a note on the summary and the run keeps
//! going. Only archive-level failures (corrupt zip, full disk) reach the
//! caller.
//!
//! All run-scoped state — the alias map, the registration stats, the
//! embedding batch — lives inside [`run_ingest`]; nothing is shared across
//! runs through process globals.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::archive::{extract_archive, persist_archive};
use crate::caption::describe_and_index_images;
use crate::classify::{classify_columns, discover_sources, TableKind};
use crate::config::Config;
use crate::embedding::TextEncoder;
use crate::graph::GraphStore;
use crate::graph_sync::{ContactIdentity, GraphSync, MessageIdentity};
use crate::ledger;
use crate::llm::VisionClient;
use crate::models::{EmbeddingRecord, IngestionSummary};
use crate::source_db;
use crate::vector_store::VectorIndex;

/// The collaborators one ingestion run writes through. Constructed at
/// startup and injected; never process-global singletons.
pub struct IngestDeps {
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub encoder: Arc<dyn TextEncoder>,
    pub vision: Arc<dyn VisionClient>,
}

/// Ingest one archive end to end and return a best-effort summary.
pub async fn run_ingest(
    pool: &SqlitePool,
    deps: &IngestDeps,
    config: &Config,
    archive_bytes: &[u8],
    archive_name: &str,
) -> Result<IngestionSummary> {
    let (archive_path, extraction_dir) =
        persist_archive(&config.storage, archive_bytes, archive_name)?;
    extract_archive(&archive_path, &extraction_dir)?;

    let sources = discover_sources(&extraction_dir).context("failed to walk extraction dir")?;
    info!(
        archive = archive_name,
        message_dbs = sources.message_dbs.len(),
        contact_dbs = sources.contact_dbs.len(),
        contact_xml = sources.contact_xml_files.len(),
        plists = sources.system_plists.len(),
        images = sources.image_files.len(),
        "classified archive members"
    );

    let mut notes: Vec<String> = Vec::new();
    let mut sync = GraphSync::new(deps.graph.as_ref());

    if sources.message_dbs.is_empty() && sources.contact_dbs.is_empty() {
        notes.push(
            "No obvious message or contact databases were discovered. \
             Review the extraction manually."
                .to_string(),
        );
    }

    // Both table passes run over every discovered database; the column
    // classifier claims both-matching tables for the message pass.
    let mut database_files = sources.message_dbs.clone();
    for path in &sources.contact_dbs {
        if !database_files.contains(path) {
            database_files.push(path.clone());
        }
    }

    let mut messages_ingested = 0u64;
    let mut contacts_ingested = 0u64;
    let mut embedding_batch: Vec<EmbeddingRecord> = Vec::new();

    // Contacts register first so the alias map is seeded before message
    // endpoints are labeled.
    for db_path in &database_files {
        let rel = relative_to(db_path, &extraction_dir);
        match ingest_contacts_from_db(pool, db_path, &mut sync).await {
            Ok(0) => {}
            Ok(processed) => {
                contacts_ingested += processed;
                notes.push(format!("Parsed {processed} contacts from {rel}"));
            }
            Err(e) => {
                warn!(database = %db_path.display(), "failed parsing contacts: {e:#}");
                notes.push(format!("Failed parsing contacts from {rel}: {e}"));
            }
        }
    }

    for xml_path in &sources.contact_xml_files {
        let rel = relative_to(xml_path, &extraction_dir);
        match ingest_contacts_from_xml(pool, xml_path, &mut sync).await {
            Ok(processed) => {
                contacts_ingested += processed;
                notes.push(format!("Parsed {processed} contacts from {rel}"));
            }
            Err(e) => {
                warn!(file = %xml_path.display(), "failed parsing contacts markup: {e:#}");
                notes.push(format!("Failed parsing contacts XML {rel}: {e}"));
            }
        }
    }

    for db_path in &database_files {
        let rel = relative_to(db_path, &extraction_dir);
        match ingest_messages_from_db(pool, db_path, &mut sync, &mut embedding_batch).await {
            Ok(0) => {}
            Ok(processed) => {
                messages_ingested += processed;
                notes.push(format!("Parsed {processed} messages from {rel}"));
            }
            Err(e) => {
                warn!(database = %db_path.display(), "failed parsing messages: {e:#}");
                notes.push(format!("Failed parsing messages from {rel}: {e}"));
            }
        }
    }

    let mut system_records_ingested = 0u64;
    for plist_path in &sources.system_plists {
        let rel = relative_to(plist_path, &extraction_dir);
        match ingest_system_info_from_plist(pool, plist_path).await {
            Ok(processed) => {
                system_records_ingested += processed;
                notes.push(format!("Parsed {processed} system records from {rel}"));
            }
            Err(e) => {
                warn!(file = %plist_path.display(), "failed parsing property list: {e:#}");
                notes.push(format!("Failed parsing system plist {rel}: {e}"));
            }
        }
    }

    let mut images_logged = 0u64;
    let mut images_captioned = 0u64;
    match ledger::log_image_inventory(pool, &sources.image_files, &extraction_dir).await {
        Ok((logged, pending_images)) => {
            images_logged = logged;
            if logged > 0 {
                notes.push(format!("Logged {logged} image references"));
            }
            if !pending_images.is_empty() {
                if deps.vision.is_enabled() {
                    match describe_and_index_images(pool, deps.vision.as_ref(), &pending_images)
                        .await
                    {
                        Ok((captioned, image_embeddings)) => {
                            images_captioned = captioned;
                            embedding_batch.extend(image_embeddings);
                            if captioned > 0 {
                                notes.push(format!("Generated captions for {captioned} images"));
                            } else {
                                notes.push(format!(
                                    "No image captions generated across {} attempts; \
                                     review logs for vision errors",
                                    pending_images.len()
                                ));
                            }
                        }
                        Err(e) => {
                            warn!("image captioning pass failed: {e:#}");
                            notes.push(format!("Image captioning failed: {e}"));
                        }
                    }
                } else {
                    notes.push(format!(
                        "Vision collaborator not configured; {} images left pending",
                        pending_images.len()
                    ));
                }
            }
        }
        Err(e) => {
            warn!("image inventory pass failed: {e:#}");
            notes.push(format!("Image inventory failed: {e}"));
        }
    }

    if deps.vectors.is_enabled() {
        let message_count = embedding_batch
            .iter()
            .filter(|record| record.vector_id.starts_with("msg:"))
            .count();
        let image_count = embedding_batch.len() - message_count;
        if embedding_batch.is_empty() {
            notes.push(
                "Vector store enabled but no content suitable for embeddings was found"
                    .to_string(),
            );
        } else {
            match index_embeddings(deps, &embedding_batch).await {
                Ok(()) => notes.push(format!(
                    "Stored embeddings for {}",
                    embedding_detail(message_count, image_count)
                )),
                Err(e) => {
                    warn!("vector indexing failed, dropping batch for this run: {e:#}");
                    notes.push(format!("Vector store indexing failed: {e}"));
                }
            }
        }
    } else {
        notes.push("Vector store disabled; embeddings were not generated".to_string());
    }

    if deps.graph.is_enabled() {
        let stats = &sync.stats;
        if stats.contacts_registered > 0 || stats.relationships_registered > 0 {
            notes.push(format!(
                "Graph updated ({} contacts, {} message links)",
                stats.contacts_registered, stats.relationships_registered
            ));
        } else {
            notes.push(
                "Graph integration enabled; no new contacts or message links were added"
                    .to_string(),
            );
        }
    } else {
        notes.push("Graph integration skipped (disabled in configuration)".to_string());
    }

    Ok(IngestionSummary {
        archive_name: archive_name.to_string(),
        extraction_id: extraction_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        notes,
        messages_ingested,
        contacts_ingested,
        system_records_ingested,
        images_logged,
        images_captioned,
    })
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

fn embedding_detail(message_count: usize, image_count: usize) -> String {
    match (message_count, image_count) {
        (m, 0) => format!("{m} messages"),
        (0, i) => format!("{i} images"),
        (m, i) => format!("{m} messages and {i} images"),
    }
}

/// Read every message-classified table of one database and persist the rows.
/// Each table commits in its own transaction.
async fn ingest_messages_from_db(
    pool: &SqlitePool,
    db_path: &Path,
    sync: &mut GraphSync<'_>,
    embedding_batch: &mut Vec<EmbeddingRecord>,
) -> Result<u64> {
    let tables = read_classified_tables(db_path, TableKind::Message)?;
    let source = db_path.display().to_string();
    let mut ingested = 0u64;

    for (table, rows) in tables {
        let mut tx = pool.begin().await?;
        let mut table_records: Vec<EmbeddingRecord> = Vec::new();

        for payload in &rows {
            let message = ledger::parse_message_row(db_path, &table, payload);
            if ledger::insert_message(&mut *tx, &message).await? {
                ingested += 1;
            }

            sync.register_message(
                &MessageIdentity {
                    message_id: message.external_id.clone(),
                    sender: message.sender.clone(),
                    receiver: message.receiver.clone(),
                    timestamp: message.timestamp.clone(),
                    body: message.body.clone(),
                    conversation_id: message.conversation_id.clone(),
                },
                &source,
            )
            .await;

            if let Some(vector_id) = &message.vector_id {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("type".to_string(), "message".to_string());
                metadata.insert("external_id".to_string(), message.external_id.clone());
                metadata.insert(
                    "conversation_id".to_string(),
                    message.conversation_id.clone().unwrap_or_default(),
                );
                metadata.insert(
                    "sender".to_string(),
                    message.sender.clone().unwrap_or_default(),
                );
                metadata.insert(
                    "receiver".to_string(),
                    message.receiver.clone().unwrap_or_default(),
                );
                metadata.insert(
                    "timestamp".to_string(),
                    message.timestamp.clone().unwrap_or_default(),
                );
                metadata.insert("source".to_string(), source.clone());
                metadata.insert("table".to_string(), table.clone());

                table_records.push(EmbeddingRecord {
                    vector_id: vector_id.clone(),
                    text: message.body.clone().unwrap_or_default(),
                    metadata,
                });
            }
        }

        tx.commit().await?;
        embedding_batch.append(&mut table_records);
    }

    Ok(ingested)
}

/// Read every contact-classified table of one database and append the rows.
async fn ingest_contacts_from_db(
    pool: &SqlitePool,
    db_path: &Path,
    sync: &mut GraphSync<'_>,
) -> Result<u64> {
    let tables = read_classified_tables(db_path, TableKind::Contact)?;
    let source = db_path.display().to_string();
    let mut ingested = 0u64;

    for (table, rows) in tables {
        let mut tx = pool.begin().await?;
        for payload in &rows {
            let contact = ledger::parse_contact_row(db_path, &table, payload);
            ledger::insert_contact(&mut *tx, &contact).await?;
            ingested += 1;

            sync.register_contact(
                &ContactIdentity {
                    display_name: contact.display_name.clone(),
                    given_name: contact.given_name.clone(),
                    family_name: contact.family_name.clone(),
                    phone_number: contact.phone_number.clone(),
                    email: contact.email.clone(),
                },
                &source,
            )
            .await;
        }
        tx.commit().await?;
    }

    Ok(ingested)
}

/// Collect the rows of every table matching `kind`. The source connection
/// is closed before anything async happens.
fn read_classified_tables(
    db_path: &Path,
    kind: TableKind,
) -> Result<Vec<(String, Vec<source_db::RowPayload>)>> {
    let conn = source_db::open_readonly(db_path)?;
    let mut selected = Vec::new();
    for (table, columns) in source_db::user_tables(&conn)? {
        if classify_columns(&columns) == Some(kind) {
            let rows = source_db::read_rows(&conn, &table)?;
            selected.push((table, rows));
        }
    }
    Ok(selected)
}

/// Parse `<contact>` elements out of a markup export and append them.
async fn ingest_contacts_from_xml(
    pool: &SqlitePool,
    xml_path: &Path,
    sync: &mut GraphSync<'_>,
) -> Result<u64> {
    let contacts = read_contact_markup(xml_path)?;
    let source = xml_path.display().to_string();
    let file_name = xml_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.clone());

    let mut tx = pool.begin().await?;
    let mut count = 0u64;
    for fields in &contacts {
        let raw_data: Value = fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into();

        let contact = ledger::NewContact {
            external_id: format!("{file_name}:{count}"),
            display_name: fields.get("displayName").cloned(),
            given_name: fields.get("firstName").cloned(),
            family_name: fields.get("lastName").cloned(),
            phone_number: fields.get("phone").cloned(),
            email: fields.get("email").cloned(),
            source: source.clone(),
            raw_data: raw_data.to_string(),
        };
        ledger::insert_contact(&mut *tx, &contact).await?;
        count += 1;

        sync.register_contact(
            &ContactIdentity {
                display_name: contact.display_name.clone(),
                given_name: contact.given_name.clone(),
                family_name: contact.family_name.clone(),
                phone_number: contact.phone_number.clone(),
                email: contact.email.clone(),
            },
            &source,
        )
        .await;
    }
    tx.commit().await?;

    Ok(count)
}

/// Pull child-element text out of every `<contact>` element.
fn read_contact_markup(xml_path: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    let xml = std::fs::read(xml_path)
        .with_context(|| format!("failed to read {}", xml_path.display()))?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);

    let mut contacts = Vec::new();
    let mut current: Option<BTreeMap<String, String>> = None;
    let mut current_tag: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "contact" {
                    current = Some(BTreeMap::new());
                    current_tag = None;
                } else if current.is_some() {
                    current_tag = Some(name);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if let (Some(fields), Some(tag)) = (current.as_mut(), current_tag.as_ref()) {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    if !text.is_empty() {
                        fields.insert(tag.clone(), text);
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "contact" {
                    if let Some(fields) = current.take() {
                        contacts.push(fields);
                    }
                } else {
                    current_tag = None;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => anyhow::bail!("malformed contact markup: {e}"),
            _ => {}
        }
        buf.clear();
    }

    Ok(contacts)
}

/// Flatten one property list into system-info leaves, committed as a unit.
async fn ingest_system_info_from_plist(pool: &SqlitePool, plist_path: &Path) -> Result<u64> {
    let properties = ledger::read_properties(plist_path)?;
    let leaves = ledger::flatten_properties(&properties);
    let category = plist_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = plist_path.display().to_string();

    let mut tx = pool.begin().await?;
    let mut count = 0u64;
    for (key, value) in &leaves {
        ledger::insert_system_info(&mut *tx, key, value, &category, &source).await?;
        count += 1;
    }
    tx.commit().await?;

    Ok(count)
}

/// One batched encode, one batched upsert. A failure drops the whole batch
/// for this run; ledger writes are unaffected.
async fn index_embeddings(deps: &IngestDeps, records: &[EmbeddingRecord]) -> Result<()> {
    let texts: Vec<String> = records.iter().map(|record| record.text.clone()).collect();
    let embeddings = deps.encoder.encode(&texts).await?;

    let ids: Vec<String> = records
        .iter()
        .map(|record| record.vector_id.clone())
        .collect();
    let metadatas: Vec<std::collections::HashMap<String, String>> =
        records.iter().map(|record| record.metadata.clone()).collect();

    deps.vectors
        .upsert(&ids, &embeddings, &metadatas, &texts)
        .await
}
