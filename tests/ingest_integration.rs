//! End-to-end ingestion runs over a synthetic UFDR archive.
//!
//! The archive is built on the fly: two SQLite databases with unknown
//! schemas, a contact markup export, a property list, and an image. The
//! collaborators are the in-memory graph/vector stores plus scripted
//! encoder and vision stubs, so every cross-store effect is observable.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use casetrace::config::{Config, DbConfig, StorageConfig};
use casetrace::db;
use casetrace::embedding::TextEncoder;
use casetrace::graph::MemoryGraphStore;
use casetrace::ingest::{run_ingest, IngestDeps};
use casetrace::llm::{ImageDescription, VisionClient};
use casetrace::migrate;
use casetrace::vector_store::MemoryVectorIndex;

struct StubEncoder;

#[async_trait]
impl TextEncoder for StubEncoder {
    fn is_enabled(&self) -> bool {
        true
    }
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
    }
}

struct StubVision {
    succeed: bool,
}

#[async_trait]
impl VisionClient for StubVision {
    fn is_enabled(&self) -> bool {
        true
    }
    async fn describe_image(&self, _path: &Path) -> Result<ImageDescription> {
        if self.succeed {
            Ok(ImageDescription {
                caption: "a wooden pier at night".to_string(),
                tags: vec!["pier".to_string(), "night".to_string()],
                detected_text: None,
            })
        } else {
            anyhow::bail!("vision backend offline")
        }
    }
}

struct TestEnv {
    _tmp: TempDir,
    config: Config,
    pool: sqlx::SqlitePool,
    graph: Arc<MemoryGraphStore>,
    vectors: Arc<MemoryVectorIndex>,
}

impl TestEnv {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let config = Config {
            storage: StorageConfig {
                uploads_dir: root.join("storage/uploads"),
                extracted_dir: root.join("storage/extracted"),
            },
            db: DbConfig {
                path: root.join("storage/main.db"),
            },
            graph: Default::default(),
            vector: Default::default(),
            embedding: Default::default(),
            gemini: Default::default(),
        };

        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        Self {
            _tmp: tmp,
            config,
            pool,
            graph: Arc::new(MemoryGraphStore::new()),
            vectors: Arc::new(MemoryVectorIndex::new(Arc::new(StubEncoder))),
        }
    }

    fn deps(&self, vision_succeeds: bool) -> IngestDeps {
        IngestDeps {
            graph: self.graph.clone(),
            vectors: self.vectors.clone(),
            encoder: Arc::new(StubEncoder),
            vision: Arc::new(StubVision {
                succeed: vision_succeeds,
            }),
        }
    }

    async fn count(&self, table: &str) -> i64 {
        let query = format!("SELECT COUNT(*) FROM {table}");
        sqlx::query_scalar(&query).fetch_one(&self.pool).await.unwrap()
    }
}

fn build_message_db(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE sms (address TEXT, recipient TEXT, date INTEGER, body TEXT, thread_id TEXT);
         INSERT INTO sms VALUES ('tel:+1 (555) 123-0001', '+15551230002', 700000000, 'meet at the pier at 9', 'th-1');
         INSERT INTO sms VALUES ('+15551230002', '+15551230001', 700000100, 'ok, see you there', 'th-1');
         INSERT INTO sms VALUES ('+15551230003', NULL, 700000200, NULL, NULL);",
    )
    .unwrap();
}

fn build_contact_db(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE persons (first TEXT, last TEXT, phone TEXT, email TEXT);
         INSERT INTO persons VALUES ('Jane', 'Smith', '+1 555 123 0001', 'Jane@Example.com');
         INSERT INTO persons VALUES ('Bob', 'Jones', '555-9999', NULL);",
    )
    .unwrap();
}

fn build_plist(path: &Path) {
    let mut os = plist::Dictionary::new();
    os.insert("Version".to_string(), plist::Value::String("17.4".into()));
    let mut root = plist::Dictionary::new();
    root.insert(
        "DeviceName".to_string(),
        plist::Value::String("Jane's iPhone".into()),
    );
    root.insert("OS".to_string(), plist::Value::Dictionary(os));
    root.insert(
        "SIMs".to_string(),
        plist::Value::Array(vec![plist::Value::String("sim-1".into())]),
    );
    plist::Value::Dictionary(root).to_file_xml(path).unwrap();
}

/// Zip a staging directory the way an extraction tool would bundle it.
fn zip_dir(staging: &Path) -> Vec<u8> {
    let buffer = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(buffer);
    let options = zip::write::SimpleFileOptions::default();

    for entry in walkdir::WalkDir::new(staging) {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(staging)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(name, options).unwrap();
        writer
            .write_all(&std::fs::read(entry.path()).unwrap())
            .unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn build_archive(tmp: &Path, with_corrupt_db: bool) -> Vec<u8> {
    let staging = tmp.join("staging");
    std::fs::create_dir_all(staging.join("databases")).unwrap();
    std::fs::create_dir_all(staging.join("system")).unwrap();
    std::fs::create_dir_all(staging.join("DCIM")).unwrap();

    build_message_db(&staging.join("databases/sms.db"));
    build_contact_db(&staging.join("databases/AddressBook.sqlite"));
    build_plist(&staging.join("system/device_info.plist"));

    std::fs::write(
        staging.join("databases/contacts.xml"),
        r#"<?xml version="1.0"?>
<contacts>
  <contact>
    <displayName>Carol White</displayName>
    <firstName>Carol</firstName>
    <lastName>White</lastName>
    <phone>+1 555 777 0001</phone>
  </contact>
</contacts>"#,
    )
    .unwrap();

    std::fs::write(staging.join("DCIM/IMG_0001.jpg"), b"\xff\xd8\xff\xe0 fake jpeg").unwrap();

    if with_corrupt_db {
        std::fs::write(staging.join("databases/chat.db"), b"this is not sqlite").unwrap();
    }

    let bytes = zip_dir(&staging);
    std::fs::remove_dir_all(&staging).unwrap();
    bytes
}

#[tokio::test]
async fn full_ingest_populates_all_three_stores() {
    let env = TestEnv::new().await;
    let archive = build_archive(env._tmp.path(), false);

    let summary = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();

    assert_eq!(summary.messages_ingested, 3);
    assert_eq!(summary.contacts_ingested, 3);
    assert_eq!(summary.system_records_ingested, 3);
    assert_eq!(summary.images_logged, 1);
    assert_eq!(summary.images_captioned, 1);

    assert_eq!(env.count("messages").await, 3);
    assert_eq!(env.count("contacts").await, 3);
    assert_eq!(env.count("system_info").await, 3);
    assert_eq!(env.count("images").await, 1);

    // Two bodied messages + one captioned image.
    assert_eq!(env.vectors.count(), 3);

    // Jane (phone + email), Bob, Carol, plus the message-only actor.
    assert_eq!(env.graph.person_count(), 5);
    assert_eq!(env.graph.relationship_count(), 2);
    assert_eq!(
        env.graph.display_name("+15551230001").as_deref(),
        Some("Jane Smith")
    );

    let leaves: Vec<(String, String)> =
        sqlx::query_as("SELECT info_key, info_value FROM system_info ORDER BY info_key")
            .fetch_all(&env.pool)
            .await
            .unwrap();
    let keys: Vec<&str> = leaves.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["DeviceName", "OS.Version", "SIMs[0]"]);
}

#[tokio::test]
async fn re_ingesting_the_same_archive_is_stable_where_it_matters() {
    let env = TestEnv::new().await;
    let archive = build_archive(env._tmp.path(), false);

    run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();
    let second = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();

    // Stable identities: vector entries, graph nodes/edges, image rows.
    assert_eq!(env.vectors.count(), 3);
    assert_eq!(env.graph.person_count(), 5);
    assert_eq!(env.graph.relationship_count(), 2);
    assert_eq!(env.count("images").await, 1);

    // Documented duplication: the bodiless message re-inserts, contacts append.
    assert_eq!(second.messages_ingested, 1);
    assert_eq!(env.count("messages").await, 4);
    assert_eq!(env.count("contacts").await, 6);

    // The already-captioned image is not re-paid.
    assert_eq!(second.images_captioned, 0);
    let status: String = sqlx::query_scalar("SELECT caption_status FROM images")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(status, "done");
}

#[tokio::test]
async fn failed_captions_are_retried_on_rediscovery() {
    let env = TestEnv::new().await;
    let archive = build_archive(env._tmp.path(), false);

    // First pass: vision is down, the image fails but the run succeeds.
    let first = run_ingest(&env.pool, &env.deps(false), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();
    assert_eq!(first.images_captioned, 0);

    let (status, error): (String, Option<String>) =
        sqlx::query_as("SELECT caption_status, caption_error FROM images")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert!(error.unwrap().contains("vision backend offline"));

    // Second pass: rediscovery resets the failed row and captions it.
    let second = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();
    assert_eq!(second.images_captioned, 1);

    let (status, error): (String, Option<String>) =
        sqlx::query_as("SELECT caption_status, caption_error FROM images")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(status, "done");
    assert!(error.is_none());

    // Third pass: done is terminal, no re-caption.
    let third = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();
    assert_eq!(third.images_captioned, 0);
}

#[tokio::test]
async fn one_corrupt_database_does_not_sink_the_run() {
    let env = TestEnv::new().await;
    let archive = build_archive(env._tmp.path(), true);

    let summary = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();

    // The valid database was still ingested in full.
    assert_eq!(summary.messages_ingested, 3);
    assert_eq!(summary.contacts_ingested, 3);

    // And the failure is named in the notes.
    assert!(summary
        .notes
        .iter()
        .any(|note| note.starts_with("Failed parsing messages from") && note.contains("chat.db")));
}

#[tokio::test]
async fn corrupt_archives_are_rejected_before_any_write() {
    let env = TestEnv::new().await;

    let result = run_ingest(
        &env.pool,
        &env.deps(true),
        &env.config,
        b"definitely not a zip archive",
        "broken.ufdr",
    )
    .await;

    assert!(result.is_err());
    assert_eq!(env.count("messages").await, 0);
    assert_eq!(env.count("contacts").await, 0);
    assert_eq!(env.count("images").await, 0);
    assert_eq!(env.graph.person_count(), 0);
    assert_eq!(env.vectors.count(), 0);
}

#[tokio::test]
async fn distinct_runs_have_distinct_extraction_ids() {
    let env = TestEnv::new().await;
    let archive = build_archive(env._tmp.path(), false);

    let first = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();
    let second = run_ingest(&env.pool, &env.deps(true), &env.config, &archive, "case.ufdr")
        .await
        .unwrap();

    let ids: HashSet<&str> = [first.extraction_id.as_str(), second.extraction_id.as_str()]
        .into_iter()
        .collect();
    assert_eq!(ids.len(), 2);
}
