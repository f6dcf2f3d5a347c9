//! Ledger-level behavior against a real SQLite database: message dedup via
//! vector ids, image rediscovery merges, and the full-ledger graph resync.

use tempfile::TempDir;

use casetrace::config::{Config, DbConfig, StorageConfig};
use casetrace::graph::{GraphStore, MemoryGraphStore};
use casetrace::graph_sync::{reset_graph, resync_graph};
use casetrace::ledger::{self, NewContact, NewMessage};
use casetrace::{db, migrate};

async fn test_pool(tmp: &TempDir) -> sqlx::SqlitePool {
    let config = Config {
        storage: StorageConfig {
            uploads_dir: tmp.path().join("uploads"),
            extracted_dir: tmp.path().join("extracted"),
        },
        db: DbConfig {
            path: tmp.path().join("main.db"),
        },
        graph: Default::default(),
        vector: Default::default(),
        embedding: Default::default(),
        gemini: Default::default(),
    };
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

fn message(external_id: &str, body: Option<&str>) -> NewMessage {
    NewMessage {
        external_id: external_id.to_string(),
        conversation_id: None,
        sender: Some("+15551230001".to_string()),
        receiver: Some("+15551230002".to_string()),
        timestamp: Some("2024-01-01T00:00:00+00:00".to_string()),
        body: body.map(str::to_string),
        direction: None,
        message_type: None,
        attachments: None,
        source: "sms.db".to_string(),
        raw_data: "{}".to_string(),
        vector_id: body.map(|_| format!("msg:{external_id}")),
    }
}

async fn count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn bodied_messages_dedup_on_vector_id() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let msg = message("sms.db:sms:1", Some("hello"));
    let mut conn = pool.acquire().await.unwrap();
    assert!(ledger::insert_message(&mut *conn, &msg).await.unwrap());
    assert!(!ledger::insert_message(&mut *conn, &msg).await.unwrap());
    drop(conn);

    assert_eq!(count(&pool, "messages").await, 1);
    let vector_id: Option<String> = sqlx::query_scalar("SELECT vector_id FROM messages")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vector_id.as_deref(), Some("msg:sms.db:sms:1"));
}

#[tokio::test]
async fn bodiless_messages_always_insert() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let msg = message("sms.db:sms:9", None);
    let mut conn = pool.acquire().await.unwrap();
    assert!(ledger::insert_message(&mut *conn, &msg).await.unwrap());
    assert!(ledger::insert_message(&mut *conn, &msg).await.unwrap());
    drop(conn);

    assert_eq!(count(&pool, "messages").await, 2);
}

#[tokio::test]
async fn image_rediscovery_merges_metadata_and_resets_failed_rows() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    // Two extraction workspaces holding the same archive-relative image.
    let run1 = tmp.path().join("extracted/run1");
    let run2 = tmp.path().join("extracted/run2");
    for run in [&run1, &run2] {
        std::fs::create_dir_all(run.join("DCIM")).unwrap();
        std::fs::write(run.join("DCIM/IMG_0001.jpg"), b"jpeg bytes").unwrap();
    }

    let (logged, pending) =
        ledger::log_image_inventory(&pool, &[run1.join("DCIM/IMG_0001.jpg")], &run1)
            .await
            .unwrap();
    assert_eq!(logged, 1);
    assert_eq!(pending.len(), 1);
    let image_id = pending[0].id;

    // Caption attempt fails; the row parks as failed.
    ledger::mark_caption_failed(&pool, image_id, "vision offline", "2024-01-01T00:00:00+00:00")
        .await
        .unwrap();

    // Seed a metadata key the second discovery does not produce.
    sqlx::query("UPDATE images SET metadata = json_set(metadata, '$.examiner', 'unit 7') WHERE id = ?")
        .bind(image_id)
        .execute(&pool)
        .await
        .unwrap();

    // Rediscovery from a different workspace: same row, reset to pending,
    // metadata merged with the new extraction winning on shared keys.
    let (logged, pending) =
        ledger::log_image_inventory(&pool, &[run2.join("DCIM/IMG_0001.jpg")], &run2)
            .await
            .unwrap();
    assert_eq!(logged, 1);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, image_id);
    assert_eq!(count(&pool, "images").await, 1);

    let (status, file_path, metadata): (String, String, String) =
        sqlx::query_as("SELECT caption_status, file_path, metadata FROM images WHERE id = ?")
            .bind(image_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "pending");
    assert!(file_path.contains("run2"));
    let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
    assert_eq!(metadata["examiner"], "unit 7");
    assert!(metadata["extraction_id"].as_str().unwrap().contains("run2"));
}

#[tokio::test]
async fn done_images_are_not_requeued_by_rediscovery() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let run1 = tmp.path().join("extracted/run1");
    std::fs::create_dir_all(run1.join("DCIM")).unwrap();
    std::fs::write(run1.join("DCIM/IMG_0002.jpg"), b"jpeg bytes").unwrap();

    let (_, pending) =
        ledger::log_image_inventory(&pool, &[run1.join("DCIM/IMG_0002.jpg")], &run1)
            .await
            .unwrap();
    let record = &pending[0];

    let description = casetrace::llm::ImageDescription {
        caption: "a receipt".to_string(),
        tags: vec!["receipt".to_string()],
        detected_text: Some("TOTAL 12.99".to_string()),
    };
    ledger::mark_caption_done(&pool, record, &description, "img:1", "2024-01-01T00:00:00+00:00")
        .await
        .unwrap();

    let (_, pending) =
        ledger::log_image_inventory(&pool, &[run1.join("DCIM/IMG_0002.jpg")], &run1)
            .await
            .unwrap();
    assert!(pending.is_empty());

    let (status, description): (String, Option<String>) =
        sqlx::query_as("SELECT caption_status, description FROM images")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "done");
    assert_eq!(description.as_deref(), Some("a receipt"));
}

#[tokio::test]
async fn resync_replays_the_ledger_into_a_fresh_graph() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let mut conn = pool.acquire().await.unwrap();
    ledger::insert_contact(
        &mut *conn,
        &NewContact {
            external_id: "ab.sqlite:persons:1".to_string(),
            display_name: Some("Jane Smith".to_string()),
            given_name: Some("Jane".to_string()),
            family_name: Some("Smith".to_string()),
            phone_number: Some("+1 555 123 0001".to_string()),
            email: None,
            source: "ab.sqlite".to_string(),
            raw_data: "{}".to_string(),
        },
    )
    .await
    .unwrap();
    ledger::insert_message(&mut *conn, &message("sms.db:sms:1", Some("hello")))
        .await
        .unwrap();
    // A message the graph cannot place: no receiver.
    let mut orphan = message("sms.db:sms:2", Some("who is this?"));
    orphan.receiver = None;
    ledger::insert_message(&mut *conn, &orphan).await.unwrap();
    drop(conn);

    let store = MemoryGraphStore::new();
    let stats = resync_graph(&pool, &store, false).await;

    assert!(stats.success());
    assert_eq!(stats.contacts_synced, 1);
    assert_eq!(stats.relationships_synced, 1);
    assert_eq!(stats.skipped_messages, 1);
    assert_eq!(store.person_count(), 2);
    assert_eq!(
        store.display_name("+15551230001").as_deref(),
        Some("Jane Smith")
    );

    // Resyncing again converges instead of duplicating.
    let again = resync_graph(&pool, &store, false).await;
    assert!(again.success());
    assert_eq!(store.person_count(), 2);
    assert_eq!(store.relationship_count(), 1);

    // And a clearing resync starts from nothing.
    let cleared = resync_graph(&pool, &store, true).await;
    assert!(cleared.cleared);
    assert_eq!(store.person_count(), 2);
}

#[tokio::test]
async fn reset_graph_requires_an_enabled_store() {
    let store = MemoryGraphStore::new();
    store
        .register_person(&casetrace::graph::PersonUpsert {
            identifier: "+1".to_string(),
            display_name: None,
            given_name: None,
            family_name: None,
            raw_identifier: "+1".to_string(),
            source: "x".to_string(),
        })
        .await;
    let stats = reset_graph(&store).await;
    assert!(stats.cleared);
    assert_eq!(store.person_count(), 0);

    let disabled = casetrace::graph::DisabledGraphStore;
    let stats = reset_graph(&disabled).await;
    assert!(!stats.cleared);
    assert!(stats.detail.is_some());
}

#[tokio::test]
async fn source_files_never_receive_writes() {
    // The source-db layer opens read-only; an insert attempt must fail.
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sms.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE sms (body TEXT, date INTEGER);")
        .unwrap();
    drop(conn);

    let readonly = casetrace::source_db::open_readonly(&path).unwrap();
    let err = readonly.execute("INSERT INTO sms VALUES ('x', 1)", []);
    assert!(err.is_err());
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    migrate::run_migrations(&pool).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    assert_eq!(count(&pool, "messages").await, 0);
}
