use anyhow::Result;
use sqlx::SqlitePool;

/// Create the ledger schema. Idempotent; safe to run before every ingestion.
///
/// Messages carry no uniqueness constraint on their natural external id:
/// re-ingestion safety for bodied rows rides entirely on the partial unique
/// index over `vector_id`, and bodiless rows are allowed to duplicate.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT,
            display_name TEXT,
            given_name TEXT,
            family_name TEXT,
            phone_number TEXT,
            email TEXT,
            source TEXT,
            raw_data TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT,
            conversation_id TEXT,
            sender TEXT,
            receiver TEXT,
            timestamp TEXT,
            body TEXT,
            direction TEXT,
            message_type TEXT,
            attachments TEXT,
            source TEXT,
            raw_data TEXT,
            vector_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            info_key TEXT,
            info_value TEXT,
            category TEXT,
            source TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT UNIQUE,
            relative_path TEXT UNIQUE,
            description TEXT,
            tags TEXT,
            detected_text TEXT,
            source TEXT,
            metadata TEXT,
            vector_id TEXT,
            caption_status TEXT,
            caption_error TEXT,
            last_captioned_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_vector_id
        ON messages(vector_id) WHERE vector_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_images_vector_id
        ON images(vector_id) WHERE vector_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
