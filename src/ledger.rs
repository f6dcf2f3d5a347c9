//! Idempotent persistence of classified, normalized records into the
//! relational ledger.
//!
//! Each logical unit (one table's messages, one table's contacts, one
//! properties file, the image inventory pass) commits in its own scope, so a
//! failure partway through an archive leaves earlier units durably written.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};

use crate::classify::guess_mime;
use crate::llm::ImageDescription;
use crate::models::ImageInventoryRecord;
use crate::normalize::{
    normalize_timestamp, pick_first_value, value_to_string,
    CONVERSATION_FIELDS, DIRECTION_FIELDS, DISPLAY_NAME_FIELDS, EMAIL_FIELDS, FAMILY_NAME_FIELDS,
    GIVEN_NAME_FIELDS, MESSAGE_TYPE_FIELDS, PHONE_FIELDS, RECEIVER_FIELDS, SENDER_FIELDS,
    TEXT_FIELDS, TIMESTAMP_FIELDS,
};
use crate::source_db::RowPayload;

pub const INGEST_SOURCE: &str = "ufdr";

/// A message row parsed out of a source table, ready for the ledger.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub external_id: String,
    pub conversation_id: Option<String>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub timestamp: Option<String>,
    pub body: Option<String>,
    pub direction: Option<String>,
    pub message_type: Option<String>,
    pub attachments: Option<String>,
    pub source: String,
    pub raw_data: String,
    pub vector_id: Option<String>,
}

/// Extract message fields from a raw row payload.
///
/// The external identifier `{file}:{table}:{rowid}` is derived, stable, and
/// never reused; the vector id exists only when the row has a body.
pub fn parse_message_row(db_path: &Path, table: &str, payload: &RowPayload) -> NewMessage {
    let file_name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| db_path.display().to_string());
    let row_id = payload
        .get("_rowid_")
        .and_then(value_to_string)
        .unwrap_or_default();
    let external_id = format!("{file_name}:{table}:{row_id}");

    let body = pick_first_value(payload, TEXT_FIELDS);
    let vector_id = body
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .map(|_| format!("msg:{external_id}"));

    NewMessage {
        conversation_id: pick_first_value(payload, CONVERSATION_FIELDS),
        sender: pick_first_value(payload, SENDER_FIELDS),
        receiver: pick_first_value(payload, RECEIVER_FIELDS),
        timestamp: pick_first_value(payload, TIMESTAMP_FIELDS).map(|raw| normalize_timestamp(&raw)),
        direction: pick_first_value(payload, DIRECTION_FIELDS),
        message_type: pick_first_value(payload, MESSAGE_TYPE_FIELDS),
        attachments: payload.get("attachments").and_then(value_to_string),
        source: db_path.display().to_string(),
        raw_data: Value::Object(payload.clone()).to_string(),
        external_id,
        body,
        vector_id,
    }
}

/// Insert one message. The only enforced uniqueness is the partial unique
/// index on `vector_id`: a conflict skips the insert and backfills the
/// existing row's vector id if it was still null. Bodiless rows (no vector
/// id) always insert, including on repeat ingestion of the same archive.
pub async fn insert_message(conn: &mut SqliteConnection, message: &NewMessage) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO messages (
            external_id, conversation_id, sender, receiver, timestamp, body,
            direction, message_type, attachments, source, raw_data, vector_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.external_id)
    .bind(&message.conversation_id)
    .bind(&message.sender)
    .bind(&message.receiver)
    .bind(&message.timestamp)
    .bind(&message.body)
    .bind(&message.direction)
    .bind(&message.message_type)
    .bind(&message.attachments)
    .bind(&message.source)
    .bind(&message.raw_data)
    .bind(&message.vector_id)
    .execute(&mut *conn)
    .await?;

    let inserted = result.rows_affected() > 0;
    if !inserted {
        if let Some(vector_id) = &message.vector_id {
            sqlx::query(
                "UPDATE messages SET vector_id = COALESCE(vector_id, ?) WHERE external_id = ?",
            )
            .bind(vector_id)
            .bind(&message.external_id)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(inserted)
}

/// A contact row parsed out of a source table or markup file.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub external_id: String,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub source: String,
    pub raw_data: String,
}

pub fn parse_contact_row(db_path: &Path, table: &str, payload: &RowPayload) -> NewContact {
    let file_name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| db_path.display().to_string());
    let row_id = payload
        .get("_rowid_")
        .and_then(value_to_string)
        .unwrap_or_default();

    let given_name = pick_first_value(payload, GIVEN_NAME_FIELDS);
    let family_name = pick_first_value(payload, FAMILY_NAME_FIELDS);
    let display_name = pick_first_value(payload, DISPLAY_NAME_FIELDS)
        .or_else(|| composed_from_payload(payload));

    NewContact {
        external_id: format!("{file_name}:{table}:{row_id}"),
        display_name,
        given_name,
        family_name,
        phone_number: pick_first_value(payload, PHONE_FIELDS),
        email: pick_first_value(payload, EMAIL_FIELDS),
        source: db_path.display().to_string(),
        raw_data: Value::Object(payload.clone()).to_string(),
    }
}

fn composed_from_payload(payload: &RowPayload) -> Option<String> {
    let parts: Vec<String> = ["first", "middle", "last"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(value_to_string))
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Contacts are appended unconditionally: there is no dedup key, every
/// parsed row lands as its own evidence record.
pub async fn insert_contact(conn: &mut SqliteConnection, contact: &NewContact) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO contacts (
            external_id, display_name, given_name, family_name,
            phone_number, email, source, raw_data
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&contact.external_id)
    .bind(&contact.display_name)
    .bind(&contact.given_name)
    .bind(&contact.family_name)
    .bind(&contact.phone_number)
    .bind(&contact.email)
    .bind(&contact.source)
    .bind(&contact.raw_data)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_system_info(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
    category: &str,
    source: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO system_info (info_key, info_value, category, source) VALUES (?, ?, ?, ?)",
    )
    .bind(key)
    .bind(value)
    .bind(category)
    .bind(source)
    .execute(conn)
    .await?;
    Ok(())
}

pub fn read_properties(path: &Path) -> Result<plist::Value> {
    plist::Value::from_file(path)
        .with_context(|| format!("failed to parse property list {}", path.display()))
}

/// Flatten a properties tree into one leaf per scalar, with dotted paths for
/// dictionary keys and bracketed indexes for arrays.
pub fn flatten_properties(value: &plist::Value) -> Vec<(String, String)> {
    let mut leaves = Vec::new();
    flatten_into("", value, &mut leaves);
    leaves
}

fn flatten_into(prefix: &str, value: &plist::Value, leaves: &mut Vec<(String, String)>) {
    match value {
        plist::Value::Dictionary(dict) => {
            for (key, nested) in dict.iter() {
                let nested_prefix = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&nested_prefix, nested, leaves);
            }
        }
        plist::Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}[{index}]"), nested, leaves);
            }
        }
        scalar => leaves.push((prefix.to_string(), scalar_to_string(scalar))),
    }
}

fn scalar_to_string(value: &plist::Value) -> String {
    match value {
        plist::Value::String(s) => s.clone(),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Integer(i) => i
            .as_signed()
            .map(|v| v.to_string())
            .or_else(|| i.as_unsigned().map(|v| v.to_string()))
            .unwrap_or_default(),
        plist::Value::Real(f) => f.to_string(),
        plist::Value::Data(bytes) => hex::encode(bytes),
        plist::Value::Date(date) => {
            DateTime::<Utc>::from(std::time::SystemTime::from(date.clone())).to_rfc3339()
        }
        other => format!("{other:?}"),
    }
}

/// Record every discovered image, insert-or-ignore keyed by its path within
/// the archive. The stored `file_path` always points at the latest
/// extraction workspace; the relative path is what makes rediscovery across
/// re-ingests hit the same row (and keep its vector id stable). On
/// rediscovery the metadata is shallow-merged (new keys win) and a
/// non-`done` caption status is reset to `pending`. Returns the processed
/// count and the rows eligible for captioning: newly inserted rows plus the
/// ones reset to pending — rows left `done` are excluded.
pub async fn log_image_inventory(
    pool: &SqlitePool,
    image_paths: &[PathBuf],
    extraction_dir: &Path,
) -> Result<(u64, Vec<ImageInventoryRecord>)> {
    if image_paths.is_empty() {
        return Ok((0, Vec::new()));
    }

    let mut records = Vec::new();
    let mut seen_paths = std::collections::HashSet::new();
    let mut processed = 0u64;

    let mut tx = pool.begin().await?;
    for image_path in image_paths {
        let normalized = image_path.display().to_string();
        if !seen_paths.insert(normalized.clone()) {
            continue;
        }
        processed += 1;

        let relative_path = image_path
            .strip_prefix(extraction_dir)
            .unwrap_or(image_path)
            .to_path_buf();
        let relative_key = relative_path.display().to_string();
        let metadata = build_image_metadata(image_path, &relative_path, extraction_dir);

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO images (file_path, relative_path, source, metadata, caption_status)
            VALUES (?, ?, ?, ?, 'pending')
            "#,
        )
        .bind(&normalized)
        .bind(&relative_key)
        .bind(INGEST_SOURCE)
        .bind(Value::Object(metadata.clone()).to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            records.push(ImageInventoryRecord {
                id: result.last_insert_rowid(),
                file_path: image_path.clone(),
                relative_path,
                metadata,
            });
            continue;
        }

        let existing: Option<(i64, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT id, caption_status, metadata FROM images WHERE relative_path = ?",
        )
        .bind(&relative_key)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((image_id, status, existing_metadata)) = existing else {
            continue;
        };

        let mut merged = existing_metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok())
            .unwrap_or_default();
        for (key, value) in metadata {
            merged.insert(key, value);
        }

        sqlx::query("UPDATE images SET file_path = ?, source = ?, metadata = ? WHERE id = ?")
            .bind(&normalized)
            .bind(INGEST_SOURCE)
            .bind(Value::Object(merged.clone()).to_string())
            .bind(image_id)
            .execute(&mut *tx)
            .await?;

        let is_done = status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("done"));
        if !is_done {
            sqlx::query("UPDATE images SET caption_status = 'pending' WHERE id = ?")
                .bind(image_id)
                .execute(&mut *tx)
                .await?;
            records.push(ImageInventoryRecord {
                id: image_id,
                file_path: image_path.clone(),
                relative_path,
                metadata: merged,
            });
        }
    }
    tx.commit().await?;

    Ok((processed, records))
}

fn build_image_metadata(
    image_path: &Path,
    relative_path: &Path,
    extraction_dir: &Path,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "file_path".to_string(),
        Value::from(image_path.display().to_string()),
    );
    metadata.insert(
        "relative_path".to_string(),
        Value::from(relative_path.display().to_string()),
    );
    if let Some(extraction_id) = extraction_dir.file_name() {
        metadata.insert(
            "extraction_id".to_string(),
            Value::from(extraction_id.to_string_lossy().into_owned()),
        );
    }

    if let Ok(stat) = std::fs::metadata(image_path) {
        metadata.insert("size_bytes".to_string(), Value::from(stat.len()));
        if let Ok(modified) = stat.modified() {
            metadata.insert(
                "modified_at".to_string(),
                Value::from(DateTime::<Utc>::from(modified).to_rfc3339()),
            );
        }
        if let Ok(created) = stat.created() {
            metadata.insert(
                "created_at".to_string(),
                Value::from(DateTime::<Utc>::from(created).to_rfc3339()),
            );
        }
    }

    if let Some(mime_type) = guess_mime(image_path) {
        metadata.insert("mime_type".to_string(), Value::from(mime_type));
    }

    metadata
}

/// Persist a successful caption: description, tags, detected text, vector
/// id, `done` status, cleared error.
pub async fn mark_caption_done(
    pool: &SqlitePool,
    record: &ImageInventoryRecord,
    description: &ImageDescription,
    vector_id: &str,
    captioned_at: &str,
) -> Result<()> {
    let tag_string = if description.tags.is_empty() {
        None
    } else {
        Some(description.tags.join(", "))
    };

    let mut metadata = record.metadata.clone();
    metadata.insert(
        "tags".to_string(),
        Value::Array(description.tags.iter().map(|t| Value::from(t.clone())).collect()),
    );
    metadata.insert("caption".to_string(), Value::from(description.caption.clone()));
    if let Some(detected) = &description.detected_text {
        metadata.insert("detected_text".to_string(), Value::from(detected.clone()));
    }

    sqlx::query(
        r#"
        UPDATE images
        SET description = ?, tags = ?, detected_text = ?, vector_id = ?,
            caption_status = 'done', caption_error = NULL,
            last_captioned_at = ?, metadata = ?
        WHERE id = ?
        "#,
    )
    .bind(&description.caption)
    .bind(tag_string)
    .bind(&description.detected_text)
    .bind(vector_id)
    .bind(captioned_at)
    .bind(Value::Object(metadata).to_string())
    .bind(record.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a failed caption attempt: `failed` status plus a truncated error
/// message and timestamp. The row stays eligible for a later rediscovery.
pub async fn mark_caption_failed(
    pool: &SqlitePool,
    image_id: i64,
    error: &str,
    attempted_at: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE images
        SET caption_status = 'failed', caption_error = ?, last_captioned_at = ?
        WHERE id = ?
        "#,
    )
    .bind(truncate_chars(error, 512))
    .bind(attempted_at)
    .bind(image_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_uses_dotted_and_bracketed_paths() {
        let mut inner = plist::Dictionary::new();
        inner.insert("model".to_string(), plist::Value::String("iPhone12,3".into()));
        let mut root = plist::Dictionary::new();
        root.insert("device".to_string(), plist::Value::Dictionary(inner));
        root.insert(
            "sims".to_string(),
            plist::Value::Array(vec![
                plist::Value::String("sim-a".into()),
                plist::Value::String("sim-b".into()),
            ]),
        );
        root.insert("locked".to_string(), plist::Value::Boolean(true));

        let mut leaves = flatten_properties(&plist::Value::Dictionary(root));
        leaves.sort();
        assert_eq!(
            leaves,
            vec![
                ("device.model".to_string(), "iPhone12,3".to_string()),
                ("locked".to_string(), "true".to_string()),
                ("sims[0]".to_string(), "sim-a".to_string()),
                ("sims[1]".to_string(), "sim-b".to_string()),
            ]
        );
    }

    #[test]
    fn message_row_derives_stable_external_and_vector_ids() {
        let payload: RowPayload = [
            ("_rowid_".to_string(), json!(7)),
            ("body".to_string(), json!("meet at 9")),
            ("date".to_string(), json!(700000000)),
            ("address".to_string(), json!("+15551230001")),
        ]
        .into_iter()
        .collect();

        let message = parse_message_row(Path::new("/tmp/x/sms.db"), "sms", &payload);
        assert_eq!(message.external_id, "sms.db:sms:7");
        assert_eq!(message.vector_id.as_deref(), Some("msg:sms.db:sms:7"));
        assert_eq!(message.sender.as_deref(), Some("+15551230001"));
        assert!(message.timestamp.is_some());
    }

    #[test]
    fn bodiless_message_gets_no_vector_id() {
        let payload: RowPayload = [
            ("_rowid_".to_string(), json!(1)),
            ("body".to_string(), json!("   ")),
            ("date".to_string(), json!(700000000)),
        ]
        .into_iter()
        .collect();

        let message = parse_message_row(Path::new("sms.db"), "sms", &payload);
        assert!(message.vector_id.is_none());
    }

    #[test]
    fn contact_row_composes_display_name_when_missing() {
        let payload: RowPayload = [
            ("_rowid_".to_string(), json!(3)),
            ("first".to_string(), json!("Jane")),
            ("last".to_string(), json!("Smith")),
            ("phone".to_string(), json!("+1 555 123 0001")),
        ]
        .into_iter()
        .collect();

        let contact = parse_contact_row(Path::new("AddressBook.sqlite"), "contacts", &payload);
        assert_eq!(contact.display_name.as_deref(), Some("Jane Smith"));
        assert_eq!(contact.given_name.as_deref(), Some("Jane"));
        assert_eq!(contact.family_name.as_deref(), Some("Smith"));
    }

    #[test]
    fn mime_guesses_cover_heic() {
        assert_eq!(guess_mime(Path::new("a.HEIC")), Some("image/heic"));
        assert_eq!(guess_mime(Path::new("a.jpg")), Some("image/jpeg"));
        assert_eq!(guess_mime(Path::new("a.txt")), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(600);
        assert_eq!(truncate_chars(&text, 512).chars().count(), 512);
    }
}
