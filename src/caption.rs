//! Captioning loop over images the inventory pass marked eligible.
//!
//! Each image moves `pending` → `done` or `pending` → `failed`
//! independently; one vision failure never blocks the rest of the batch. A
//! `failed` image re-enters `pending` only when a later ingestion pass
//! rediscovers it, and `done` is terminal for caption content.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::warn;

use crate::ledger;
use crate::llm::VisionClient;
use crate::models::{EmbeddingRecord, ImageInventoryRecord};

/// Caption every eligible image, persisting each outcome as it happens.
/// Returns the success count and one embedding record per captioned image.
pub async fn describe_and_index_images(
    pool: &SqlitePool,
    vision: &dyn VisionClient,
    records: &[ImageInventoryRecord],
) -> Result<(u64, Vec<EmbeddingRecord>)> {
    if records.is_empty() {
        return Ok((0, Vec::new()));
    }

    let mut successes = 0u64;
    let mut embeddings = Vec::new();

    for record in records {
        let attempted_at = Utc::now().to_rfc3339();
        match vision.describe_image(&record.file_path).await {
            Ok(description) => {
                let vector_id = format!("img:{}", record.id);
                ledger::mark_caption_done(pool, record, &description, &vector_id, &attempted_at)
                    .await?;
                successes += 1;
                embeddings.push(embedding_for(record, &vector_id, &description));
            }
            Err(e) => {
                warn!(
                    image = %record.file_path.display(),
                    "image captioning failed: {e:#}"
                );
                ledger::mark_caption_failed(pool, record.id, &format!("{e:#}"), &attempted_at)
                    .await?;
            }
        }
    }

    Ok((successes, embeddings))
}

/// Assemble the retrievable text and metadata for one captioned image:
/// caption plus tag list plus detected text, with a truncated caption
/// carried in the metadata for display.
fn embedding_for(
    record: &ImageInventoryRecord,
    vector_id: &str,
    description: &crate::llm::ImageDescription,
) -> EmbeddingRecord {
    let mut text_parts = vec![description.caption.clone()];
    if !description.tags.is_empty() {
        text_parts.push(format!("Tags: {}", description.tags.join(", ")));
    }
    if let Some(detected) = &description.detected_text {
        text_parts.push(format!("Detected text: {detected}"));
    }

    let mut metadata = HashMap::new();
    metadata.insert("type".to_string(), "image".to_string());
    metadata.insert("image_id".to_string(), record.id.to_string());
    metadata.insert(
        "relative_path".to_string(),
        record.relative_path.display().to_string(),
    );
    metadata.insert("source".to_string(), ledger::INGEST_SOURCE.to_string());
    metadata.insert(
        "caption".to_string(),
        ledger::truncate_chars(&description.caption, 256),
    );
    if !description.tags.is_empty() {
        metadata.insert("tags".to_string(), description.tags.join(", "));
    }

    EmbeddingRecord {
        vector_id: vector_id.to_string(),
        text: text_parts.join("\n"),
        metadata,
    }
}
