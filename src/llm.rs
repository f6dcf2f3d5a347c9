//! Gemini collaborators: image description for the captioning loop and the
//! answer-generation contract consumed by the query layer.
//!
//! Both calls use a fixed attempt count with no backoff and no payload
//! mutation between attempts; an empty or malformed response counts as a
//! failed attempt. Model responses are expected to be JSON (vision) or plain
//! text (answers), and the JSON is extracted strictly — code fences are
//! stripped and the first `{...}` object is parsed, nothing more lenient.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::warn;

use crate::classify::guess_mime;
use crate::config::GeminiConfig;

const ANSWER_SYSTEM_PROMPT: &str = "You are a digital forensics analyst assistant. Answer the \
investigator's question from the structured evidence snippets provided, citing evidence \
identifiers in square brackets (e.g. [msg:messages.sqlite:message:42]). If the evidence is \
insufficient, say so and suggest next steps.";

const VISION_SYSTEM_PROMPT: &str = "You analyze digital evidence images for investigators. Keep \
descriptions concise, objective, and forensically appropriate.";

const VISION_USER_PROMPT: &str = "Provide a JSON object with keys caption (<=40 word string), \
tags (array of up to 6 short descriptive strings), and detected_text (string of any prominent \
on-image text or null).";

/// Structured result of one vision call.
#[derive(Debug, Clone)]
pub struct ImageDescription {
    pub caption: String,
    pub tags: Vec<String>,
    pub detected_text: Option<String>,
}

#[async_trait]
pub trait VisionClient: Send + Sync {
    fn is_enabled(&self) -> bool;
    /// Describe one image. Errors when the image is unreadable or the model
    /// keeps returning empty/malformed output across the bounded retries.
    async fn describe_image(&self, path: &Path) -> Result<ImageDescription>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Turn retrieved evidence sections into a natural-language answer.
    /// `conversation` carries prior (role, message) turns.
    async fn generate_answer(
        &self,
        question: &str,
        context_sections: &[String],
        conversation: &[(String, String)],
    ) -> Result<String>;
}

/// Vision captioner over the Gemini `generateContent` REST endpoint.
pub struct GeminiVision {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    attempts: u32,
    temperature: f64,
    max_output_tokens: u32,
}

impl GeminiVision {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            client: http_client(config.timeout_secs),
            api_key: config.resolved_api_key(),
            model: normalize_model_name(&config.vision_model),
            attempts: config.retry_attempts,
            temperature: config.vision_temperature,
            max_output_tokens: config.vision_max_output_tokens,
        }
    }
}

#[async_trait]
impl VisionClient for GeminiVision {
    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn describe_image(&self, path: &Path) -> Result<ImageDescription> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Gemini API key is not configured"))?;

        let image_bytes = std::fs::read(path)
            .with_context(|| format!("image not found: {}", path.display()))?;
        let mime_type = guess_mime(path).unwrap_or("image/jpeg");

        let payload = json!({
            "system_instruction": {"parts": [{"text": VISION_SYSTEM_PROMPT}]},
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": VISION_USER_PROMPT},
                    {"inline_data": {
                        "mime_type": mime_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(&image_bytes),
                    }},
                ],
            }],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            },
        });

        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 1..=self.attempts {
            match generate_content(&self.client, api_key, &self.model, &payload).await {
                Ok(text) => match parse_image_description(&text) {
                    Ok(description) => return Ok(description),
                    Err(e) => {
                        warn!(
                            "vision response unusable (attempt {attempt}/{}): {e}",
                            self.attempts
                        );
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(
                        "vision request failed (attempt {attempt}/{}): {e}",
                        self.attempts
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("vision request failed")))
    }
}

/// Answer generator over the same REST endpoint.
pub struct GeminiAnswerer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    attempts: u32,
    temperature: f64,
    max_output_tokens: u32,
}

impl GeminiAnswerer {
    pub fn new(config: &GeminiConfig) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| anyhow::anyhow!("Gemini API key is not configured"))?;
        Ok(Self {
            client: http_client(config.timeout_secs),
            api_key,
            model: normalize_model_name(&config.model),
            attempts: config.retry_attempts,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

#[async_trait]
impl AnswerGenerator for GeminiAnswerer {
    async fn generate_answer(
        &self,
        question: &str,
        context_sections: &[String],
        conversation: &[(String, String)],
    ) -> Result<String> {
        let mut contents: Vec<Value> = conversation
            .iter()
            .map(|(role, message)| {
                let gemini_role = match role.to_lowercase().as_str() {
                    "assistant" | "model" => "model",
                    _ => "user",
                };
                json!({"role": gemini_role, "parts": [{"text": message}]})
            })
            .collect();

        let context_block = if context_sections.is_empty() {
            "No additional context provided.".to_string()
        } else {
            context_sections.join("\n\n")
        };
        contents.push(json!({
            "role": "user",
            "parts": [{"text": format!(
                "Context:\n{context_block}\n\nQuestion: {question}\n\n\
                 Respond clearly and reference evidence IDs in square brackets when applicable."
            )}],
        }));

        let payload = json!({
            "system_instruction": {"parts": [{"text": ANSWER_SYSTEM_PROMPT}]},
            "contents": contents,
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            },
        });

        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 1..=self.attempts {
            match generate_content(&self.client, &self.api_key, &self.model, &payload).await {
                Ok(text) => return Ok(text.trim().to_string()),
                Err(e) => {
                    warn!(
                        "answer request failed (attempt {attempt}/{}): {e}",
                        self.attempts
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("answer request failed")))
    }
}

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// One `generateContent` round trip, returning the concatenated text parts.
/// An empty response is an error so the bounded retry loop can count it.
async fn generate_content(
    client: &reqwest::Client,
    api_key: &str,
    model: &str,
    payload: &Value,
) -> Result<String> {
    let url = format!("https://generativelanguage.googleapis.com/v1beta/{model}:generateContent");
    let response = client
        .post(&url)
        .header("x-goog-api-key", api_key)
        .json(payload)
        .send()
        .await
        .context("Gemini request failed")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("Gemini API error {status}: {body}");
    }

    let body: Value = response.json().await?;
    let text = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        bail!("Gemini returned an empty response");
    }
    Ok(text)
}

fn normalize_model_name(model: &str) -> String {
    let trimmed = model.trim().trim_start_matches("models/");
    format!("models/{trimmed}")
}

fn parse_image_description(raw: &str) -> Result<ImageDescription> {
    let payload = parse_structured_json(raw)?;
    let caption = payload
        .get("caption")
        .or_else(|| payload.get("description"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("caption missing from vision response"))?
        .trim()
        .to_string();

    let tags = normalize_tags(payload.get("tags"));

    let detected_text = match payload.get("detected_text").or_else(|| payload.get("ocr")) {
        Some(Value::Array(parts)) => {
            let joined = parts
                .iter()
                .filter_map(|part| part.as_str())
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            (!joined.is_empty()).then_some(joined)
        }
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    };

    Ok(ImageDescription {
        caption,
        tags,
        detected_text,
    })
}

/// Extract the JSON object from a model response that may be wrapped in a
/// markdown code fence or surrounded by prose.
fn parse_structured_json(raw: &str) -> Result<Value> {
    let mut text = raw.trim();
    if text.is_empty() {
        bail!("response was empty");
    }

    if text.starts_with("```") {
        if let Some(newline) = text.find('\n') {
            text = &text[newline + 1..];
        }
        text = text.trim();
        if let Some(stripped) = text.strip_suffix("```") {
            text = stripped.trim_end();
        }
    }

    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("no JSON object found in response"))?;
    let end = text
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow::anyhow!("no JSON object found in response"))?;

    serde_json::from_str(&text[start..=end]).context("response JSON did not parse")
}

fn normalize_tags(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(text)) => text
            .split(['\n', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|item| !item.is_empty())
            .collect(),
        Some(other) => vec![other.to_string()],
    }
}
