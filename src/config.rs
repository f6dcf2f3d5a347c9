use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub uploads_dir: PathBuf,
    pub extracted_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_graph_url")]
    pub url: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default = "default_graph_password")]
    pub password: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_graph_url(),
            user: default_graph_user(),
            password: default_graph_password(),
            database: default_graph_database(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_graph_url() -> String {
    "http://localhost:7474".to_string()
}
fn default_graph_user() -> String {
    "neo4j".to_string()
}
fn default_graph_password() -> String {
    "neo4j".to_string()
}
fn default_graph_database() -> String {
    "neo4j".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vector_url")]
    pub url: String,
    #[serde(default = "default_vector_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_vector_url(),
            collection: default_vector_collection(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_vector_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_vector_collection() -> String {
    "ufdr".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 16,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    5
}

/// Gemini settings shared by the vision captioner and the answer generator.
#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    /// Falls back to the `GEMINI_API_KEY` environment variable when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_answer_model")]
    pub model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_answer_temperature")]
    pub temperature: f64,
    #[serde(default = "default_vision_temperature")]
    pub vision_temperature: f64,
    #[serde(default = "default_answer_max_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_vision_max_tokens")]
    pub vision_max_output_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_answer_model(),
            vision_model: default_vision_model(),
            retry_attempts: default_retry_attempts(),
            temperature: default_answer_temperature(),
            vision_temperature: default_vision_temperature(),
            max_output_tokens: default_answer_max_tokens(),
            vision_max_output_tokens: default_vision_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GeminiConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

fn default_answer_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_vision_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_answer_temperature() -> f64 {
    0.2
}
fn default_vision_temperature() -> f64 {
    0.1
}
fn default_answer_max_tokens() -> u32 {
    1024
}
fn default_vision_max_tokens() -> u32 {
    512
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.gemini.retry_attempts == 0 {
        anyhow::bail!("gemini.retry_attempts must be >= 1");
    }

    Ok(config)
}
