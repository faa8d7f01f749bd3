use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extract::{MIME_DOCX, MIME_MARKDOWN, MIME_PDF, MIME_PPTX, MIME_TEXT};
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the original uploaded bytes.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            allowed_types: default_allowed_types(),
        }
    }
}

fn default_max_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_allowed_types() -> Vec<String> {
    [MIME_PDF, MIME_TEXT, MIME_MARKDOWN, MIME_DOCX, MIME_PPTX]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    200
}
fn default_overlap() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent embedding requests per ingestion run.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_workers() -> usize {
    4
}
fn default_embedding_retries() -> u32 {
    3
}
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_retries: default_llm_retries(),
            timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
        }
    }
}

fn default_llm_retries() -> u32 {
    2
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_prompt_budget")]
    pub prompt_budget_chars: usize,
    /// Turns of history offered to prompt assembly.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            prompt_budget_chars: default_prompt_budget(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_prompt_budget() -> usize {
    12_000
}
fn default_history_turns() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_chats")]
    pub max_chats: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_chats: default_max_chats(),
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_chats() -> usize {
    1024
}
fn default_max_turns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_extract_timeout")]
    pub extract_timeout_secs: u64,
    /// Base delay between retries of transient provider errors.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extract_timeout_secs: default_extract_timeout(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

fn default_extract_timeout() -> u64 {
    60
}
fn default_retry_backoff() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Config {
    pub fn embedding_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.embedding.max_retries,
            Duration::from_secs(self.embedding.timeout_secs),
            Duration::from_millis(self.ingest.retry_backoff_ms),
        )
    }

    pub fn llm_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.llm.max_retries,
            Duration::from_secs(self.llm.timeout_secs),
            Duration::from_millis(self.ingest.retry_backoff_ms),
        )
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.extract_timeout_secs)
    }

    /// Check cross-field constraints. Called by [`load_config`] and
    /// [`parse_config`].
    pub fn validate(&self) -> Result<()> {
        if self.upload.max_bytes == 0 {
            bail!("upload.max_bytes must be > 0");
        }
        if self.upload.allowed_types.is_empty() {
            bail!("upload.allowed_types must not be empty");
        }

        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be < chunking.max_tokens");
        }

        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }
        if self.retrieval.prompt_budget_chars == 0 {
            bail!("retrieval.prompt_budget_chars must be > 0");
        }

        if self.cache.max_chats == 0 {
            bail!("cache.max_chats must be > 0");
        }
        if self.cache.max_turns == 0 {
            bail!("cache.max_turns must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.workers == 0 {
            bail!("embedding.workers must be > 0");
        }

        match self.llm.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.llm.provider != "disabled" && self.llm.model.is_none() {
            bail!(
                "llm.model must be specified when provider is '{}'",
                self.llm.provider
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
