//! Configuration management for Casetrace services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{env}.toml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// OCR configuration (local engine + cloud analysis)
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Structured extraction (LLM) configuration
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Job store backend: redis or memory
    #[serde(default = "default_queue_backend")]
    pub backend: String,

    /// Redis URL for the durable job store
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix for namespacing queue keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Minimum worker concurrency
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,

    /// Maximum worker concurrency
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Memory budget per in-flight job, in megabytes
    #[serde(default = "default_per_job_memory_mb")]
    pub per_job_memory_mb: u64,

    /// Idle poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Heartbeat interval for active jobs, in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// A claimed job whose heartbeat is older than this is stalled
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,

    /// Scheduler wake-up interval in seconds
    #[serde(default = "default_scheduler_poll_secs")]
    pub scheduler_poll_secs: u64,

    /// Default attempt ceiling for jobs
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Default exponential backoff base in seconds
    #[serde(default = "default_backoff_base_secs")]
    pub default_backoff_base_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OcrConfig {
    /// Whether the local OCR engine is attempted before cloud analysis
    #[serde(default = "default_local_enabled")]
    pub local_enabled: bool,

    /// Tesseract binary
    #[serde(default = "default_tesseract_cmd")]
    pub tesseract_cmd: String,

    /// pdftoppm binary used to rasterize single-page PDFs
    #[serde(default = "default_pdftoppm_cmd")]
    pub pdftoppm_cmd: String,

    /// OCR language
    #[serde(default = "default_ocr_language")]
    pub language: String,

    /// Rasterization resolution
    #[serde(default = "default_ocr_dpi")]
    pub dpi: u32,

    /// S3 bucket Textract reads analysis input from
    pub s3_bucket: Option<String>,

    /// Key prefix inside the bucket
    #[serde(default = "default_s3_prefix")]
    pub s3_prefix: String,

    /// Polling interval for asynchronous analysis jobs, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Attempt ceiling for analysis polling before the page fails
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai or compatible
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for the embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries per embedding call
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionConfig {
    /// API key for the chat-completion service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_extraction_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,

    /// Number of nearest pages (including the page itself) in the
    /// extraction context window
    #[serde(default = "default_context_pages")]
    pub context_pages: usize,

    /// Upper bound on assembled context size, in characters
    #[serde(default = "default_context_chars")]
    pub max_context_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Case-tick interval: how often "process next pending case" fires
    #[serde(default = "default_case_tick_secs")]
    pub case_tick_secs: u64,

    /// Source document download timeout in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Ceiling on total retry time for source document downloads
    #[serde(default = "default_download_max_elapsed")]
    pub download_max_elapsed_secs: u64,
}

// Default value functions
fn default_max_connections() -> u32 { 50 }
fn default_min_connections() -> u32 { 5 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_queue_backend() -> String { "redis".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "casetrace".to_string() }
fn default_min_concurrency() -> usize { 1 }
fn default_max_concurrency() -> usize { 8 }
fn default_per_job_memory_mb() -> u64 { 256 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_heartbeat_secs() -> u64 { 10 }
fn default_stall_threshold_secs() -> u64 { 60 }
fn default_scheduler_poll_secs() -> u64 { 5 }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_secs() -> u64 { 5 }
fn default_local_enabled() -> bool { true }
fn default_tesseract_cmd() -> String { "tesseract".to_string() }
fn default_pdftoppm_cmd() -> String { "pdftoppm".to_string() }
fn default_ocr_language() -> String { "eng".to_string() }
fn default_ocr_dpi() -> u32 { 300 }
fn default_s3_prefix() -> String { "casetrace/pages".to_string() }
fn default_poll_interval_secs() -> u64 { 120 }
fn default_max_poll_attempts() -> u32 { 10 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_provider_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_extraction_model() -> String { "gpt-4o-mini".to_string() }
fn default_extraction_timeout() -> u64 { 120 }
fn default_context_pages() -> usize { 4 }
fn default_context_chars() -> usize { 24_000 }
fn default_case_tick_secs() -> u64 { 60 }
fn default_download_timeout() -> u64 { 60 }
fn default_download_max_elapsed() -> u64 { 120 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            per_job_memory_mb: default_per_job_memory_mb(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            scheduler_poll_secs: default_scheduler_poll_secs(),
            default_max_attempts: default_max_attempts(),
            default_backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            local_enabled: default_local_enabled(),
            tesseract_cmd: default_tesseract_cmd(),
            pdftoppm_cmd: default_pdftoppm_cmd(),
            language: default_ocr_language(),
            dpi: default_ocr_dpi(),
            s3_bucket: None,
            s3_prefix: default_s3_prefix(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_provider_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: None,
            model: default_extraction_model(),
            timeout_secs: default_extraction_timeout(),
            context_pages: default_context_pages(),
            max_context_chars: default_context_chars(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            case_tick_secs: default_case_tick_secs(),
            download_timeout_secs: default_download_timeout(),
            download_max_elapsed_secs: default_download_max_elapsed(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__DATABASE__URL=postgres://...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }

    /// Analysis polling interval as a Duration
    pub fn ocr_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ocr.poll_interval_secs)
    }

    /// Case-tick interval as a Duration
    pub fn case_tick_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.case_tick_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/casetrace".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            queue: QueueConfig::default(),
            ocr: OcrConfig::default(),
            embedding: EmbeddingConfig::default(),
            extraction: ExtractionConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.ocr.poll_interval_secs, 120);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/casetrace");
    }

    #[test]
    fn test_poll_interval_duration() {
        let config = AppConfig::default();
        assert_eq!(config.ocr_poll_interval(), Duration::from_secs(120));
    }
}
