use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default = "default_server")]
    pub server: ServerConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default = "default_provider_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_provider_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != "disabled"
    }
}

fn default_provider_kind() -> String {
    "gemini".to_string()
}
fn default_provider_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_provider_timeout() -> u64 {
    600
}

/// One model the fallback executor may try. Lower `priority` runs first.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub id: String,
    pub priority: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.2
}

/// Output-token ceilings by document complexity.
#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    #[serde(default = "default_small_doc_pages")]
    pub small_doc_max_pages: i64,
    #[serde(default = "default_small_doc_tokens")]
    pub small_doc_max_output_tokens: u32,
    #[serde(default = "default_large_doc_tokens")]
    pub large_doc_max_output_tokens: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            small_doc_max_pages: default_small_doc_pages(),
            small_doc_max_output_tokens: default_small_doc_tokens(),
            large_doc_max_output_tokens: default_large_doc_tokens(),
        }
    }
}

impl TokenConfig {
    pub fn max_output_tokens_for(&self, page_count: i64) -> u32 {
        if page_count <= self.small_doc_max_pages {
            self.small_doc_max_output_tokens
        } else {
            self.large_doc_max_output_tokens
        }
    }
}

fn default_small_doc_pages() -> i64 {
    200
}
fn default_small_doc_tokens() -> u32 {
    32_768
}
fn default_large_doc_tokens() -> u32 {
    65_536
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_above_pages")]
    pub enabled_above_pages: i64,
    #[serde(default = "default_chunk_above_bytes")]
    pub enabled_above_bytes: i64,
    #[serde(default = "default_target_chunk_bytes")]
    pub target_chunk_bytes: i64,
    #[serde(default = "default_max_pages_per_chunk")]
    pub max_pages_per_chunk: i64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled_above_pages: default_chunk_above_pages(),
            enabled_above_bytes: default_chunk_above_bytes(),
            target_chunk_bytes: default_target_chunk_bytes(),
            max_pages_per_chunk: default_max_pages_per_chunk(),
        }
    }
}

impl ChunkingConfig {
    pub fn requires_chunking(&self, page_count: i64, byte_size: i64) -> bool {
        page_count > self.enabled_above_pages || byte_size > self.enabled_above_bytes
    }
}

fn default_chunk_above_pages() -> i64 {
    500
}
fn default_chunk_above_bytes() -> i64 {
    20 * 1024 * 1024
}
fn default_target_chunk_bytes() -> i64 {
    15 * 1024 * 1024
}
fn default_max_pages_per_chunk() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_upload_backoff")]
    pub backoff_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_upload_attempts(),
            backoff_secs: default_upload_backoff(),
            poll_interval_secs: default_poll_interval(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_upload_attempts() -> u32 {
    3
}
fn default_upload_backoff() -> u64 {
    2
}
fn default_poll_interval() -> u64 {
    5
}
fn default_poll_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Attempts per (chunk, stage) item before the map pass gives up.
    #[serde(default = "default_queue_attempts")]
    pub max_attempts: i64,
    /// How long a `start_analysis` call may hold a document in preparation
    /// before another caller can take over.
    #[serde(default = "default_preparation_lease")]
    pub preparation_lease_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_queue_attempts(),
            preparation_lease_secs: default_preparation_lease(),
        }
    }
}

fn default_queue_attempts() -> i64 {
    3
}
fn default_preparation_lease() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_stuck_after")]
    pub stuck_after_minutes: i64,
    #[serde(default = "default_throttle")]
    pub throttle_minutes: i64,
    #[serde(default = "default_monitor_max_pages")]
    pub max_pages: i64,
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stuck_after_minutes: default_stuck_after(),
            throttle_minutes: default_throttle(),
            max_pages: default_monitor_max_pages(),
            interval_secs: default_monitor_interval(),
        }
    }
}

fn default_stuck_after() -> i64 {
    30
}
fn default_throttle() -> i64 {
    60
}
fn default_monitor_max_pages() -> i64 {
    1000
}
fn default_monitor_interval() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_absolute_min_length")]
    pub absolute_min_length: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            absolute_min_length: default_absolute_min_length(),
        }
    }
}

fn default_absolute_min_length() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_notify_secret_env")]
    pub secret_env: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: default_notify_kind(),
            url: None,
            secret_env: default_notify_secret_env(),
        }
    }
}

fn default_notify_kind() -> String {
    "log".to_string()
}
fn default_notify_secret_env() -> String {
    "DOSSIER_WEBHOOK_SECRET".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_claim_backoff")]
    pub claim_backoff_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            claim_backoff_secs: default_claim_backoff(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_claim_backoff() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

fn default_server() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:7420".to_string(),
    }
}

/// One analysis stage. A unit is created per stage for every analyzed document.
#[derive(Debug, Deserialize, Clone)]
pub struct StageConfig {
    pub title: String,
    pub order: i64,
    pub prompt: String,
    #[serde(default)]
    pub system_instruction: String,
    /// Explicit schema kind; inferred from the title when absent.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub mandatory_keys: Option<Vec<String>>,
    #[serde(default)]
    pub min_length: Option<usize>,
}

impl Config {
    /// Active models in fallback order.
    pub fn active_models(&self) -> Vec<ModelConfig> {
        let mut models: Vec<ModelConfig> =
            self.models.iter().filter(|m| m.active).cloned().collect();
        models.sort_by_key(|m| m.priority);
        models
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.provider.kind.as_str() {
        "disabled" | "gemini" => {}
        other => anyhow::bail!(
            "Unknown provider kind: '{}'. Must be disabled or gemini.",
            other
        ),
    }

    if config.provider.is_enabled() && config.active_models().is_empty() {
        anyhow::bail!("at least one active [[models]] entry is required");
    }

    let mut seen_orders = HashSet::new();
    for stage in &config.stages {
        if stage.order < 1 {
            anyhow::bail!("stage '{}' must have order >= 1", stage.title);
        }
        if !seen_orders.insert(stage.order) {
            anyhow::bail!("duplicate stage order {}", stage.order);
        }
        if stage.prompt.trim().is_empty() {
            anyhow::bail!("stage '{}' has an empty prompt", stage.title);
        }
        if let Some(kind) = &stage.kind {
            if crate::stages::StageKind::from_identifier(kind).is_none() {
                anyhow::bail!("stage '{}' has unknown kind '{}'", stage.title, kind);
            }
        }
    }

    if config.chunking.target_chunk_bytes <= 0 || config.chunking.max_pages_per_chunk <= 0 {
        anyhow::bail!("chunking.target_chunk_bytes and chunking.max_pages_per_chunk must be > 0");
    }

    if config.upload.max_attempts == 0 {
        anyhow::bail!("upload.max_attempts must be >= 1");
    }

    if config.queue.max_attempts < 1 || config.queue.preparation_lease_secs < 1 {
        anyhow::bail!("queue.max_attempts and queue.preparation_lease_secs must be >= 1");
    }

    if config.monitor.stuck_after_minutes <= 0 || config.monitor.throttle_minutes <= 0 {
        anyhow::bail!("monitor thresholds must be > 0");
    }

    match config.notify.kind.as_str() {
        "log" => {}
        "webhook" => {
            if config.notify.url.is_none() {
                anyhow::bail!("notify.url must be set when notify.kind is 'webhook'");
            }
        }
        other => anyhow::bail!(
            "Unknown notify kind: '{}'. Must be log or webhook.",
            other
        ),
    }

    if config.dispatcher.workers == 0 {
        anyhow::bail!("dispatcher.workers must be >= 1");
    }

    Ok(())
}
