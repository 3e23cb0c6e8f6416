use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, anything else prints pretty logs
    pub format: String,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,chat_api_server=debug".to_string(),
            format: "pretty".to_string(),
            directory: "logs".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    /// Empty url selects the in-process cache tier
    pub url: String,
    pub pool_max_size: usize,
    pub ttl_seconds: u64,
    pub max_cached_messages: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_max_size: 16,
            ttl_seconds: 7 * 24 * 60 * 60,
            max_cached_messages: 100,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_hedge_delay_ms")]
    pub hedge_delay_ms: u64,
    #[serde(default = "default_routing_strategy")]
    pub routing_strategy: String,
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Priority order is fallback order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_hedge_delay_ms() -> u64 {
    250
}

fn default_routing_strategy() -> String {
    "primary".to_string()
}

fn default_chunk_max_chars() -> usize {
    40
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    pub kind: String,
    /// Unset means "enabled when credentials are present"
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub template_id: String,
    pub max_context_chars: usize,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub message_max_chars: usize,
    pub batch_size: usize,
    pub assistant_name: String,
    pub request_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.getzep.com/api/v2".to_string(),
            api_key: String::new(),
            template_id: "companion-agent-context".to_string(),
            max_context_chars: 4000,
            max_retries: 2,
            initial_retry_delay_ms: 500,
            message_max_chars: 2500,
            batch_size: 30,
            assistant_name: "Neo".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl MemoryConfig {
    /// Key from config, falling back to `ZEP_API_KEY`
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var("ZEP_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatConfig {
    pub history_limit: usize,
    pub title_delay_ms: u64,
    pub title_max_chars: usize,
    pub assistant_system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            title_delay_ms: 3000,
            title_max_chars: 50,
            assistant_system_prompt: crate::services::agent::DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
