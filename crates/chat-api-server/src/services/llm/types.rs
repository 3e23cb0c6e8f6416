use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Incremental text fragments produced by a provider
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {0} is not configured")]
    Disabled(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Decode(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("No providers available")]
    NoProvidersAvailable,

    #[error("All providers failed")]
    AllProvidersFailed { last_error: Option<String> },
}

/// The closed set of supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    DeepSeek,
    Anthropic,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini-2.0-flash-exp",
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Anthropic => "claude-3-7-sonnet-latest",
            ProviderKind::Ollama => "llama3",
        }
    }

    /// Environment variable holding the key when config leaves it blank
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    /// Whether a caller-requested model id belongs to this backend
    pub fn accepts_model(&self, model: &str) -> bool {
        let model = model.trim().to_ascii_lowercase();
        match self {
            ProviderKind::Gemini => model.starts_with("gemini"),
            ProviderKind::OpenAi => ["gpt-", "o1", "o3", "o4"].iter().any(|p| model.starts_with(p)),
            ProviderKind::DeepSeek => model.starts_with("deepseek"),
            ProviderKind::Anthropic => model.starts_with("claude"),
            ProviderKind::Ollama => !model.is_empty(),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "openai" => Ok(ProviderKind::OpenAi),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(format!("unknown provider kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateParams {
    pub prompt: String,
    pub stream: bool,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Default::default() }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// What an adapter hands back: a whole answer or a fragment stream
pub enum Generation {
    Text(String),
    Stream(TextStream),
}

impl Generation {
    /// Drain into a single string
    pub async fn collect(self) -> Result<String, ProviderError> {
        match self {
            Generation::Text(text) => Ok(text),
            Generation::Stream(mut fragments) => {
                let mut text = String::new();
                while let Some(fragment) = fragments.next().await {
                    text.push_str(&fragment?);
                }
                Ok(text)
            }
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Generation::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Uniform wrapper around one LLM backend.
///
/// Adapters surface every transport or API error as-is. Retry and fallback
/// belong to the router.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// True iff the credentials/config this backend needs are present
    fn is_enabled(&self) -> bool;

    async fn generate(&self, params: &GenerateParams) -> Result<Generation, ProviderError>;
}
