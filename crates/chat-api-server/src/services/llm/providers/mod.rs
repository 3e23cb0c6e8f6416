pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiCompatibleAdapter;

use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{GenerateParams, ProviderAdapter, ProviderError, ProviderKind};
use crate::config::{LlmConfig, ProviderConfig};

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Provider entry after defaults and environment fallbacks are applied
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub enabled: Option<bool>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ProviderSettings {
    pub fn resolve(kind: ProviderKind, entry: &ProviderConfig, llm: &LlmConfig) -> Self {
        let api_key = Some(entry.api_key.trim().to_string())
            .filter(|key| !key.is_empty())
            .or_else(|| {
                kind.api_key_env()
                    .and_then(|var| std::env::var(var).ok())
                    .map(|key| key.trim().to_string())
                    .filter(|key| !key.is_empty())
            });

        let enabled = match (kind, entry.enabled) {
            (ProviderKind::Ollama, None) => Some(
                std::env::var("OLLAMA_ENABLED")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            ),
            (_, flag) => flag,
        };

        let base_url = if entry.base_url.trim().is_empty() {
            kind.default_base_url().to_string()
        } else {
            entry.base_url.trim().trim_end_matches('/').to_string()
        };

        let model = if entry.model.trim().is_empty() {
            kind.default_model().to_string()
        } else {
            entry.model.trim().to_string()
        };

        Self {
            kind,
            api_key,
            base_url,
            model,
            enabled,
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        }
    }

    /// Keyed backends need a key and no explicit `enabled = false`; ollama
    /// needs an explicit opt-in.
    pub fn is_enabled(&self) -> bool {
        match self.kind {
            ProviderKind::Ollama => self.enabled.unwrap_or(false),
            _ => self.enabled.unwrap_or(true) && self.api_key.is_some(),
        }
    }

    /// The requested model when it belongs to this backend, else the configured one
    pub fn model_for(&self, params: &GenerateParams) -> String {
        params
            .model
            .as_deref()
            .filter(|model| self.kind.accepts_model(model))
            .map(str::to_string)
            .unwrap_or_else(|| self.model.clone())
    }

    pub fn temperature_for(&self, params: &GenerateParams) -> f32 {
        params.temperature.unwrap_or(self.temperature)
    }

    pub fn max_tokens_for(&self, params: &GenerateParams) -> u32 {
        params.max_tokens.unwrap_or(self.max_tokens)
    }

    pub fn require_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Disabled(self.kind.to_string()))
    }
}

/// Construct every configured adapter once, in priority order
pub fn build_providers(config: &LlmConfig) -> Result<Vec<Arc<dyn ProviderAdapter>>, ProviderError> {
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    for entry in &config.providers {
        let kind = match entry.kind.parse::<ProviderKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Skipping provider entry: {}", e);
                continue;
            }
        };

        let settings = ProviderSettings::resolve(kind, entry, config);
        let adapter: Arc<dyn ProviderAdapter> = match kind {
            ProviderKind::OpenAi | ProviderKind::DeepSeek => {
                Arc::new(OpenAiCompatibleAdapter::new(settings)?)
            }
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(settings)?),
            ProviderKind::Gemini => Arc::new(GeminiAdapter::new(settings)?),
            ProviderKind::Ollama => Arc::new(OllamaAdapter::new(settings)?),
        };

        info!(
            provider = adapter.name(),
            enabled = adapter.is_enabled(),
            "Registered LLM provider"
        );
        adapters.push(adapter);
    }

    Ok(adapters)
}

/// Shared client; the router owns timeouts, so only connecting is bounded here
pub(crate) fn http_client() -> Result<Client, ProviderError> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Turn a non-2xx response into `ProviderError::Api`
pub(crate) async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_config(providers: Vec<ProviderConfig>) -> LlmConfig {
        serde_json::from_value(serde_json::json!({ "providers": [] }))
            .map(|mut config: LlmConfig| {
                config.providers = providers;
                config
            })
            .unwrap()
    }

    fn entry(kind: &str, api_key: &str, enabled: Option<bool>) -> ProviderConfig {
        ProviderConfig {
            kind: kind.to_string(),
            enabled,
            api_key: api_key.to_string(),
            base_url: String::new(),
            model: String::new(),
        }
    }

    #[test]
    fn test_keyed_provider_enabled_by_key() {
        let llm = llm_config(vec![]);
        let with_key = ProviderSettings::resolve(ProviderKind::OpenAi, &entry("openai", "sk-1", None), &llm);
        assert!(with_key.is_enabled());
        assert_eq!(with_key.base_url, "https://api.openai.com/v1");
        assert_eq!(with_key.model, "gpt-4o-mini");

        let switched_off = ProviderSettings::resolve(ProviderKind::OpenAi, &entry("openai", "sk-1", Some(false)), &llm);
        assert!(!switched_off.is_enabled());
    }

    #[test]
    fn test_ollama_requires_opt_in() {
        let llm = llm_config(vec![]);
        let on = ProviderSettings::resolve(ProviderKind::Ollama, &entry("ollama", "", Some(true)), &llm);
        assert!(on.is_enabled());

        let off = ProviderSettings::resolve(ProviderKind::Ollama, &entry("ollama", "", Some(false)), &llm);
        assert!(!off.is_enabled());
    }

    #[test]
    fn test_model_for_ignores_foreign_models() {
        let llm = llm_config(vec![]);
        let settings = ProviderSettings::resolve(ProviderKind::DeepSeek, &entry("deepseek", "k", None), &llm);

        let mut params = GenerateParams::new("hi");
        params.model = Some("gpt-4o".to_string());
        assert_eq!(settings.model_for(&params), "deepseek-chat");

        params.model = Some("deepseek-reasoner".to_string());
        assert_eq!(settings.model_for(&params), "deepseek-reasoner");
    }

    #[test]
    fn test_build_providers_keeps_order_and_skips_unknown() {
        let llm = llm_config(vec![
            entry("anthropic", "a", None),
            entry("mystery", "x", None),
            entry("gemini", "g", None),
            entry("ollama", "", Some(false)),
        ]);

        let adapters = build_providers(&llm).unwrap();
        let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();

        assert_eq!(names, vec!["anthropic", "gemini", "ollama"]);
        assert!(adapters[0].is_enabled());
        assert!(!adapters[2].is_enabled());
    }
}
