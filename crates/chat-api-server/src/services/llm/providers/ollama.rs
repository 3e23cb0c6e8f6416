use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_success, http_client, ProviderSettings};
use crate::services::llm::lines::body_lines;
use crate::services::llm::types::{
    GenerateParams, Generation, ProviderAdapter, ProviderError, TextStream,
};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: String,
    prompt: &'a str,
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Local ollama daemon, `/api/generate` with JSON-lines streaming
pub struct OllamaAdapter {
    client: Client,
    settings: ProviderSettings,
}

impl OllamaAdapter {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self { client: http_client()?, settings })
    }

    fn parse_stream(response: reqwest::Response) -> TextStream {
        let mut lines = body_lines(response.bytes_stream());

        Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<GenerateChunk>(&line) {
                    Ok(GenerateChunk { error: Some(message), .. }) => {
                        yield Err(ProviderError::Api { status: 500, body: message });
                        return;
                    }
                    Ok(chunk) => {
                        if !chunk.response.is_empty() {
                            yield Ok(chunk.response);
                        }
                        if chunk.done {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        self.settings.kind.as_str()
    }

    fn is_enabled(&self) -> bool {
        self.settings.is_enabled()
    }

    async fn generate(&self, params: &GenerateParams) -> Result<Generation, ProviderError> {
        let request = GenerateRequest {
            model: self.settings.model_for(params),
            prompt: &params.prompt,
            stream: params.stream,
            options: Options {
                temperature: self.settings.temperature_for(params),
                num_predict: self.settings.max_tokens_for(params),
            },
        };
        debug!("ollama request: model={}, stream={}", request.model, request.stream);

        let response = self
            .client
            .post(format!("{}/api/generate", self.settings.base_url))
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        if params.stream {
            return Ok(Generation::Stream(Self::parse_stream(response)));
        }

        let body: GenerateChunk = response.json().await?;
        match body.error {
            Some(message) => Err(ProviderError::Api { status: 500, body: message }),
            None => Ok(Generation::Text(body.response)),
        }
    }
}
