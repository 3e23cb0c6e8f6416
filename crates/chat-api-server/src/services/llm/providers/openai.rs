use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_success, http_client, ProviderSettings};
use crate::services::llm::lines::{body_lines, sse_data};
use crate::services::llm::types::{
    GenerateParams, Generation, ProviderAdapter, ProviderError, TextStream,
};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: String,
    messages: Vec<RequestMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI chat-completions API. DeepSeek speaks the same protocol, so the
/// same adapter serves both with a different base url.
pub struct OpenAiCompatibleAdapter {
    client: Client,
    settings: ProviderSettings,
}

impl OpenAiCompatibleAdapter {
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
                let Some(data) = sse_data(&line) else { continue };
                if data == "[DONE]" {
                    return;
                }
                match serde_json::from_str::<ChatCompletionChunk>(data) {
                    Ok(chunk) => {
                        if let Some(content) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                            yield Ok(content);
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
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        self.settings.kind.as_str()
    }

    fn is_enabled(&self) -> bool {
        self.settings.is_enabled()
    }

    async fn generate(&self, params: &GenerateParams) -> Result<Generation, ProviderError> {
        let api_key = self.settings.require_key()?;
        let request = ChatCompletionRequest {
            model: self.settings.model_for(params),
            messages: vec![RequestMessage { role: "user", content: &params.prompt }],
            max_tokens: self.settings.max_tokens_for(params),
            temperature: self.settings.temperature_for(params),
            stream: params.stream,
        };
        debug!("{} request: model={}, stream={}", self.name(), request.model, request.stream);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        if params.stream {
            return Ok(Generation::Stream(Self::parse_stream(response)));
        }

        let body: ChatCompletionResponse = response.json().await?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Decode("no choices returned".to_string()))?;
        Ok(Generation::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, ProviderConfig};
    use crate::services::llm::types::ProviderKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(kind: ProviderKind, base_url: &str) -> OpenAiCompatibleAdapter {
        let llm: LlmConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        let entry = ProviderConfig {
            kind: kind.to_string(),
            enabled: None,
            api_key: "sk-test".to_string(),
            base_url: base_url.to_string(),
            model: String::new(),
        };
        OpenAiCompatibleAdapter::new(ProviderSettings::resolve(kind, &entry, &llm)).unwrap()
    }

    #[tokio::test]
    async fn test_stream_parses_sse_deltas() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let generation = adapter(ProviderKind::OpenAi, &server.uri())
            .generate(&GenerateParams::new("hi").streaming(true))
            .await
            .unwrap();

        assert!(matches!(generation, Generation::Stream(_)));
        assert_eq!(generation.collect().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_non_stream_reads_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "Hi there" } }]
            })))
            .mount(&server)
            .await;

        let adapter = adapter(ProviderKind::DeepSeek, &server.uri());
        assert_eq!(adapter.name(), "deepseek");

        let generation = adapter.generate(&GenerateParams::new("hi")).await.unwrap();
        assert_eq!(generation.collect().await.unwrap(), "Hi there");
    }

    #[tokio::test]
    async fn test_http_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
            .mount(&server)
            .await;

        let err = adapter(ProviderKind::OpenAi, &server.uri())
            .generate(&GenerateParams::new("hi").streaming(true))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Api { status: 429, .. }));
    }
}
