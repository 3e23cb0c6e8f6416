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

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: String,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Server-sent events of the messages API; only the ones carrying text or
/// ending the stream matter here
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEventBody {
    ContentBlockDelta { delta: DeltaBody },
    MessageStop,
    Error { error: ErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct AnthropicAdapter {
    client: Client,
    settings: ProviderSettings,
}

impl AnthropicAdapter {
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

                match serde_json::from_str::<StreamEventBody>(data) {
                    Ok(StreamEventBody::ContentBlockDelta { delta }) => {
                        if let Some(text) = delta.text {
                            yield Ok(text);
                        }
                    }
                    Ok(StreamEventBody::MessageStop) => return,
                    Ok(StreamEventBody::Error { error }) => {
                        yield Err(ProviderError::Api { status: 500, body: error.message });
                        return;
                    }
                    Ok(StreamEventBody::Other) => {}
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
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        self.settings.kind.as_str()
    }

    fn is_enabled(&self) -> bool {
        self.settings.is_enabled()
    }

    async fn generate(&self, params: &GenerateParams) -> Result<Generation, ProviderError> {
        let api_key = self.settings.require_key()?;
        let request = MessagesRequest {
            model: self.settings.model_for(params),
            max_tokens: self.settings.max_tokens_for(params),
            temperature: self.settings.temperature_for(params),
            stream: params.stream,
            messages: vec![RequestMessage { role: "user", content: &params.prompt }],
        };
        debug!("anthropic request: model={}, stream={}", request.model, request.stream);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.settings.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        if params.stream {
            return Ok(Generation::Stream(Self::parse_stream(response)));
        }

        let body: MessagesResponse = response.json().await?;
        let text = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<String>();
        Ok(Generation::Text(text))
    }
}
