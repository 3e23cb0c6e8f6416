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
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default()
    }
}

/// Gemini `generateContent` / `streamGenerateContent`.
///
/// Streaming asks for SSE (`alt=sse`) but bare JSON lines are accepted too,
/// including the array framing `[`, `,` and `]`.
pub struct GeminiAdapter {
    client: Client,
    settings: ProviderSettings,
}

impl GeminiAdapter {
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

                let payload = sse_data(&line)
                    .unwrap_or(&line)
                    .trim()
                    .trim_start_matches(['[', ','])
                    .trim_end_matches([']', ','])
                    .trim();
                if payload.is_empty() || !payload.starts_with('{') {
                    continue;
                }

                match serde_json::from_str::<GenerateContentResponse>(payload) {
                    Ok(chunk) => {
                        let text = chunk.text();
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        // Pretty-printed bodies split objects across lines
                        debug!("Skipping partial gemini line: {}", e);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        self.settings.kind.as_str()
    }

    fn is_enabled(&self) -> bool {
        self.settings.is_enabled()
    }

    async fn generate(&self, params: &GenerateParams) -> Result<Generation, ProviderError> {
        let api_key = self.settings.require_key()?;
        let model = self.settings.model_for(params);
        let request = GenerateContentRequest {
            contents: vec![Content { role: "user", parts: vec![Part { text: &params.prompt }] }],
            generation_config: GenerationConfig {
                temperature: self.settings.temperature_for(params),
                max_output_tokens: self.settings.max_tokens_for(params),
            },
        };

        let url = if params.stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.settings.base_url, model
            )
        } else {
            format!("{}/v1beta/models/{}:generateContent", self.settings.base_url, model)
        };
        debug!("gemini request: model={}, stream={}", model, params.stream);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        if params.stream {
            return Ok(Generation::Stream(Self::parse_stream(response)));
        }

        let body: GenerateContentResponse = response.json().await?;
        Ok(Generation::Text(body.text()))
    }
}
