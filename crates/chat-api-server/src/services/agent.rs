use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::models::{ChatMessage, Role};
use crate::services::llm::{EventStream, GenerateParams, ProviderRouter, RouterError};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Neo, a warm and attentive companion. \
Keep answers clear and conversational, remember what the user has shared earlier in the \
conversation, and ask a short follow-up question when the request is ambiguous.";

/// Everything the model sees for one turn
#[derive(Debug, Clone, Default)]
pub struct ModelInput {
    /// Earlier messages, oldest first. System entries (memory) come first.
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub provider: String,
}

/// Language model as the chat flow sees it
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, input: ModelInput) -> Result<ModelReply, RouterError>;

    /// Router event stream for the rendered input
    fn stream(&self, input: ModelInput) -> Result<EventStream, RouterError>;
}

/// Renders a turn into a single prompt and hands it to the provider router
pub struct ChatAgent {
    router: Arc<ProviderRouter>,
    system_prompt: String,
}

impl ChatAgent {
    pub fn new(router: Arc<ProviderRouter>, system_prompt: impl Into<String>) -> Self {
        Self { router, system_prompt: system_prompt.into() }
    }

    pub fn render(&self, input: &ModelInput, now: DateTime<Utc>) -> String {
        let mut sections = vec![
            self.system_prompt.trim().to_string(),
            format!("Now: {}", now.format("%Y-%m-%d %H:%M UTC")),
        ];

        sections.extend(
            input
                .history
                .iter()
                .filter(|m| m.role == Role::System && !m.content.trim().is_empty())
                .map(|m| m.content.trim().to_string()),
        );

        let transcript: Vec<String> = input
            .history
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| format!("{}: {}", speaker(m.role), m.content.trim()))
            .collect();
        if !transcript.is_empty() {
            sections.push(transcript.join("\n"));
        }

        sections.push(format!("User: {}\nAssistant:", input.prompt.trim()));
        sections.join("\n\n")
    }

    fn params(&self, input: &ModelInput, stream: bool) -> GenerateParams {
        GenerateParams {
            prompt: self.render(input, Utc::now()),
            stream,
            model: input.model.clone(),
            temperature: input.temperature,
            max_tokens: input.max_tokens,
        }
    }
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
        Role::Tool => "Tool",
    }
}

#[async_trait]
impl ChatModel for ChatAgent {
    async fn complete(&self, input: ModelInput) -> Result<ModelReply, RouterError> {
        let generated = self.router.generate(&self.params(&input, false)).await?;
        Ok(ModelReply { text: generated.text, provider: generated.provider })
    }

    fn stream(&self, input: ModelInput) -> Result<EventStream, RouterError> {
        self.router.generate_stream(self.params(&input, true))
    }
}
