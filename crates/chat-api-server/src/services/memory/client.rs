use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Memory service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Memory service error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Memory service transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl MemoryError {
    /// Map a failed response onto the cases callers branch on
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let lowered = body.to_lowercase();
        let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();

        if status == StatusCode::NOT_FOUND {
            MemoryError::NotFound(body)
        } else if matches!(status, StatusCode::BAD_REQUEST | StatusCode::CONFLICT)
            && lowered.contains("already exists")
        {
            MemoryError::AlreadyExists(body)
        } else if status == StatusCode::SERVICE_UNAVAILABLE || lowered.contains("temporarily unavailable") {
            MemoryError::Unavailable(body)
        } else {
            MemoryError::Api { status: status.as_u16(), body }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUser {
    pub user_id: String,
    pub email: String,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadMessage {
    pub name: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTemplate {
    pub template_id: String,
    pub template: String,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    context: Option<String>,
}

/// External long-term memory service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn add_user(&self, user: &MemoryUser) -> Result<(), MemoryError>;

    async fn create_thread(&self, thread_id: &str, user_id: &str) -> Result<(), MemoryError>;

    async fn add_messages(&self, thread_id: &str, messages: &[ThreadMessage]) -> Result<(), MemoryError>;

    /// Formatted memory block for a thread, shaped by `template_id`
    async fn get_context(&self, thread_id: &str, template_id: &str) -> Result<String, MemoryError>;

    async fn get_template(&self, template_id: &str) -> Result<ContextTemplate, MemoryError>;

    async fn create_template(&self, template: &ContextTemplate) -> Result<(), MemoryError>;

    async fn delete_template(&self, template_id: &str) -> Result<(), MemoryError>;
}

/// HTTP client for a Zep-compatible memory API
pub struct ZepClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ZepClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, MemoryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, MemoryError> {
        let response = request
            .header("Authorization", format!("Api-Key {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!("Memory service returned {}: {}", status, body);
        Err(MemoryError::from_status(status, body))
    }
}

#[async_trait]
impl MemoryBackend for ZepClient {
    async fn add_user(&self, user: &MemoryUser) -> Result<(), MemoryError> {
        self.send(self.client.post(self.url("/users")).json(user)).await?;
        Ok(())
    }

    async fn create_thread(&self, thread_id: &str, user_id: &str) -> Result<(), MemoryError> {
        let body = serde_json::json!({ "thread_id": thread_id, "user_id": user_id });
        self.send(self.client.post(self.url("/threads")).json(&body)).await?;
        Ok(())
    }

    async fn add_messages(&self, thread_id: &str, messages: &[ThreadMessage]) -> Result<(), MemoryError> {
        let body = serde_json::json!({ "messages": messages });
        let url = self.url(&format!("/threads/{}/messages", thread_id));
        self.send(self.client.post(url).json(&body)).await?;
        Ok(())
    }

    async fn get_context(&self, thread_id: &str, template_id: &str) -> Result<String, MemoryError> {
        let url = self.url(&format!("/threads/{}/context?template_id={}", thread_id, template_id));
        let response: ContextResponse = self.send(self.client.get(url)).await?.json().await?;
        Ok(response.context.unwrap_or_default())
    }

    async fn get_template(&self, template_id: &str) -> Result<ContextTemplate, MemoryError> {
        let url = self.url(&format!("/context-templates/{}", template_id));
        Ok(self.send(self.client.get(url)).await?.json().await?)
    }

    async fn create_template(&self, template: &ContextTemplate) -> Result<(), MemoryError> {
        self.send(self.client.post(self.url("/context-templates")).json(template)).await?;
        Ok(())
    }

    async fn delete_template(&self, template_id: &str) -> Result<(), MemoryError> {
        let url = self.url(&format!("/context-templates/{}", template_id));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}
