use axum::response::sse::Event;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::utils::user_facing_message;

/// Normalized streaming event vocabulary.
///
/// Every provider shape (SSE, JSON lines, single strings) ends up as a
/// sequence of these. On the wire each event is `event: <name>` followed by
/// `data: <json>` and a blank line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        conversation_id: Option<Uuid>,
        provider: Option<String>,
    },
    ContentBlockDelta {
        text: String,
    },
    Complete {
        conversation_id: Option<Uuid>,
    },
    Done {
        conversation_id: Option<Uuid>,
    },
    Summary {
        message_count: i64,
    },
    Error {
        error: String,
        provider: Option<String>,
    },
}

impl StreamEvent {
    pub fn provider_start(provider: &str) -> Self {
        StreamEvent::Start { conversation_id: None, provider: Some(provider.to_string()) }
    }

    pub fn conversation_start(conversation_id: Uuid) -> Self {
        StreamEvent::Start { conversation_id: Some(conversation_id), provider: None }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        StreamEvent::ContentBlockDelta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error { error: message.into(), provider: None }
    }

    pub fn provider_error(provider: &str, message: impl Into<String>) -> Self {
        StreamEvent::Error { error: message.into(), provider: Some(provider.to_string()) }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Summary { .. } => "summary",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            StreamEvent::Start { conversation_id, provider } => {
                let mut data = Map::new();
                if let Some(id) = conversation_id {
                    data.insert("conversation_id".into(), json!(id.to_string()));
                }
                if let Some(provider) = provider {
                    data.insert("provider".into(), json!(provider));
                }
                Value::Object(data)
            }
            StreamEvent::ContentBlockDelta { text } => json!({ "type": "text_delta", "text": text }),
            StreamEvent::Complete { conversation_id } | StreamEvent::Done { conversation_id } => {
                match conversation_id {
                    Some(id) => json!({ "conversation_id": id.to_string() }),
                    None => json!({}),
                }
            }
            StreamEvent::Summary { message_count } => json!({ "message_count": message_count }),
            StreamEvent::Error { error, provider } => match provider {
                Some(provider) => json!({ "error": error, "provider": provider }),
                None => json!({ "error": error }),
            },
        }
    }

    pub fn to_sse_event(&self) -> Event {
        Event::default().event(self.name()).data(self.payload().to_string())
    }

    /// Error text rewritten so it is safe to show an end user
    pub fn client_safe(self) -> Self {
        match self {
            StreamEvent::Error { error, provider } => StreamEvent::Error {
                error: user_facing_message(&error),
                provider,
            },
            other => other,
        }
    }

    pub fn delta_text(&self) -> Option<&str> {
        match self {
            StreamEvent::ContentBlockDelta { text } => Some(text),
            _ => None,
        }
    }
}
