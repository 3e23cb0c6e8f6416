use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::title::spawn_title_generation;
use crate::config::ChatConfig;
use crate::models::{is_real_title, ChatMessage, ChatRequest, ChatResponse, Conversation, Role, StreamEvent};
use crate::services::agent::{ChatModel, ModelInput};
use crate::services::conversation::ConversationStore;
use crate::services::memory::{MemoryGateway, TurnRecord};
use crate::utils::ApiError;

/// Events of one streamed turn, ready for the SSE layer
pub type TurnStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

const TURN_CHANNEL_CAPACITY: usize = 64;

/// One user turn as the orchestrator sees it
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    /// Raw reference from the client; invalid or foreign ids start a new conversation
    pub conversation_ref: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl TryFrom<ChatRequest> for ChatTurn {
    type Error = ApiError;

    fn try_from(request: ChatRequest) -> Result<Self, Self::Error> {
        if request.user_id.trim().is_empty() {
            return Err(ApiError::BadRequest("user_id is required".to_string()));
        }
        let prompt = request
            .prompt()
            .ok_or_else(|| ApiError::BadRequest("No user message found".to_string()))?
            .to_string();

        Ok(Self {
            user_id: request.user_id,
            user_email: request.user_email,
            user_name: request.user_name,
            conversation_ref: request.conversation_id,
            prompt,
            model: request.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        })
    }
}

/// Turn state after the user message is persisted
struct PreparedTurn {
    conversation: Conversation,
    input: ModelInput,
    user_at: DateTime<Utc>,
}

/// Per-request control flow: conversation, history, memory, model, persistence
#[derive(Clone)]
pub struct ChatOrchestrator {
    store: Arc<ConversationStore>,
    model: Arc<dyn ChatModel>,
    memory: Option<Arc<MemoryGateway>>,
    config: ChatConfig,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        model: Arc<dyn ChatModel>,
        memory: Option<Arc<MemoryGateway>>,
        config: ChatConfig,
    ) -> Self {
        Self { store, model, memory, config }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Reuse the referenced conversation when it exists and belongs to the user
    pub async fn resolve_conversation(
        &self,
        user_id: &str,
        reference: Option<&str>,
    ) -> Result<Conversation, ApiError> {
        if let Some(id) = reference.and_then(|r| Uuid::parse_str(r.trim()).ok()) {
            match self.store.get_conversation(id).await? {
                Some(conversation) if conversation.owner == user_id => return Ok(conversation),
                Some(_) => warn!("User {} referenced conversation {} they do not own", user_id, id),
                None => debug!("Conversation {} not found, starting a new one", id),
            }
        }
        Ok(self.store.create_conversation(user_id).await?)
    }

    async fn prepare_turn(&self, turn: &ChatTurn) -> Result<PreparedTurn, ApiError> {
        let conversation = self
            .resolve_conversation(&turn.user_id, turn.conversation_ref.as_deref())
            .await?;
        let id = conversation.id;

        let ensure_user = async {
            match &self.memory {
                Some(memory) => {
                    memory
                        .ensure_user_exists(
                            &turn.user_id,
                            turn.user_email.as_deref().unwrap_or_default(),
                            turn.user_name.as_deref().unwrap_or_default(),
                            None,
                        )
                        .await
                }
                None => false,
            }
        };
        let (history, metadata, _) = tokio::join!(
            self.store.get_recent_messages(id, self.config.history_limit),
            self.store.get_conversation(id),
            ensure_user,
        );
        let history = history?;
        let prior_count = metadata?.map_or(conversation.message_count, |c| c.message_count);

        let user_message = self.store.add_message(id, Role::User, &turn.prompt, None).await?;

        let mut history: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
        if let Some(memory) = &self.memory {
            if MemoryGateway::should_inject(prior_count) {
                if let Some(block) = memory
                    .get_user_context(&turn.user_id)
                    .await
                    .and_then(|context| memory.memory_message(&context))
                {
                    debug!("Injecting memory into conversation {}", id);
                    history.insert(0, block);
                }
            }
        }

        Ok(PreparedTurn {
            conversation,
            input: ModelInput {
                history,
                prompt: turn.prompt.clone(),
                model: turn.model.clone(),
                temperature: turn.temperature,
                max_tokens: turn.max_tokens,
            },
            user_at: user_message.created_at,
        })
    }

    /// Buffered turn
    pub async fn chat(&self, turn: ChatTurn) -> Result<ChatResponse, ApiError> {
        let prepared = self.prepare_turn(&turn).await?;
        let conversation_id = prepared.conversation.id;

        let reply = self.model.complete(prepared.input).await?;
        self.store
            .add_message(conversation_id, Role::Assistant, &reply.text, Some(provider_metadata(&reply.provider)))
            .await?;

        self.after_turn(&turn, &prepared.conversation, prepared.user_at, &reply.text);
        info!("Completed turn in conversation {} via {}", conversation_id, reply.provider);

        Ok(ChatResponse { text: reply.text, provider: reply.provider, conversation_id })
    }

    /// Streamed turn.
    ///
    /// Generation runs in its own task so the assistant message is persisted
    /// even when the client goes away mid-stream.
    pub async fn chat_stream(&self, turn: ChatTurn) -> Result<TurnStream, ApiError> {
        let prepared = self.prepare_turn(&turn).await?;
        let events = self.model.stream(prepared.input.clone())?;

        let (tx, mut rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive_stream(turn, prepared, events, tx).await;
        });

        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }))
    }

    async fn drive_stream(
        &self,
        turn: ChatTurn,
        prepared: PreparedTurn,
        mut events: crate::services::llm::EventStream,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let conversation_id = prepared.conversation.id;
        let mut sink = EventSink { tx, open: true };
        sink.emit(StreamEvent::conversation_start(conversation_id)).await;

        let mut text = String::new();
        let mut last_partial: Option<(String, Option<String>)> = None;
        let mut provider: Option<String> = None;
        let mut failed = false;

        while let Some(item) = events.next().await {
            match item {
                Ok(StreamEvent::Start { provider: started, .. }) => {
                    // Each attempt starts from empty; a failed attempt's text is
                    // only kept in case every provider fails
                    if !text.is_empty() {
                        last_partial = Some((std::mem::take(&mut text), provider.take()));
                    }
                    provider = started;
                }
                Ok(StreamEvent::ContentBlockDelta { text: piece }) => {
                    text.push_str(&piece);
                    sink.emit(StreamEvent::delta(piece)).await;
                }
                Ok(StreamEvent::Complete { .. }) => {}
                Ok(event) => sink.emit(event.client_safe()).await,
                Err(e) => {
                    warn!("Generation failed for conversation {}: {}", conversation_id, e);
                    if text.is_empty() {
                        if let Some((partial, partial_provider)) = last_partial.take() {
                            text = partial;
                            provider = partial_provider;
                        }
                    }
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            sink.emit(StreamEvent::Complete { conversation_id: Some(conversation_id) }).await;
            sink.emit(StreamEvent::Done { conversation_id: Some(conversation_id) }).await;
        }

        if !text.is_empty() {
            let metadata = provider.as_deref().map(provider_metadata);
            match self.store.add_message(conversation_id, Role::Assistant, &text, metadata).await {
                Ok(_) => debug!("Persisted assistant message for {} ({} chars)", conversation_id, text.len()),
                Err(e) => warn!("Could not persist assistant message for {}: {}", conversation_id, e),
            }
        }

        match self.store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => {
                sink.emit(StreamEvent::Summary { message_count: conversation.message_count }).await;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read summary for {}: {}", conversation_id, e),
        }

        if !failed {
            self.after_turn(&turn, &prepared.conversation, prepared.user_at, &text);
        }
        if !sink.open {
            info!("Client left conversation {} before the stream ended", conversation_id);
        }
    }

    /// Detached side effects: memory write-back and title generation
    fn after_turn(&self, turn: &ChatTurn, conversation: &Conversation, user_at: DateTime<Utc>, reply: &str) {
        if let Some(memory) = &self.memory {
            let memory = Arc::clone(memory);
            let record = TurnRecord {
                user_id: turn.user_id.clone(),
                user_name: turn.user_name.clone().unwrap_or_default(),
                user_message: turn.prompt.clone(),
                assistant_message: reply.to_string(),
                user_at: Some(user_at),
                assistant_at: None,
            };
            tokio::spawn(async move {
                memory.record_turn(record).await;
            });
        }

        if !is_real_title(conversation.title.as_deref()) {
            spawn_title_generation(
                Arc::clone(&self.store),
                conversation.id,
                Duration::from_millis(self.config.title_delay_ms),
                self.config.title_max_chars,
            );
        }
    }
}

fn provider_metadata(provider: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("provider".to_string(), json!(provider));
    metadata
}

/// Forwards events until the receiver is dropped, then swallows them
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    open: bool,
}

impl EventSink {
    async fn emit(&mut self, event: StreamEvent) {
        if self.open && self.tx.send(event).await.is_err() {
            self.open = false;
        }
    }
}
