use axum::{
    extract::Extension,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::models::{ChatRequest, ChatResponse};
use crate::services::chat::{ChatOrchestrator, ChatTurn};
use crate::utils::ApiError;

pub async fn chat_handler(
    Extension(orchestrator): Extension<Arc<ChatOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let turn = ChatTurn::try_from(request)?;
    info!(
        "Chat request: user={}, conversation={:?}, prompt_len={}",
        turn.user_id,
        turn.conversation_ref,
        turn.prompt.len()
    );

    Ok(Json(orchestrator.chat(turn).await?))
}

pub async fn chat_stream_handler(
    Extension(orchestrator): Extension<Arc<ChatOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let turn = ChatTurn::try_from(request)?;
    info!(
        "Chat stream request: user={}, conversation={:?}, prompt_len={}",
        turn.user_id,
        turn.conversation_ref,
        turn.prompt.len()
    );

    let events = orchestrator.chat_stream(turn).await?;
    let stream = events.map(|event| Ok::<_, Infallible>(event.to_sse_event()));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
