use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    Conversation, ConversationListResponse, ConversationQuery, ConversationResponse, DeleteResponse,
    ListConversationsQuery, OwnerQuery, RenameRequest,
};
use crate::services::conversation::store::DEFAULT_LIST_LIMIT;
use crate::services::conversation::ConversationStore;
use crate::utils::ApiError;

const DEFAULT_PAGE_SIZE: i64 = 25;
const MAX_PAGE_SIZE: i64 = 50;
const MAX_LIST_SIZE: i64 = 100;
const MAX_TITLE_CHARS: usize = 255;

/// A malformed id cannot name an existing conversation
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::NotFound(format!("Conversation {} not found", raw)))
}

/// Missing and foreign conversations look the same to the caller
async fn owned_conversation(
    store: &ConversationStore,
    id: Uuid,
    user_id: &str,
) -> Result<Conversation, ApiError> {
    match store.get_conversation(id).await? {
        Some(conversation) if conversation.owner == user_id => Ok(conversation),
        Some(_) => {
            warn!("User {} denied access to conversation {}", user_id, id);
            Err(ApiError::NotFound(format!("Conversation {} not found", id)))
        }
        None => Err(ApiError::NotFound(format!("Conversation {} not found", id))),
    }
}

/// Unparseable cursors are ignored and the newest page is returned
fn parse_cursor(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(cursor) => Some(cursor.with_timezone(&Utc)),
        Err(e) => {
            warn!("Ignoring invalid cursor {:?}: {}", raw, e);
            None
        }
    }
}

pub async fn get_conversation_handler(
    Extension(store): Extension<Arc<ConversationStore>>,
    Path(id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let id = parse_id(&id)?;
    let conversation = owned_conversation(&store, id, &query.user_id).await?;
    let response = ConversationResponse::summary(&conversation);

    if !query.include_messages {
        return Ok(Json(response));
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) as usize;
    let cursor = parse_cursor(query.cursor.as_deref());
    let page = store.get_messages_paginated(id, limit, cursor).await?;

    Ok(Json(response.with_page(page)))
}

pub async fn list_conversations_handler(
    Extension(store): Extension<Arc<ConversationStore>>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    if query.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let conversations = store
        .list_conversations(&query.user_id, Some(limit), Some(offset))
        .await?
        .iter()
        .map(ConversationResponse::summary)
        .collect();

    Ok(Json(ConversationListResponse { conversations, limit, offset }))
}

pub async fn rename_conversation_handler(
    Extension(store): Extension<Arc<ConversationStore>>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let id = parse_id(&id)?;
    let name = request.name.trim();
    if name.is_empty() || name.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Name must be between 1 and {} characters",
            MAX_TITLE_CHARS
        )));
    }

    owned_conversation(&store, id, &request.user_id).await?;
    let renamed = store.rename_conversation(id, name).await?;
    info!("Renamed conversation {} to {:?}", id, name);

    Ok(Json(ConversationResponse::summary(&renamed)))
}

pub async fn delete_conversation_handler(
    Extension(store): Extension<Arc<ConversationStore>>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = parse_id(&id)?;
    owned_conversation(&store, id, &query.user_id).await?;

    if !store.delete_conversation(id).await? {
        return Err(ApiError::NotFound(format!("Conversation {} not found", id)));
    }
    info!("Deleted conversation {} for user {}", id, query.user_id);

    Ok(Json(DeleteResponse {
        success: true,
        message: "Conversation deleted".to_string(),
        conversation_id: id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_parsing() {
        let parsed = parse_cursor(Some("2024-05-01T12:00:00.123456Z")).unwrap();
        assert_eq!(parsed.timestamp_subsec_micros(), 123456);

        assert_eq!(parse_cursor(Some("yesterday")), None);
        assert_eq!(parse_cursor(Some("  ")), None);
        assert_eq!(parse_cursor(None), None);
    }

    #[test]
    fn test_malformed_id_is_not_found() {
        assert!(matches!(parse_id("nope"), Err(ApiError::NotFound(_))));
        assert!(parse_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
