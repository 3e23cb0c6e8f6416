use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::conversation::ConversationStore;
use crate::utils::StoreError;

/// Title from the first user message: trimmed, cut to `max_chars` with "..." when longer
pub fn derive_title(first_message: &str, max_chars: usize) -> Option<String> {
    let text = first_message.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= max_chars {
        return Some(text);
    }
    let cut: String = text.chars().take(max_chars).collect();
    Some(format!("{}...", cut.trim_end()))
}

/// Name an untitled conversation after a delay. Concurrent attempts are
/// harmless: each re-checks right before writing.
pub fn spawn_title_generation(
    store: Arc<ConversationStore>,
    conversation_id: Uuid,
    delay: Duration,
    max_chars: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match generate_title(&store, conversation_id, max_chars).await {
            Ok(Some(title)) => info!("Titled conversation {}: {}", conversation_id, title),
            Ok(None) => debug!("Conversation {} needs no title", conversation_id),
            Err(e) => warn!("Title generation failed for {}: {}", conversation_id, e),
        }
    })
}

async fn generate_title(
    store: &ConversationStore,
    conversation_id: Uuid,
    max_chars: usize,
) -> Result<Option<String>, StoreError> {
    if store.has_title(conversation_id).await? {
        return Ok(None);
    }

    let Some(title) = store
        .first_user_message(conversation_id)
        .await?
        .and_then(|m| derive_title(&m.content, max_chars))
    else {
        return Ok(None);
    };

    if store.has_title(conversation_id).await? {
        return Ok(None);
    }
    store.rename_conversation(conversation_id, &title).await?;
    Ok(Some(title))
}
