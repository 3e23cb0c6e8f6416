use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::database::DbPool;
use crate::handlers;
use crate::services::{ChatOrchestrator, ConversationStore, ProviderRouter};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub fn build_router(
    orchestrator: Arc<ChatOrchestrator>,
    router: Arc<ProviderRouter>,
    db_pool: Option<DbPool>,
) -> Router {
    let store: Arc<ConversationStore> = Arc::clone(orchestrator.store());

    // Public routes
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    let chat_routes = Router::new()
        .route("/api/chat", post(handlers::chat::chat_handler))
        .route("/api/chat/stream", post(handlers::chat::chat_stream_handler))
        .route(
            "/api/chat/conversations",
            get(handlers::conversation::list_conversations_handler),
        )
        .route(
            "/api/chat/conversations/{id}",
            get(handlers::conversation::get_conversation_handler)
                .patch(handlers::conversation::rename_conversation_handler)
                .delete(handlers::conversation::delete_conversation_handler),
        );

    let llm_routes = Router::new()
        .route("/api/llm/generate", post(handlers::llm::generate_handler))
        .route("/api/llm/providers", get(handlers::llm::providers_handler))
        .route("/api/llm/health", get(handlers::llm::llm_health_handler));

    Router::new()
        .merge(public_routes)
        .merge(chat_routes)
        .merge(llm_routes)
        // Shared state
        .layer(Extension(orchestrator))
        .layer(Extension(store))
        .layer(Extension(router))
        .layer(Extension(db_pool))
        // CORS
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CatchPanicLayer::new())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
