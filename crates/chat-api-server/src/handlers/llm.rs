use axum::{
    extract::Extension,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{GenerateRequest, GenerateResponse};
use crate::services::llm::{GenerateParams, ProviderRouter, RouterHealth};
use crate::utils::ApiError;

/// Direct router call without conversation state
pub async fn generate_handler(
    Extension(router): Extension<Arc<ProviderRouter>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }
    info!("Generate request: stream={}, prompt_len={}", request.stream, request.prompt.len());

    let params = GenerateParams {
        prompt: request.prompt,
        stream: request.stream,
        model: request.model,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };

    if !params.stream {
        let generated = router.generate(&params).await?;
        return Ok(Json(GenerateResponse { text: generated.text, provider: generated.provider }).into_response());
    }

    let events = router.generate_stream(params)?;
    // The router reports terminal failure as an `error` event before ending
    let stream = events
        .take_while(|item| {
            if let Err(e) = item {
                warn!("Generate stream ended: {}", e);
            }
            futures::future::ready(item.is_ok())
        })
        .filter_map(|item| futures::future::ready(item.ok()))
        .map(|event| Ok::<_, Infallible>(event.client_safe().to_sse_event()));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

pub async fn providers_handler(Extension(router): Extension<Arc<ProviderRouter>>) -> Json<Value> {
    Json(json!({ "providers": router.providers_report() }))
}

pub async fn llm_health_handler(Extension(router): Extension<Arc<ProviderRouter>>) -> Json<RouterHealth> {
    Json(router.health())
}
