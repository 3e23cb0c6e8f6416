use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::database::DbPool;
use crate::services::llm::ProviderRouter;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    active_providers: usize,
    database: &'static str,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Ready when at least one provider is enabled and the database (if any) answers
pub async fn readiness_check(
    Extension(router): Extension<Arc<ProviderRouter>>,
    Extension(db_pool): Extension<Option<DbPool>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let active_providers = router.active_providers().len();
    let database = match &db_pool {
        Some(pool) if pool.ping().await => "up",
        Some(_) => "down",
        None => "not_configured",
    };

    let ready = active_providers > 0 && database != "down";
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(ReadinessResponse { ready, active_providers, database }))
}
