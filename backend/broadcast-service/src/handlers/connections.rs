//! Per-pod connection statistics.

use actix_web::{web, HttpResponse};
use std::sync::Arc;

use super::ApiResponse;
use crate::error::AppResult;
use crate::sse::ConnectionManager;

/// GET /api/v1/connections/stats
pub async fn connection_stats(
    manager: web::Data<Arc<ConnectionManager>>,
) -> AppResult<HttpResponse> {
    let stats = manager.stats().await;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(stats)))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/api/v1/connections/stats",
        web::get().to(connection_stats),
    );
}
