//! Admin broadcast endpoints plus the end-user read receipt.

use actix_web::{web, HttpResponse};
use governor::DefaultDirectRateLimiter;
use serde::Deserialize;
use std::sync::Arc;

use super::ApiResponse;
use crate::error::{AppError, AppResult};
use crate::repository::BroadcastFilter;
use crate::services::{BroadcastService, DeliveryService};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// all | active | scheduled
    pub filter: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReadReceipt {
    pub user_id: String,
}

/// Create a broadcast.
///
/// POST /api/v1/broadcasts
pub async fn create_broadcast(
    service: web::Data<Arc<BroadcastService>>,
    limiter: web::Data<Arc<DefaultDirectRateLimiter>>,
    req: web::Json<crate::models::CreateBroadcastRequest>,
) -> AppResult<HttpResponse> {
    if limiter.check().is_err() {
        return Err(AppError::RateLimited);
    }

    let broadcast = service.create(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok(broadcast)))
}

/// Cancel a broadcast by id (idempotent).
///
/// POST /api/v1/broadcasts/{id}/cancel
pub async fn cancel_broadcast(
    service: web::Data<Arc<BroadcastService>>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let broadcast = service.cancel(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(broadcast)))
}

/// List broadcasts.
///
/// GET /api/v1/broadcasts?filter=all|active|scheduled
pub async fn list_broadcasts(
    service: web::Data<Arc<BroadcastService>>,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let filter = match query.filter.as_deref() {
        None => BroadcastFilter::All,
        Some(raw) => BroadcastFilter::parse(raw)
            .ok_or_else(|| AppError::Validation(format!("unknown filter {}", raw)))?,
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let broadcasts = service.list(filter, limit).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(broadcasts)))
}

/// Fetch one broadcast.
///
/// GET /api/v1/broadcasts/{id}
pub async fn get_broadcast(
    service: web::Data<Arc<BroadcastService>>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let broadcast = service.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(broadcast)))
}

/// Per-recipient delivery records.
///
/// GET /api/v1/broadcasts/{id}/deliveries
pub async fn list_deliveries(
    service: web::Data<Arc<BroadcastService>>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let deliveries = service.deliveries(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(deliveries)))
}

/// Per-broadcast statistics.
///
/// GET /api/v1/broadcasts/{id}/statistics
pub async fn get_statistics(
    service: web::Data<Arc<BroadcastService>>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let stats = service.statistics(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(stats)))
}

/// Record a read receipt for one recipient.
///
/// POST /api/v1/broadcasts/{id}/read
pub async fn mark_read(
    delivery: web::Data<Arc<DeliveryService>>,
    path: web::Path<i64>,
    body: web::Json<ReadReceipt>,
) -> AppResult<HttpResponse> {
    let newly_read = delivery.mark_read(&body.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "read": newly_read }))))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/broadcasts")
            .route("", web::post().to(create_broadcast))
            .route("", web::get().to(list_broadcasts))
            .route("/{id}", web::get().to(get_broadcast))
            .route("/{id}/cancel", web::post().to(cancel_broadcast))
            .route("/{id}/deliveries", web::get().to(list_deliveries))
            .route("/{id}/statistics", web::get().to(get_statistics))
            .route("/{id}/read", web::post().to(mark_read)),
    );
}
