//! Operator endpoints for the dead-letter subsystem.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::ApiResponse;
use crate::error::AppResult;
use crate::services::DltService;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/v1/dlt
pub async fn list_records(
    service: web::Data<Arc<DltService>>,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let records = service.list(limit, offset).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(records)))
}

/// POST /api/v1/dlt/{id}/redrive
pub async fn redrive_record(
    service: web::Data<Arc<DltService>>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let event = service.redrive(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(event)))
}

/// DELETE /api/v1/dlt/{id}
pub async fn delete_record(
    service: web::Data<Arc<DltService>>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    service.delete(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "deleted": true }))))
}

/// POST /api/v1/dlt/{id}/purge
pub async fn purge_record(
    service: web::Data<Arc<DltService>>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    service.purge(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "purged": true }))))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/dlt")
            .route("", web::get().to(list_records))
            .route("/{id}/redrive", web::post().to(redrive_record))
            .route("/{id}", web::delete().to(delete_record))
            .route("/{id}/purge", web::post().to(purge_record)),
    );
}
