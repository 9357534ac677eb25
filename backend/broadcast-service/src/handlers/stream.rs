//! The SSE endpoint. The response body is a lazy stream driven by the
//! session's sink; the client dropping the connection drops the receiver,
//! after which the next emit fails and the close reaper finishes cleanup.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::ApiResponse;
use crate::error::AppResult;
use crate::sse::ConnectionManager;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub user_id: String,
    /// Reconnects reuse the old session id; first connects omit it.
    pub session_id: Option<Uuid>,
}

/// Open an SSE stream.
///
/// GET /api/v1/stream?user_id=...&session_id=...
pub async fn open_stream(
    manager: web::Data<Arc<ConnectionManager>>,
    query: web::Query<StreamQuery>,
) -> AppResult<HttpResponse> {
    let (session_id, rx) = manager.open(&query.user_id, query.session_id).await?;

    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| {
            (
                Ok::<web::Bytes, actix_web::Error>(web::Bytes::from(event.to_frame())),
                rx,
            )
        })
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Session-Id", session_id.to_string()))
        .streaming(body))
}

/// Explicit disconnect (the close flow also runs when the sink dies).
///
/// DELETE /api/v1/stream/{session_id}
pub async fn disconnect(
    manager: web::Data<Arc<ConnectionManager>>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    manager.close(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "disconnected": true }))))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/stream")
            .route("", web::get().to(open_stream))
            .route("/{session_id}", web::delete().to(disconnect)),
    );
}
