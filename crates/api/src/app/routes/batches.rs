use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use serde_json::json;

use mailforge_auth::Actor;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_batches).post(start_batch))
        .route("/:batch_key", get(batch_detail).delete(delete_batch))
        .route("/:batch_key/pause", patch(pause_batch))
        .route("/:batch_key/resume", patch(resume_batch))
}

pub async fn start_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<dto::StartBatchRequest>,
) -> axum::response::Response {
    let request = match dto::to_start_batch(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match services.manager.start_batch(&actor, request).await {
        Ok(snapshot) => errors::envelope(StatusCode::CREATED, "batch started", json!(snapshot)),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn list_batches(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    let page = match dto::to_page_params(query) {
        Ok(page) => page,
        Err(response) => return response,
    };

    match services.manager.batch_overview(&actor, page.pagination()).await {
        Ok(overview) => errors::envelope(
            StatusCode::OK,
            "batches fetched",
            json!({
                "batches": overview.batches.items,
                "pagination": page.meta(overview.batches.total),
                "queue": overview.queue,
            }),
        ),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn batch_detail(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Path(batch_key): Path<String>,
) -> axum::response::Response {
    let batch_key = match dto::parse_batch_key(&batch_key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match services.manager.batch_detail(&actor, batch_key).await {
        Ok(snapshot) => errors::envelope(StatusCode::OK, "batch fetched", json!(snapshot)),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn pause_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Path(batch_key): Path<String>,
) -> axum::response::Response {
    let batch_key = match dto::parse_batch_key(&batch_key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match services.manager.pause_batch(&actor, batch_key).await {
        Ok(snapshot) => errors::envelope(StatusCode::OK, "batch paused", json!(snapshot)),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn resume_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Path(batch_key): Path<String>,
) -> axum::response::Response {
    let batch_key = match dto::parse_batch_key(&batch_key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match services.manager.resume_batch(&actor, batch_key).await {
        Ok(snapshot) => errors::envelope(StatusCode::OK, "batch resumed", json!(snapshot)),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn delete_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Path(batch_key): Path<String>,
) -> axum::response::Response {
    let batch_key = match dto::parse_batch_key(&batch_key) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match services.manager.delete_batch(&actor, batch_key).await {
        Ok(()) => errors::envelope(StatusCode::OK, "batch deleted", serde_json::Value::Null),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
