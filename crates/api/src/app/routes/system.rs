use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness: if the queue backend answers a depth probe, claims and
/// enqueues will work too.
pub async fn readyz(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue.counts().await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "queue backend unavailable")
        }
    }
}
