use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::delete,
    Router,
};

use mailforge_auth::Actor;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/uploads/:upload_id", delete(purge_upload))
}

/// Full campaign teardown: queued jobs, runtime state, batch, recipient
/// rows, and the upload itself. The admin check lives in the manager.
pub async fn purge_upload(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(actor): Extension<Actor>,
    Path(upload_id): Path<String>,
) -> axum::response::Response {
    let upload_id = match dto::parse_upload_id(&upload_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match services.manager.purge_upload(&actor, upload_id).await {
        Ok(()) => errors::envelope(StatusCode::OK, "upload purged", serde_json::Value::Null),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
