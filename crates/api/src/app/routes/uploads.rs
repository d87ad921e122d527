use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    routing::get,
    Router,
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/", get(list_uploads))
}

/// Uploads joined with their batch (if any) and remaining recipient count,
/// newest first.
pub async fn list_uploads(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    let page = match dto::to_page_params(query) {
        Ok(page) => page,
        Err(response) => return response,
    };

    match services.manager.uploads_with_batches(page.pagination()).await {
        Ok(uploads) => errors::envelope(
            StatusCode::OK,
            "uploads fetched",
            json!({
                "uploads": uploads.items,
                "pagination": page.meta(uploads.total),
            }),
        ),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
