use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use mailforge_dispatch::DispatchError;
use mailforge_registry::RegistryError;

/// Uniform response envelope. `success` mirrors the status class so clients
/// can branch without inspecting codes.
pub fn envelope(
    status: StatusCode,
    message: impl Into<String>,
    data: serde_json::Value,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": status.as_u16() < 400,
            "status": status.as_u16(),
            "message": message.into(),
            "data": data,
        })),
    )
        .into_response()
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    envelope(status, message, serde_json::Value::Null)
}

/// Map dispatch failures onto HTTP. Client mistakes keep their message;
/// backend failures are logged here and leave as an opaque 500.
pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, msg),
        DispatchError::InvalidSchedule => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        DispatchError::NotFound(_) => json_error(StatusCode::NOT_FOUND, err.to_string()),
        DispatchError::Permission(msg) => json_error(StatusCode::FORBIDDEN, msg),
        DispatchError::BatchBusy => json_error(
            StatusCode::CONFLICT,
            "batch is already processing; pause it first",
        ),
        DispatchError::Registry(RegistryError::DuplicateBatch(_)) => {
            json_error(StatusCode::CONFLICT, "upload already has a batch")
        }
        DispatchError::Transport(_)
        | DispatchError::StateInconsistency(_)
        | DispatchError::Registry(_)
        | DispatchError::State(_)
        | DispatchError::Queue(_) => {
            tracing::error!(error = %err, "request failed on a backend error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}
