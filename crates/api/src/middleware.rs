use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use mailforge_auth::JwtValidator;

use crate::app::errors;

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

/// Resolve the bearer token into an [`mailforge_auth::Actor`] and stash it
/// in request extensions for the handlers.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let token = match extract_bearer(req.headers()) {
        Ok(token) => token,
        Err(response) => return response,
    };

    let claims = match state.jwt.validate(token, Utc::now()) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "rejected bearer token");
            return errors::json_error(StatusCode::UNAUTHORIZED, "invalid or expired token");
        }
    };

    req.extensions_mut().insert(claims.actor());

    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, Response> {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(errors::json_error(
            StatusCode::UNAUTHORIZED,
            "missing authorization header",
        ));
    };

    let header = header.to_str().map_err(|_| {
        errors::json_error(StatusCode::UNAUTHORIZED, "malformed authorization header")
    })?;

    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err(errors::json_error(
            StatusCode::UNAUTHORIZED,
            "authorization header must use the Bearer scheme",
        ));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(errors::json_error(StatusCode::UNAUTHORIZED, "empty bearer token"));
    }

    Ok(token)
}
