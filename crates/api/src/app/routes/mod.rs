use axum::Router;

pub mod admin;
pub mod batches;
pub mod system;
pub mod uploads;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/batches", batches::router())
        .nest("/uploads", uploads::router())
        .nest("/admin", admin::router())
}
