//! HTTP application wiring (Axum router + service graph).
//!
//! - `services.rs`: backend wiring (registry/state/queue/mailer + manager)
//! - `routes/`: HTTP routes + handlers (one file per surface area)
//! - `dto.rs`: request validation and JSON mapping helpers
//! - `errors.rs`: the response envelope and error mapping

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::config::Config;
use crate::middleware;
use crate::ratelimit::{self, InMemoryRateLimiter, RateLimiter};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Requests allowed per client per window before throttling.
const RATE_LIMIT_POINTS: u32 = 10;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<AppServices>, config: &Config) -> Router {
    let jwt = Arc::new(mailforge_auth::Hs256JwtValidator::new(
        config.jwt_secret.clone().into_bytes(),
    ));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: bearer auth resolves the acting user; the optional
    // throttle sits outside auth so rejected requests are cheap.
    let mut protected = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn_with_state(
                auth_state,
                middleware::auth_middleware,
            ))
            .layer(Extension(services.clone())),
    );

    if config.rate_limit_enabled {
        let limiter: Arc<dyn RateLimiter> =
            Arc::new(InMemoryRateLimiter::new(RATE_LIMIT_POINTS, RATE_LIMIT_WINDOW));
        protected = protected.layer(axum::middleware::from_fn_with_state(
            limiter,
            ratelimit::rate_limit_middleware,
        ));
    }

    let system = Router::new()
        .route("/healthz", get(routes::system::healthz))
        .route("/readyz", get(routes::system::readyz))
        .layer(Extension(services));

    Router::new().merge(system).nest("/api/v1", protected)
}
