use std::net::SocketAddr;
use std::sync::Arc;

use mailforge_api::app::{self, services};
use mailforge_api::config::Config;

#[tokio::main]
async fn main() {
    mailforge_observability::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let services = match services::build_services(&config).await {
        Ok(services) => Arc::new(services),
        Err(e) => {
            tracing::error!(error = %e, "failed to wire services");
            std::process::exit(1);
        }
    };

    let worker = services::spawn_worker(&services, &config);

    let app = app::build_app(services, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.bind_addr));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    // Let the in-flight job settle before the process exits.
    worker.shutdown().await;
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
