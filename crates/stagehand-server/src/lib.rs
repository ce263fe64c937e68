pub mod controller;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum Router with all routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(routes::health::healthz))
        // Grafana notification channel
        .route("/alerts", post(routes::alerts::receive_alert))
        // Workflows
        .route("/api/workflows", post(routes::workflows::create_workflow))
        .route("/api/workflows/{namespace}", get(routes::workflows::list_workflows))
        .route(
            "/api/workflows/{namespace}/{name}",
            get(routes::workflows::get_workflow).delete(routes::workflows::delete_workflow),
        )
        .route(
            "/api/workflows/{namespace}/{name}/jobs",
            get(routes::workflows::list_workflow_jobs),
        )
        // Jobs
        .route("/api/jobs/{namespace}/{name}", get(routes::jobs::get_job))
        .route(
            "/api/jobs/{namespace}/{name}/status",
            post(routes::jobs::report_status),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve on a pre-bound listener until `shutdown` resolves.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    app_state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = build_router(app_state);

    tracing::info!("stagehand listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
