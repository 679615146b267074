//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check (unauthenticated for load balancers/k8s probes)
        .route("/health", get(handlers::health_check))
        // Upload control plane
        .route("/upload/initiate", post(handlers::initiate_upload))
        .route("/upload/status/{file_id}", get(handlers::get_upload_status))
        .route("/upload/cancel/{file_id}", post(handlers::cancel_upload))
        .route("/batch/initiate", post(handlers::initiate_batch))
        .route("/batch/cancel/{batch_id}", post(handlers::cancel_batch))
        // Byte transfer
        .route("/ws/upload/{file_id}", get(handlers::upload_socket))
        // Operator visibility
        .route("/system/status", get(handlers::system_status));

    let mut router = Router::new().merge(api_routes);

    // When enabled, /metrics should be network-restricted to scraper
    // addresses. See crate::metrics.
    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
