use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Read-only
        .route("/status", get(handlers::status_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/audit", get(handlers::audit_handler))
        .route("/alerts", get(handlers::alerts_handler))
        // Worker control
        .route("/start", post(handlers::start_handler))
        .route("/stop", post(handlers::stop_handler))
        .route("/pause", post(handlers::pause_handler))
        .route("/resume", post(handlers::resume_handler))
        .route("/recovery", post(handlers::recovery_handler))
        .route("/start-sequential", post(handlers::start_sequential_handler))
        .route("/stop-all", post(handlers::stop_all_handler))
        // Safety
        .route("/kill-switch", post(handlers::kill_switch_handler))
        .with_state(state)
        .layer(cors)
}
