use axum::{middleware, routing::get, Router};

use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::models::ConsultationState;

pub fn consultation_routes(state: ConsultationState) -> Router {
    // The channel authenticates during the upgrade itself
    let public_routes = Router::new()
        .route("/ws", get(handlers::consultation_socket))
        .route("/health", get(handlers::health_check));

    let protected_routes = Router::new()
        .route("/doctors/{doctor_id}/queue", get(handlers::get_doctor_queue))
        .route("/doctors/{doctor_id}/position", get(handlers::get_queue_position))
        .route("/sessions/{session_id}", get(handlers::get_session))
        .route(
            "/sessions/{session_id}/participants",
            get(handlers::get_session_participants),
        )
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
