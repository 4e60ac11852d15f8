use axum::{
    Router,
    routing::get,
};

use consultation_cell::{ConsultationState, consultation_routes};

pub fn create_router(state: ConsultationState) -> Router {
    Router::new()
        .route("/", get(|| async { "Amae consultation API is running!" }))
        .nest("/consultations", consultation_routes(state))
}
