pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::ConsultationError;
pub use models::{ConsultationState, WsParams};
pub use router::consultation_routes;
pub use services::ConsultationCoordinator;
