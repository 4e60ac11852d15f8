pub mod coordinator;

pub use coordinator::ConsultationCoordinator;
