use thiserror::Error;

use session_channel_cell::ChannelError;
use shared_models::error::AppError;
use video_conferencing_cell::VideoConferencingError;
use waiting_queue_cell::QueueError;

#[derive(Error, Debug, PartialEq)]
pub enum ConsultationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Room provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Stale reference: {0}")]
    Stale(String),

    #[error("Not allowed: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    Validation(String),
}

impl ConsultationError {
    /// Machine-readable code carried by `Error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ConsultationError::NotFound(_) => "not_found",
            ConsultationError::Conflict(_) => "conflict",
            ConsultationError::ProviderUnavailable(_) => "provider_unavailable",
            ConsultationError::Timeout(_) => "timeout",
            ConsultationError::Stale(_) => "stale",
            ConsultationError::Unauthorized(_) => "unauthorized",
            ConsultationError::Validation(_) => "validation",
        }
    }

    /// Errors that are logged and dropped instead of reported to the client.
    pub fn is_silent(&self) -> bool {
        matches!(self, ConsultationError::NotFound(_) | ConsultationError::Stale(_))
    }
}

impl From<QueueError> for ConsultationError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InConsultation { .. } => ConsultationError::Conflict(err.to_string()),
            QueueError::ValidationError(message) => ConsultationError::Validation(message),
        }
    }
}

impl From<VideoConferencingError> for ConsultationError {
    fn from(err: VideoConferencingError) -> Self {
        match err {
            VideoConferencingError::SessionNotFound(_) => ConsultationError::NotFound(err.to_string()),
            VideoConferencingError::Stale(_) => ConsultationError::Stale(err.to_string()),
            VideoConferencingError::Conflict { message } => ConsultationError::Conflict(message),
            VideoConferencingError::Unauthorized => ConsultationError::Unauthorized(err.to_string()),
            VideoConferencingError::InvalidSessionState { .. } => {
                ConsultationError::Conflict(err.to_string())
            }
            VideoConferencingError::Provider(_)
            | VideoConferencingError::NotConfigured
            | VideoConferencingError::Internal { .. } => {
                ConsultationError::ProviderUnavailable(err.to_string())
            }
        }
    }
}

impl From<ChannelError> for ConsultationError {
    fn from(err: ChannelError) -> Self {
        ConsultationError::Stale(err.to_string())
    }
}

impl From<ConsultationError> for AppError {
    fn from(err: ConsultationError) -> Self {
        match err {
            ConsultationError::NotFound(msg) | ConsultationError::Stale(msg) => AppError::NotFound(msg),
            ConsultationError::Conflict(msg) => AppError::Conflict(msg),
            ConsultationError::ProviderUnavailable(msg) => AppError::ExternalService(msg),
            ConsultationError::Timeout(msg) => AppError::Timeout(msg),
            ConsultationError::Unauthorized(msg) => AppError::Auth(msg),
            ConsultationError::Validation(msg) => AppError::BadRequest(msg),
        }
    }
}
