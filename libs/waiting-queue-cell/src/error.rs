use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum QueueError {
    #[error("Patient {patient_id} is already in consultation with doctor {doctor_id}")]
    InConsultation { doctor_id: Uuid, patient_id: Uuid },

    #[error("Validation error: {0}")]
    ValidationError(String),
}
