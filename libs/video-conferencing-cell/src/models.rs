// libs/video-conferencing-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use shared_models::realtime::{CallSessionState, Role, SessionSummary};
use waiting_queue_cell::QueueEntry;

// ==============================================================================
// CALL SESSION DOMAIN MODELS
// ==============================================================================

/// One consultation, from promotion out of the queue until it is archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub room_name: String,
    /// Assigned by the room provider once provisioning succeeds.
    pub room_id: Option<String>,
    pub state: CallSessionState,
    pub created_at: DateTime<Utc>,
    pub invited_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub doctor_confirmed_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            doctor_id: entry.doctor_id,
            patient_id: entry.patient_id,
            room_name: entry.room_name.clone(),
            room_id: None,
            state: CallSessionState::Idle,
            created_at: Utc::now(),
            invited_at: None,
            started_at: None,
            ended_at: None,
            doctor_confirmed_at: None,
            end_reason: None,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            doctor_id: self.doctor_id,
            patient_id: self.patient_id,
            room_name: self.room_name.clone(),
            state: self.state,
        }
    }

    pub fn role_of(&self, user_id: Uuid) -> Option<Role> {
        if user_id == self.doctor_id {
            Some(Role::Doctor)
        } else if user_id == self.patient_id {
            Some(Role::Patient)
        } else {
            None
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.role_of(user_id).is_some()
    }

    /// Time spent in the live call, known once the session has ended.
    pub fn consultation_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at?;
        (ended - started).to_std().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    EndedByDoctor,
    EndedByPatient,
    /// The doctor pulled the next patient.
    NextPatient,
    InviteTimeout,
    ProviderFailed,
    ParticipantLost,
    PatientLeft,
}

impl EndReason {
    pub fn ended_by(role: Role) -> Self {
        match role {
            Role::Doctor => EndReason::EndedByDoctor,
            Role::Patient => EndReason::EndedByPatient,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    QueueEmpty,
    Invited(CallSession),
    /// The session was cancelled while its room was being provisioned.
    Cancelled(CallSession),
}

// ==============================================================================
// ROOM PROVIDER MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedRoom {
    #[serde(alias = "id")]
    pub room_id: String,
    #[serde(alias = "name")]
    pub room_name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    #[serde(alias = "id")]
    pub room_id: String,
    #[serde(alias = "name")]
    pub room_name: String,
    pub status: String,
    #[serde(default)]
    pub participant_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRoom {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomParticipant {
    #[serde(alias = "id")]
    pub participant_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantListResponse {
    #[serde(default)]
    pub participants: Vec<RoomParticipant>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoomGatewayError {
    #[error("Room provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    #[error("Room name already in use: {room_name}")]
    RoomNameConflict { room_name: String },

    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: String },
}

impl From<reqwest::Error> for RoomGatewayError {
    fn from(err: reqwest::Error) -> Self {
        RoomGatewayError::ProviderUnavailable {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VideoConferencingError {
    #[error("Call session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Call session {0} is no longer live")]
    Stale(Uuid),

    #[error("{message}")]
    Conflict { message: String },

    #[error("User not authorized for this call session")]
    Unauthorized,

    #[error("Call session is not in a state that allows this operation: {state}")]
    InvalidSessionState { state: CallSessionState },

    #[error("Room provider error: {0}")]
    Provider(#[from] RoomGatewayError),

    #[error("Room provider not configured")]
    NotConfigured,

    #[error("Internal error: {message}")]
    Internal { message: String },
}
