//! Wire protocol spoken over a consultation session channel.
//!
//! Both directions are internally tagged JSON (`{"type": "join_queue", ...}`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
}

impl Role {
    /// Map the auth provider's role claim onto a channel role.
    pub fn from_claim(claim: Option<&str>) -> Self {
        match claim {
            Some("doctor") => Role::Doctor,
            _ => Role::Patient,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::Doctor => write!(f, "doctor"),
        }
    }
}

/// Lifecycle of one consultation.
///
/// ```text
/// IDLE -> PROVISIONING -> INVITED -> ACTIVE -> ENDING -> COMPLETED
///                \-> PROVISION_FAILED
/// PROVISIONING | INVITED | ACTIVE -> ABANDONED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallSessionState {
    Idle,
    Provisioning,
    Invited,
    Active,
    Ending,
    Completed,
    ProvisionFailed,
    Abandoned,
}

impl CallSessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallSessionState::Completed
                | CallSessionState::ProvisionFailed
                | CallSessionState::Abandoned
        )
    }

    /// States in which the session still occupies its doctor and patient.
    pub fn holds_participants(&self) -> bool {
        matches!(
            self,
            CallSessionState::Idle
                | CallSessionState::Provisioning
                | CallSessionState::Invited
                | CallSessionState::Active
        )
    }

    pub fn can_transition_to(&self, target: &CallSessionState) -> bool {
        use CallSessionState::*;
        match (self, target) {
            (Idle, Provisioning) => true,
            (Provisioning, Invited) => true,
            (Provisioning, ProvisionFailed) => true,
            (Invited, Active) => true,
            (Active, Ending) => true,
            (Ending, Completed) => true,
            // cancelled before the patient ever connected, or lost after
            (Provisioning, Abandoned) | (Invited, Abandoned) | (Active, Abandoned) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CallSessionState::Idle => "IDLE",
            CallSessionState::Provisioning => "PROVISIONING",
            CallSessionState::Invited => "INVITED",
            CallSessionState::Active => "ACTIVE",
            CallSessionState::Ending => "ENDING",
            CallSessionState::Completed => "COMPLETED",
            CallSessionState::ProvisionFailed => "PROVISION_FAILED",
            CallSessionState::Abandoned => "ABANDONED",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Client -> Core
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinQueue {
        doctor_id: Uuid,
        patient_id: Uuid,
        #[serde(default)]
        room_name_hint: Option<String>,
    },
    LeaveQueue {
        doctor_id: Uuid,
        patient_id: Uuid,
    },
    /// Doctor only.
    PullNext { doctor_id: Uuid },
    EndSession { session_id: Uuid },
    ConfirmJoin { session_id: Uuid },
    Ping {},
}

// ---------------------------------------------------------------------------
// Core -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingPatient {
    pub patient_id: Uuid,
    pub position: u32,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub room_name: String,
    pub state: CallSessionState,
}

/// Authoritative state handed to a client right after its channel binds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResyncSnapshot {
    pub doctor_id: Option<Uuid>,
    /// Patient view: rank in `doctor_id`'s queue, `0` while in consultation.
    pub position: Option<u32>,
    pub estimated_wait_seconds: Option<u64>,
    pub queue_length: Option<u32>,
    /// Doctor view: the waiting room.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting: Vec<WaitingPatient>,
    pub session: Option<SessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PositionUpdate {
        doctor_id: Uuid,
        patient_id: Uuid,
        position: u32,
        estimated_wait_seconds: u64,
        queue_length: u32,
    },
    /// Sent to the doctor whenever their queue changes.
    QueueSnapshot {
        doctor_id: Uuid,
        queue_length: u32,
        waiting: Vec<WaitingPatient>,
    },
    Invite {
        session_id: Uuid,
        room_name: String,
        role: Role,
        doctor_id: Uuid,
        patient_id: Uuid,
    },
    SessionStateChanged {
        session_id: Uuid,
        state: CallSessionState,
    },
    Resync { snapshot: ResyncSnapshot },
    Error { code: String, message: String },
    Pong {},
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Queue-derived events for `doctor_id`; superseded by a resync of that queue.
    pub fn is_queue_view_of(&self, doctor: Uuid) -> bool {
        match self {
            ServerEvent::PositionUpdate { doctor_id, .. }
            | ServerEvent::QueueSnapshot { doctor_id, .. } => *doctor_id == doctor,
            _ => false,
        }
    }
}
