// libs/video-conferencing-cell/src/lib.rs
//! # Video Conferencing Cell
//!
//! Call-session lifecycle for queue-admitted consultations, and the client
//! for the external media-room provider.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                   Video Cell                        |
//! +-----------------------------------------------------+
//! |  models.rs          |  Sessions, room DTOs, errors  |
//! |  services/          |  Business logic layer         |
//! |    room_gateway.rs  |  Room provider REST client    |
//! |    session.rs       |  Call session state machine   |
//! +-----------------------------------------------------+
//! ```
//!
//! ## Session lifecycle
//!
//! ```text
//! IDLE -> PROVISIONING -> INVITED -> ACTIVE -> ENDING -> COMPLETED
//!              \-> PROVISION_FAILED
//! PROVISIONING | INVITED | ACTIVE -> ABANDONED
//! ```
//!
//! A failed provisioning puts the patient back at the front of the doctor's
//! queue. Completed sessions feed the doctor's wait estimate.
//!
//! ## Configuration
//!
//! - `ROOM_PROVIDER_BASE_URL` - Room provider API base URL
//! - `ROOM_PROVIDER_API_TOKEN` - API authentication token
//! - `ROOM_PROVIDER_TIMEOUT_SECONDS` - Per-request timeout
//! - `INVITE_TIMEOUT_SECONDS` - How long an invite waits for the patient

pub mod models;
pub mod services;

// Re-export commonly used types
pub use models::{
    CallSession, CompletedRoom, EndReason, ProvisionedRoom, PullOutcome, RoomGatewayError,
    RoomInfo, RoomParticipant, VideoConferencingError,
};

pub use services::{CallSessionManager, HttpRoomGateway, RoomProvisioningGateway};
