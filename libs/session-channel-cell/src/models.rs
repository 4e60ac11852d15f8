use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use shared_models::realtime::{Role, ServerEvent};

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;
pub type DepartureReceiver = mpsc::UnboundedReceiver<ChannelDeparture>;

/// Logical identity of a channel: one per (user, role).
pub type ChannelKey = (Uuid, Role);

/// Opaque reference a transport task holds for the connection it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

impl ConnectionHandle {
    pub fn key(&self) -> ChannelKey {
        (self.user_id, self.role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConnection {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub last_seen_at: DateTime<Utc>,
    /// Patients: the doctor whose queue they last joined.
    pub subscribed_doctor_id: Option<Uuid>,
    /// Doctors: the queue they own.
    pub as_doctor_id: Option<Uuid>,
}

impl ClientConnection {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            role,
            last_seen_at: Utc::now(),
            subscribed_doctor_id: None,
            as_doctor_id: match role {
                Role::Doctor => Some(user_id),
                Role::Patient => None,
            },
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            connection_id: self.connection_id,
            user_id: self.user_id,
            role: self.role,
        }
    }

    /// Fresh connection id for the same logical client, keeping its bindings.
    pub fn rebind(&self) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            last_seen_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Result of opening a channel.
pub struct ChannelOpen {
    pub handle: ConnectionHandle,
    pub connection: ClientConnection,
    pub receiver: EventReceiver,
    /// True when an existing logical client (stale or still live) was rebound.
    pub rebound: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureReason {
    /// Client closed the channel on purpose.
    Closed,
    /// Transport dropped and the client did not come back within the grace window.
    GraceExpired,
}

/// Emitted once a logical client is gone for good.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDeparture {
    pub connection: ClientConnection,
    pub reason: DepartureReason,
}
