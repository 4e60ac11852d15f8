use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_models::realtime::WaitingPatient;

/// A patient waiting for one doctor. Position is never stored; it is the
/// entry's index in its doctor's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub joined_at: DateTime<Utc>,
    /// Insertion order, assigned atomically; breaks `joined_at` ties.
    pub sequence: u64,
    pub room_name: String,
}

/// Reply to a join: where the patient stands right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTicket {
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub position: u32,
    pub estimated_wait: Duration,
    pub queue_length: u32,
    pub room_name: String,
    pub joined_at: DateTime<Utc>,
    /// True when the join was a repeat of an existing entry.
    pub already_queued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueuePosition {
    /// 1-indexed rank; `0` while the patient is in consultation.
    pub position: u32,
    pub estimated_wait: Duration,
    pub queue_length: u32,
}

impl QueuePosition {
    pub fn is_in_consultation(&self) -> bool {
        self.position == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorQueueSnapshot {
    pub doctor_id: Uuid,
    pub queue_length: u32,
    pub waiting: Vec<WaitingPatient>,
    pub average_consultation: Duration,
    pub in_consultation: Vec<Uuid>,
}
