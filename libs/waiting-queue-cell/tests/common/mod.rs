use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use session_channel_cell::EventPublisher;
use shared_models::realtime::{ResyncSnapshot, Role, ServerEvent};

/// Captures everything the tracker publishes, in publish order.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(Uuid, Role, ServerEvent)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_for(&self, user_id: Uuid, role: Role) -> Vec<ServerEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(user, r, _)| *user == user_id && *r == role)
            .map(|(_, _, event)| event.clone())
            .collect()
    }

    pub fn positions_for(&self, patient_id: Uuid) -> Vec<u32> {
        self.events_for(patient_id, Role::Patient)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::PositionUpdate { position, .. } => Some(position),
                _ => None,
            })
            .collect()
    }

    pub fn last_position(&self, patient_id: Uuid) -> Option<u32> {
        self.positions_for(patient_id).last().copied()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, user_id: Uuid, role: Role, event: ServerEvent) -> bool {
        self.events.lock().unwrap().push((user_id, role, event));
        true
    }

    async fn deliver_resync(&self, user_id: Uuid, role: Role, snapshot: ResyncSnapshot) -> bool {
        self.events
            .lock()
            .unwrap()
            .push((user_id, role, ServerEvent::Resync { snapshot }));
        true
    }
}
