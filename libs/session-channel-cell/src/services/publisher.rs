use async_trait::async_trait;
use uuid::Uuid;

use shared_models::realtime::{ResyncSnapshot, Role, ServerEvent};

use crate::services::hub::SessionChannelHub;

/// Outbound seam used by the queue tracker and call session manager.
///
/// Delivery is best effort: a stale or missing channel drops the event and the
/// client catches up through its resync on reconnect.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, user_id: Uuid, role: Role, event: ServerEvent) -> bool;

    async fn deliver_resync(&self, user_id: Uuid, role: Role, snapshot: ResyncSnapshot) -> bool;
}

#[async_trait]
impl EventPublisher for SessionChannelHub {
    async fn publish(&self, user_id: Uuid, role: Role, event: ServerEvent) -> bool {
        self.send_to(user_id, role, event).await
    }

    async fn deliver_resync(&self, user_id: Uuid, role: Role, snapshot: ResyncSnapshot) -> bool {
        SessionChannelHub::deliver_resync(self, user_id, role, snapshot).await
    }
}
