use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_models::realtime::{ResyncSnapshot, Role, ServerEvent};

use crate::{
    ChannelDeparture, ChannelError, ChannelKey, ChannelOpen, ClientConnection,
    ConnectionHandle, DepartureReason, DepartureReceiver, EventSender,
};

enum SlotPhase {
    /// Bound, but the opening resync has not gone out yet. Events are held.
    Resyncing { held: Vec<ServerEvent> },
    Live,
    /// Transport lost; waiting out the grace window.
    Stale,
}

struct ChannelSlot {
    connection: ClientConnection,
    sender: Option<EventSender>,
    phase: SlotPhase,
    generation: u64,
}

impl ChannelSlot {
    fn dispatch(&mut self, event: ServerEvent) -> bool {
        match &mut self.phase {
            SlotPhase::Live => match &self.sender {
                Some(sender) => sender.send(event).is_ok(),
                None => false,
            },
            SlotPhase::Resyncing { held } => {
                held.push(event);
                true
            }
            SlotPhase::Stale => false,
        }
    }
}

/// Registry of client channels keyed by logical identity `(user, role)`.
///
/// Each slot outlives individual transport connections: a dropped transport
/// marks the slot stale, and a reconnect inside the grace window rebinds it.
/// Events to one slot are delivered in send order.
pub struct SessionChannelHub {
    slots: Arc<RwLock<HashMap<ChannelKey, Arc<Mutex<ChannelSlot>>>>>,
    departures: mpsc::UnboundedSender<ChannelDeparture>,
    grace_window: Duration,
    generation: Arc<AtomicU64>,
}

impl SessionChannelHub {
    pub fn new(grace_window: Duration) -> (Self, DepartureReceiver) {
        let (departures, departure_rx) = mpsc::unbounded_channel();

        let hub = Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            departures,
            grace_window,
            generation: Arc::new(AtomicU64::new(0)),
        };

        (hub, departure_rx)
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Bind a transport to `(user_id, role)`.
    ///
    /// The slot starts out holding events until [`deliver_resync`] is called,
    /// so the resync is always the first thing the client reads.
    ///
    /// [`deliver_resync`]: SessionChannelHub::deliver_resync
    pub async fn open(&self, user_id: Uuid, role: Role) -> ChannelOpen {
        let (sender, receiver) = mpsc::unbounded_channel();
        let generation = self.next_generation();
        let key = (user_id, role);

        let mut slots = self.slots.write().await;

        if let Some(existing) = slots.get(&key) {
            let mut slot = existing.lock().await;
            match slot.phase {
                SlotPhase::Stale => {
                    info!("Client {} ({}) reconnected within grace window", user_id, role)
                }
                _ => info!(
                    "Replacing live connection {} for {} ({})",
                    slot.connection.connection_id, user_id, role
                ),
            }

            slot.connection = slot.connection.rebind();
            slot.sender = Some(sender);
            slot.phase = SlotPhase::Resyncing { held: Vec::new() };
            slot.generation = generation;

            let connection = slot.connection.clone();
            return ChannelOpen {
                handle: connection.handle(),
                connection,
                receiver,
                rebound: true,
            };
        }

        let connection = ClientConnection::new(user_id, role);
        slots.insert(
            key,
            Arc::new(Mutex::new(ChannelSlot {
                connection: connection.clone(),
                sender: Some(sender),
                phase: SlotPhase::Resyncing { held: Vec::new() },
                generation,
            })),
        );

        debug!("Opened channel {} for {} ({})", connection.connection_id, user_id, role);
        ChannelOpen {
            handle: connection.handle(),
            connection,
            receiver,
            rebound: false,
        }
    }

    /// Send to one specific connection. Fails if the handle no longer owns its slot.
    pub async fn send(
        &self,
        handle: &ConnectionHandle,
        event: ServerEvent,
    ) -> Result<(), ChannelError> {
        let slot = self
            .slot(&handle.key())
            .await
            .ok_or(ChannelError::ConnectionNotFound(handle.connection_id))?;
        let mut slot = slot.lock().await;

        if slot.connection.connection_id != handle.connection_id {
            return Err(ChannelError::Superseded(handle.connection_id));
        }
        if matches!(slot.phase, SlotPhase::Stale) {
            return Err(ChannelError::Stale(handle.connection_id));
        }

        if slot.dispatch(event) {
            Ok(())
        } else {
            Err(ChannelError::ChannelClosed(handle.connection_id))
        }
    }

    /// Send to whatever connection currently represents `(user_id, role)`.
    pub async fn send_to(&self, user_id: Uuid, role: Role, event: ServerEvent) -> bool {
        match self.slot(&(user_id, role)).await {
            Some(slot) => {
                let delivered = slot.lock().await.dispatch(event);
                if !delivered {
                    debug!("Dropped event for {} ({}): channel stale or closed", user_id, role);
                }
                delivered
            }
            None => false,
        }
    }

    /// Deliver the opening resync, then release held events.
    ///
    /// Held queue views of the doctor the snapshot covers were computed before
    /// the snapshot and are dropped; everything else follows in order.
    pub async fn deliver_resync(&self, user_id: Uuid, role: Role, snapshot: ResyncSnapshot) -> bool {
        let Some(slot) = self.slot(&(user_id, role)).await else {
            debug!("No channel to resync for {} ({})", user_id, role);
            return false;
        };
        let mut slot = slot.lock().await;

        let scope = snapshot.doctor_id;
        let resync = ServerEvent::Resync { snapshot };

        match std::mem::replace(&mut slot.phase, SlotPhase::Live) {
            SlotPhase::Resyncing { held } => {
                let Some(sender) = slot.sender.clone() else {
                    return false;
                };
                if sender.send(resync).is_err() {
                    return false;
                }

                let mut superseded = 0usize;
                for event in held {
                    if scope.map_or(false, |doctor| event.is_queue_view_of(doctor)) {
                        superseded += 1;
                        continue;
                    }
                    let _ = sender.send(event);
                }

                debug!(
                    "Resynced {} ({}), dropped {} superseded events",
                    user_id, role, superseded
                );
                true
            }
            SlotPhase::Live => slot.dispatch(resync),
            SlotPhase::Stale => {
                slot.phase = SlotPhase::Stale;
                false
            }
        }
    }

    /// Transport dropped without a close. Keeps the slot for the grace window.
    pub async fn mark_stale(&self, handle: &ConnectionHandle) {
        let Some(slot) = self.slot(&handle.key()).await else {
            return;
        };

        let generation = {
            let mut slot = slot.lock().await;
            if slot.connection.connection_id != handle.connection_id {
                debug!(
                    "Ignoring transport loss of superseded connection {}",
                    handle.connection_id
                );
                return;
            }
            if matches!(slot.phase, SlotPhase::Stale) {
                return;
            }

            slot.phase = SlotPhase::Stale;
            slot.sender = None;
            slot.generation = self.next_generation();
            slot.generation
        };

        info!(
            "Connection {} for {} ({}) lost, holding state for {:?}",
            handle.connection_id, handle.user_id, handle.role, self.grace_window
        );

        let slots = Arc::clone(&self.slots);
        let departures = self.departures.clone();
        let grace = self.grace_window;
        let key = handle.key();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let mut slots = slots.write().await;
            let expired = match slots.get(&key) {
                Some(slot) => {
                    let slot = slot.lock().await;
                    slot.generation == generation && matches!(slot.phase, SlotPhase::Stale)
                }
                None => false,
            };
            if !expired {
                return;
            }

            if let Some(slot) = slots.remove(&key) {
                drop(slots);
                let connection = slot.lock().await.connection.clone();
                info!(
                    "Grace window expired for {} ({})",
                    connection.user_id, connection.role
                );
                if departures
                    .send(ChannelDeparture {
                        connection,
                        reason: DepartureReason::GraceExpired,
                    })
                    .is_err()
                {
                    warn!("Departure receiver dropped; grace expiry not handled");
                }
            }
        });
    }

    /// Intentional close. The client is treated as departed immediately.
    pub async fn close(&self, handle: &ConnectionHandle) -> bool {
        let key = handle.key();
        let mut slots = self.slots.write().await;

        let owns_slot = match slots.get(&key) {
            Some(slot) => slot.lock().await.connection.connection_id == handle.connection_id,
            None => false,
        };
        if !owns_slot {
            debug!("Close for superseded or unknown connection {}", handle.connection_id);
            return false;
        }

        let Some(slot) = slots.remove(&key) else {
            return false;
        };
        drop(slots);

        let connection = slot.lock().await.connection.clone();
        info!("Channel {} for {} ({}) closed", connection.connection_id, connection.user_id, connection.role);
        let _ = self.departures.send(ChannelDeparture {
            connection,
            reason: DepartureReason::Closed,
        });
        true
    }

    /// Fails unless `handle` is still the live connection for its client.
    pub async fn ensure_current(&self, handle: &ConnectionHandle) -> Result<(), ChannelError> {
        let slot = self
            .slot(&handle.key())
            .await
            .ok_or(ChannelError::ConnectionNotFound(handle.connection_id))?;
        let slot = slot.lock().await;

        if slot.connection.connection_id != handle.connection_id {
            return Err(ChannelError::Superseded(handle.connection_id));
        }
        if matches!(slot.phase, SlotPhase::Stale) {
            return Err(ChannelError::Stale(handle.connection_id));
        }
        Ok(())
    }

    pub async fn touch(&self, handle: &ConnectionHandle) {
        if let Some(slot) = self.slot(&handle.key()).await {
            let mut slot = slot.lock().await;
            if slot.connection.connection_id == handle.connection_id {
                slot.connection.last_seen_at = Utc::now();
            }
        }
    }

    /// Remember which doctor's queue a patient is following, for resync on reconnect.
    pub async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        doctor_id: Uuid,
    ) -> Result<(), ChannelError> {
        let slot = self
            .slot(&handle.key())
            .await
            .ok_or(ChannelError::ConnectionNotFound(handle.connection_id))?;
        let mut slot = slot.lock().await;

        if slot.connection.connection_id != handle.connection_id {
            return Err(ChannelError::Superseded(handle.connection_id));
        }
        slot.connection.subscribed_doctor_id = Some(doctor_id);
        Ok(())
    }

    pub async fn connection(&self, user_id: Uuid, role: Role) -> Option<ClientConnection> {
        let slot = self.slot(&(user_id, role)).await?;
        let connection = slot.lock().await.connection.clone();
        Some(connection)
    }

    pub async fn is_live(&self, user_id: Uuid, role: Role) -> bool {
        let Some(slot) = self.slot(&(user_id, role)).await else {
            return false;
        };
        let stale = matches!(slot.lock().await.phase, SlotPhase::Stale);
        !stale
    }

    pub async fn active_connections(&self) -> Vec<ClientConnection> {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut connections = Vec::with_capacity(slots.len());
        for slot in slots {
            connections.push(slot.lock().await.connection.clone());
        }
        connections
    }

    async fn slot(&self, key: &ChannelKey) -> Option<Arc<Mutex<ChannelSlot>>> {
        self.slots.read().await.get(key).cloned()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Clone for SessionChannelHub {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            departures: self.departures.clone(),
            grace_window: self.grace_window,
            generation: Arc::clone(&self.generation),
        }
    }
}
