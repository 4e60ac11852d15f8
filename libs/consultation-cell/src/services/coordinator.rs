use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use session_channel_cell::{
    ChannelDeparture, ChannelOpen, ConnectionHandle, DepartureReceiver, EventPublisher,
    SessionChannelHub,
};
use shared_config::CoordinationConfig;
use shared_models::realtime::{ClientCommand, ResyncSnapshot, Role, ServerEvent};
use video_conferencing_cell::{CallSessionManager, PullOutcome, RoomProvisioningGateway};
use waiting_queue_cell::QueueTracker;

use crate::error::ConsultationError;

/// Wires the session channels, queues and call sessions together and turns
/// client commands into queue and session operations.
pub struct ConsultationCoordinator {
    hub: SessionChannelHub,
    queue: Arc<QueueTracker>,
    sessions: Arc<CallSessionManager>,
}

impl ConsultationCoordinator {
    pub fn new(
        config: &CoordinationConfig,
        gateway: Arc<dyn RoomProvisioningGateway>,
    ) -> (Arc<Self>, DepartureReceiver) {
        let (hub, departures) = SessionChannelHub::new(config.grace_window);
        let publisher: Arc<dyn EventPublisher> = Arc::new(hub.clone());

        let queue = Arc::new(QueueTracker::new(config.clone(), Arc::clone(&publisher)));
        let sessions = Arc::new(CallSessionManager::new(
            config.clone(),
            gateway,
            Arc::clone(&queue),
            publisher,
        ));

        (Arc::new(Self { hub, queue, sessions }), departures)
    }

    pub fn hub(&self) -> &SessionChannelHub {
        &self.hub
    }

    pub fn queue(&self) -> &QueueTracker {
        &self.queue
    }

    pub fn sessions(&self) -> &CallSessionManager {
        &self.sessions
    }

    /// Bind a client channel and send its resync before anything else.
    pub async fn connect(&self, user_id: Uuid, role: Role) -> ChannelOpen {
        let open = self.hub.open(user_id, role).await;
        info!(
            "{} {} connected (connection {}, rebound: {})",
            role, user_id, open.handle.connection_id, open.rebound
        );
        self.resync(&open).await;
        open
    }

    /// A close frame ends the channel at once; anything else starts the grace window.
    pub async fn disconnect(&self, handle: &ConnectionHandle, graceful: bool) {
        if graceful {
            self.hub.close(handle).await;
        } else {
            self.hub.mark_stale(handle).await;
        }
    }

    /// Run one command, reporting failures to the sender as an `Error` event.
    pub async fn dispatch(&self, handle: &ConnectionHandle, command: ClientCommand) {
        let Err(err) = self.handle_command(handle, command).await else {
            return;
        };

        if err.is_silent() {
            debug!("Dropping {} from {}: {}", err.code(), handle.user_id, err);
            return;
        }

        warn!("Command from {} {} failed: {}", handle.role, handle.user_id, err);
        if let Err(send_err) = self
            .hub
            .send(handle, ServerEvent::error(err.code(), err.to_string()))
            .await
        {
            debug!("Could not report error to {}: {}", handle.user_id, send_err);
        }
    }

    pub async fn handle_command(
        &self,
        handle: &ConnectionHandle,
        command: ClientCommand,
    ) -> Result<(), ConsultationError> {
        self.hub.ensure_current(handle).await?;
        self.hub.touch(handle).await;

        match command {
            ClientCommand::JoinQueue {
                doctor_id,
                patient_id,
                room_name_hint,
            } => {
                Self::require_identity(handle, Role::Patient, patient_id)?;

                if let Some(session) = self.sessions.session_for_user(patient_id, Role::Patient).await
                {
                    return Err(ConsultationError::Conflict(format!(
                        "Patient is already in consultation session {}",
                        session.session_id
                    )));
                }

                self.hub.subscribe(handle, doctor_id).await?;
                let ticket = self
                    .queue
                    .join_queue(doctor_id, patient_id, room_name_hint.as_deref())
                    .await?;
                debug!(
                    "Join by {} answered with position {} (repeat: {})",
                    patient_id, ticket.position, ticket.already_queued
                );
                Ok(())
            }

            ClientCommand::LeaveQueue {
                doctor_id,
                patient_id,
            } => {
                Self::require_identity(handle, Role::Patient, patient_id)?;

                if self.sessions.withdraw_patient(doctor_id, patient_id).await {
                    return Ok(());
                }
                Err(ConsultationError::NotFound(format!(
                    "Patient {} is not queued for doctor {}",
                    patient_id, doctor_id
                )))
            }

            ClientCommand::PullNext { doctor_id } => {
                Self::require_identity(handle, Role::Doctor, doctor_id)?;

                match self.sessions.pull_next(doctor_id).await? {
                    PullOutcome::QueueEmpty => {
                        self.queue.rebroadcast(doctor_id).await;
                    }
                    PullOutcome::Invited(session) => {
                        debug!("Doctor {} invited session {}", doctor_id, session.session_id);
                    }
                    PullOutcome::Cancelled(session) => {
                        info!(
                            "Session {} was cancelled before the invite went out",
                            session.session_id
                        );
                    }
                }
                Ok(())
            }

            ClientCommand::EndSession { session_id } => {
                self.sessions.end_session(session_id, handle.user_id).await?;
                Ok(())
            }

            ClientCommand::ConfirmJoin { session_id } => {
                self.sessions.confirm_join(session_id, handle.user_id).await?;
                Ok(())
            }

            ClientCommand::Ping {} => {
                self.hub.send(handle, ServerEvent::Pong {}).await?;
                Ok(())
            }
        }
    }

    /// Domain cleanup once a channel is gone for good.
    pub async fn handle_departure(&self, departure: ChannelDeparture) {
        let ChannelDeparture { connection, reason } = departure;
        let user_id = connection.user_id;

        info!("{} {} departed ({:?})", connection.role, user_id, reason);

        if connection.role == Role::Patient {
            let left = self.queue.leave_all(user_id).await;
            if !left.is_empty() {
                info!("Removed departed patient {} from {} queue(s)", user_id, left.len());
            }
        }

        if let Some(session) = self.sessions.abandon_participant(user_id, connection.role).await {
            info!("Abandoned session {} after {} {} departed", session.session_id, connection.role, user_id);
        }
    }

    #[instrument(skip(self, departures))]
    pub async fn run_departure_worker(self: Arc<Self>, mut departures: DepartureReceiver) {
        while let Some(departure) = departures.recv().await {
            self.handle_departure(departure).await;
        }
        info!("Departure worker stopped");
    }

    // Private helper methods

    async fn resync(&self, open: &ChannelOpen) {
        let user_id = open.handle.user_id;

        let delivered = match open.handle.role {
            Role::Doctor => {
                let session = self
                    .sessions
                    .session_for_user(user_id, Role::Doctor)
                    .await
                    .map(|s| s.summary());
                self.queue.publish_doctor_resync(user_id, session).await
            }
            Role::Patient => {
                let session = self.sessions.session_for_user(user_id, Role::Patient).await;
                let doctor_id = session
                    .as_ref()
                    .map(|s| s.doctor_id)
                    .or(open.connection.subscribed_doctor_id);

                match doctor_id {
                    Some(doctor_id) => {
                        self.queue
                            .publish_patient_resync(doctor_id, user_id, session.map(|s| s.summary()))
                            .await
                    }
                    None => {
                        self.hub
                            .deliver_resync(user_id, Role::Patient, ResyncSnapshot::default())
                            .await
                    }
                }
            }
        };

        if !delivered {
            warn!("Resync for {} {} was not delivered", open.handle.role, user_id);
        }
    }

    fn require_identity(
        handle: &ConnectionHandle,
        role: Role,
        user_id: Uuid,
    ) -> Result<(), ConsultationError> {
        if handle.role != role || handle.user_id != user_id {
            return Err(ConsultationError::Unauthorized(format!(
                "Only the {} {} may do this",
                role, user_id
            )));
        }
        Ok(())
    }
}
