// libs/video-conferencing-cell/src/services/session.rs
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use session_channel_cell::EventPublisher;
use shared_config::CoordinationConfig;
use shared_models::realtime::{CallSessionState, Role, ServerEvent};
use waiting_queue_cell::{suffixed_room_name, QueueEntry, QueueTracker};

use crate::models::{
    CallSession, EndReason, ProvisionedRoom, PullOutcome, RoomGatewayError, RoomParticipant,
    VideoConferencingError,
};
use crate::services::room_gateway::RoomProvisioningGateway;

type SharedSession = Arc<Mutex<CallSession>>;

enum Claim {
    Claimed,
    DoctorBusy,
    PatientBusy,
}

/// Live sessions and the doctor/patient slots they occupy.
#[derive(Default)]
struct SessionIndex {
    sessions: HashMap<Uuid, SharedSession>,
    by_doctor: HashMap<Uuid, Uuid>,
    by_patient: HashMap<Uuid, Uuid>,
}

impl SessionIndex {
    fn claim(&mut self, session: &CallSession, shared: SharedSession) -> Claim {
        if self.by_doctor.contains_key(&session.doctor_id) {
            return Claim::DoctorBusy;
        }
        if self.by_patient.contains_key(&session.patient_id) {
            return Claim::PatientBusy;
        }
        self.by_doctor.insert(session.doctor_id, session.session_id);
        self.by_patient.insert(session.patient_id, session.session_id);
        self.sessions.insert(session.session_id, shared);
        Claim::Claimed
    }

    fn release(&mut self, session: &CallSession) {
        if self.by_doctor.get(&session.doctor_id) == Some(&session.session_id) {
            self.by_doctor.remove(&session.doctor_id);
        }
        if self.by_patient.get(&session.patient_id) == Some(&session.session_id) {
            self.by_patient.remove(&session.patient_id);
        }
    }
}

/// Owns the lifecycle of every consultation session.
///
/// Each session is mutated only under its own lock, and a transition the
/// state machine does not allow is silently ignored, so the first of any
/// racing end/abandon signals wins. A doctor and a patient each occupy at
/// most one session from promotion until the session starts ending.
pub struct CallSessionManager {
    gateway: Arc<dyn RoomProvisioningGateway>,
    queue: Arc<QueueTracker>,
    publisher: Arc<dyn EventPublisher>,
    config: CoordinationConfig,
    index: RwLock<SessionIndex>,
    archive: RwLock<VecDeque<CallSession>>,
    doctor_gates: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CallSessionManager {
    pub fn new(
        config: CoordinationConfig,
        gateway: Arc<dyn RoomProvisioningGateway>,
        queue: Arc<QueueTracker>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            gateway,
            queue,
            publisher,
            config,
            index: RwLock::new(SessionIndex::default()),
            archive: RwLock::new(VecDeque::new()),
            doctor_gates: RwLock::new(HashMap::new()),
        }
    }

    /// Promote the next patient in the doctor's queue and provision their room.
    ///
    /// The doctor's current session is dealt with first: an ACTIVE one is
    /// ended, an INVITED one is abandoned, one still provisioning is a
    /// conflict. The room is created outside every queue and session lock.
    #[instrument(skip(self))]
    pub async fn pull_next(
        self: &Arc<Self>,
        doctor_id: Uuid,
    ) -> Result<PullOutcome, VideoConferencingError> {
        let (session, entry) = {
            let gate = self.doctor_gate(doctor_id).await;
            let _serialized = gate.lock().await;

            self.close_doctor_session(doctor_id).await?;

            match self.promote(doctor_id).await? {
                Some(promoted) => promoted,
                None => {
                    debug!("Doctor {} pulled from an empty queue", doctor_id);
                    return Ok(PullOutcome::QueueEmpty);
                }
            }
        };

        let requested_name = entry.room_name.clone();
        let provisioned = self.provision(&requested_name).await;

        let mut current = session.lock().await;
        if current.state != CallSessionState::Provisioning {
            info!(
                "Session {} was cancelled during provisioning ({})",
                current.session_id, current.state
            );
            if let Ok(room) = provisioned {
                self.spawn_room_cleanup(room.room_id);
            }
            return Ok(PullOutcome::Cancelled(current.clone()));
        }

        match provisioned {
            Ok(room) => {
                current.room_id = Some(room.room_id);
                current.room_name = room.room_name;
                current.invited_at = Some(Utc::now());
                self.transition(&mut current, CallSessionState::Invited).await;

                for role in [Role::Patient, Role::Doctor] {
                    let user_id = match role {
                        Role::Patient => current.patient_id,
                        Role::Doctor => current.doctor_id,
                    };
                    self.publisher
                        .publish(
                            user_id,
                            role,
                            ServerEvent::Invite {
                                session_id: current.session_id,
                                room_name: current.room_name.clone(),
                                role,
                                doctor_id: current.doctor_id,
                                patient_id: current.patient_id,
                            },
                        )
                        .await;
                }

                self.spawn_invite_timer(current.session_id);
                info!(
                    "Session {} invited patient {} to room {}",
                    current.session_id, current.patient_id, current.room_name
                );
                Ok(PullOutcome::Invited(current.clone()))
            }
            Err(err) => {
                error!(
                    "Provisioning room {} for session {} failed: {}",
                    requested_name, current.session_id, err
                );
                current.end_reason = Some(EndReason::ProviderFailed);
                self.transition(&mut current, CallSessionState::ProvisionFailed).await;

                let patient_id = entry.patient_id;
                let requeued = self.queue.requeue_front(entry).await;
                self.release(&current).await;
                self.retire(&current).await;
                drop(current);

                if !requeued {
                    return Err(VideoConferencingError::Provider(err));
                }
                self.publisher
                    .publish(
                        patient_id,
                        Role::Patient,
                        ServerEvent::error(
                            "provider_unavailable",
                            "We could not start your consultation yet. You are still first in line.",
                        ),
                    )
                    .await;
                Err(VideoConferencingError::Provider(err))
            }
        }
    }

    /// Client-side confirmation that a participant joined the room. The
    /// patient's confirmation starts the call; the doctor's is recorded.
    pub async fn confirm_join(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CallSession, VideoConferencingError> {
        let session = self.live_session(session_id).await?;
        let mut current = session.lock().await;

        let role = current.role_of(user_id).ok_or(VideoConferencingError::Unauthorized)?;

        match (role, current.state) {
            (Role::Doctor, CallSessionState::Invited | CallSessionState::Active) => {
                current.doctor_confirmed_at.get_or_insert_with(Utc::now);
            }
            (Role::Patient, CallSessionState::Invited) => {
                current.started_at = Some(Utc::now());
                self.transition(&mut current, CallSessionState::Active).await;
                info!("Session {} is now active", session_id);
            }
            (Role::Patient, CallSessionState::Active) => {
                debug!("Duplicate join confirmation for session {}", session_id);
            }
            (_, state) if state.is_terminal() || state == CallSessionState::Ending => {
                return Err(VideoConferencingError::Stale(session_id));
            }
            (_, state) => return Err(VideoConferencingError::InvalidSessionState { state }),
        }

        Ok(current.clone())
    }

    /// Explicit "end call" from either participant. Waits for the room to be
    /// completed before returning. Ending an already ending or finished
    /// session is a no-op.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CallSession, VideoConferencingError> {
        let session = match self.live_session(session_id).await {
            Ok(session) => session,
            Err(VideoConferencingError::Stale(_)) => {
                let archived = self
                    .archived(session_id)
                    .await
                    .ok_or(VideoConferencingError::SessionNotFound(session_id))?;
                if !archived.involves(user_id) {
                    return Err(VideoConferencingError::Unauthorized);
                }
                return Ok(archived);
            }
            Err(err) => return Err(err),
        };

        let mut current = session.lock().await;
        let role = current.role_of(user_id).ok_or(VideoConferencingError::Unauthorized)?;
        let reason = EndReason::ended_by(role);

        let state = current.state;
        match state {
            CallSessionState::Active => {
                self.begin_ending(&mut current, reason).await;
                drop(current);
                Ok(self.complete(session).await)
            }
            _ if state.holds_participants() => {
                self.abandon(&mut current, reason).await;
                Ok(current.clone())
            }
            _ => {
                debug!("End for session {} ignored in state {}", session_id, state);
                Ok(current.clone())
            }
        }
    }

    /// A participant's channel stayed gone past the grace window.
    pub async fn abandon_participant(&self, user_id: Uuid, role: Role) -> Option<CallSession> {
        let session = self.holding_session(user_id, role).await?;
        let mut current = session.lock().await;

        if !current.state.holds_participants() {
            return None;
        }

        warn!(
            "Abandoning session {}: {} {} lost their connection",
            current.session_id, role, user_id
        );
        self.abandon(&mut current, EndReason::ParticipantLost).await;
        Some(current.clone())
    }

    /// Take a patient out of the doctor's line, wherever they are in it.
    ///
    /// A leave that loses the race with promotion cancels the session. If the
    /// session has not been claimed yet, the leave is recorded and promotion
    /// cancels it once claimed. Returns false when the patient is neither
    /// queued nor promoted for this doctor.
    pub async fn withdraw_patient(&self, doctor_id: Uuid, patient_id: Uuid) -> bool {
        if self.queue.leave_queue(doctor_id, patient_id).await {
            return true;
        }
        if !self.queue.request_leave(doctor_id, patient_id).await {
            return false;
        }

        match self.cancel_for_patient(doctor_id, patient_id).await {
            Some(session) => info!("Late leave cancelled session {}", session.session_id),
            None => debug!(
                "Leave by patient {} recorded ahead of their session",
                patient_id
            ),
        }
        true
    }

    /// Cancel the patient's live session with this doctor.
    pub async fn cancel_for_patient(
        &self,
        doctor_id: Uuid,
        patient_id: Uuid,
    ) -> Option<CallSession> {
        let session = self.holding_session(patient_id, Role::Patient).await?;
        let mut current = session.lock().await;

        if current.doctor_id != doctor_id || !current.state.holds_participants() {
            return None;
        }

        info!("Patient {} left; cancelling session {}", patient_id, current.session_id);
        self.abandon(&mut current, EndReason::PatientLeft).await;
        Some(current.clone())
    }

    /// The session currently occupying this participant, if any.
    pub async fn session_for_user(&self, user_id: Uuid, role: Role) -> Option<CallSession> {
        let session = self.holding_session(user_id, role).await?;
        let current = session.lock().await.clone();
        Some(current)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Option<CallSession> {
        let live = self.index.read().await.sessions.get(&session_id).cloned();
        match live {
            Some(session) => Some(session.lock().await.clone()),
            None => self.archived(session_id).await,
        }
    }

    pub async fn participants(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<RoomParticipant>, VideoConferencingError> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or(VideoConferencingError::SessionNotFound(session_id))?;

        let Some(room_id) = session.room_id else {
            return Ok(Vec::new());
        };

        match self.gateway.list_participants(&room_id).await {
            Ok(participants) => Ok(participants),
            Err(RoomGatewayError::RoomNotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn live_session_count(&self) -> usize {
        self.index.read().await.sessions.len()
    }

    // Private helper methods

    async fn close_doctor_session(
        self: &Arc<Self>,
        doctor_id: Uuid,
    ) -> Result<(), VideoConferencingError> {
        let Some(session) = self.holding_session(doctor_id, Role::Doctor).await else {
            return Ok(());
        };
        let mut current = session.lock().await;

        let state = current.state;
        match state {
            CallSessionState::Active => {
                self.begin_ending(&mut current, EndReason::NextPatient).await;
                drop(current);
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.complete(session).await;
                });
                Ok(())
            }
            CallSessionState::Invited => {
                self.abandon(&mut current, EndReason::NextPatient).await;
                Ok(())
            }
            CallSessionState::Idle | CallSessionState::Provisioning => {
                Err(VideoConferencingError::Conflict {
                    message: format!(
                        "Session {} is still being provisioned",
                        current.session_id
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    /// Pop the first patient not already held by another doctor's session
    /// and claim both slots for a new session.
    async fn promote(
        &self,
        doctor_id: Uuid,
    ) -> Result<Option<(SharedSession, QueueEntry)>, VideoConferencingError> {
        loop {
            let busy: HashSet<Uuid> =
                self.index.read().await.by_patient.keys().copied().collect();

            let Some(entry) = self
                .queue
                .pop_next_where(doctor_id, |entry| !busy.contains(&entry.patient_id))
                .await
            else {
                return Ok(None);
            };

            let session = CallSession::from_entry(&entry);
            let shared = Arc::new(Mutex::new(session.clone()));
            // Held until PROVISIONING so nobody acts on the session while IDLE.
            let mut current = shared.lock().await;

            let claim = self.index.write().await.claim(&session, Arc::clone(&shared));
            match claim {
                Claim::Claimed => {}
                Claim::PatientBusy => {
                    debug!(
                        "Patient {} was claimed by another session, restoring entry",
                        entry.patient_id
                    );
                    self.queue.restore(entry).await;
                    continue;
                }
                Claim::DoctorBusy => {
                    self.queue.restore(entry).await;
                    return Err(VideoConferencingError::Conflict {
                        message: format!("Doctor {} already has a session in progress", doctor_id),
                    });
                }
            }

            self.transition(&mut current, CallSessionState::Provisioning).await;

            if self.queue.leave_requested(doctor_id, entry.patient_id).await {
                info!(
                    "Patient {} left while being promoted, cancelling session {}",
                    entry.patient_id, session.session_id
                );
                self.abandon(&mut current, EndReason::PatientLeft).await;
                continue;
            }
            drop(current);

            info!(
                "Created session {} for doctor {} and patient {}",
                session.session_id, doctor_id, entry.patient_id
            );
            return Ok(Some((shared, entry)));
        }
    }

    #[instrument(skip(self))]
    async fn provision(&self, room_name: &str) -> Result<ProvisionedRoom, RoomGatewayError> {
        match self.create_room(room_name).await {
            Err(RoomGatewayError::RoomNameConflict { .. }) => {
                let retry_name = suffixed_room_name(room_name);
                warn!("Room name {} taken, retrying as {}", room_name, retry_name);
                self.create_room(&retry_name).await
            }
            other => other,
        }
    }

    async fn create_room(&self, room_name: &str) -> Result<ProvisionedRoom, RoomGatewayError> {
        match timeout(self.config.provider_timeout, self.gateway.create_room(room_name)).await {
            Ok(result) => result,
            Err(_) => Err(RoomGatewayError::ProviderUnavailable {
                message: format!(
                    "Room creation timed out after {:?}",
                    self.config.provider_timeout
                ),
            }),
        }
    }

    /// Complete the room, then the session. The room provider is retried a
    /// bounded number of times; the session completes regardless.
    async fn complete(&self, session: SharedSession) -> CallSession {
        let room_id = session.lock().await.room_id.clone();
        if let Some(room_id) = room_id {
            self.complete_room_with_retry(&room_id).await;
        }

        let mut current = session.lock().await;
        if self.transition(&mut current, CallSessionState::Completed).await {
            if let Some(duration) = current.consultation_duration() {
                self.queue.record_consultation(current.doctor_id, duration).await;
            }
            self.retire(&current).await;
            info!("Session {} completed", current.session_id);
        }
        current.clone()
    }

    async fn complete_room_with_retry(&self, room_id: &str) {
        let attempts = self.config.complete_room_attempts.max(1);

        for attempt in 1..=attempts {
            let result = timeout(self.config.provider_timeout, self.gateway.complete_room(room_id))
                .await
                .unwrap_or_else(|_| {
                    Err(RoomGatewayError::ProviderUnavailable {
                        message: "complete room timed out".to_string(),
                    })
                });

            match result {
                Ok(completed) => {
                    debug!("Room {} completed: {}", room_id, completed.status);
                    return;
                }
                Err(RoomGatewayError::RoomNotFound { .. }) => {
                    debug!("Room {} already gone, treating as complete", room_id);
                    return;
                }
                Err(err) => {
                    warn!(
                        "Completing room {} failed (attempt {}/{}): {}",
                        room_id, attempt, attempts, err
                    );
                    if attempt < attempts {
                        sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                }
            }
        }

        warn!("Giving up on completing room {}; session completes anyway", room_id);
    }

    async fn begin_ending(&self, session: &mut CallSession, reason: EndReason) {
        if self.transition(session, CallSessionState::Ending).await {
            session.ended_at = Some(Utc::now());
            session.end_reason = Some(reason);
            self.release(session).await;
        }
    }

    async fn abandon(&self, session: &mut CallSession, reason: EndReason) {
        let was_invited = session.state == CallSessionState::Invited;
        if !self.transition(session, CallSessionState::Abandoned).await {
            return;
        }

        session.ended_at = Some(Utc::now());
        session.end_reason = Some(reason);
        self.release(session).await;
        self.retire(session).await;

        if let Some(room_id) = session.room_id.clone() {
            self.spawn_room_cleanup(room_id);
        }
        if was_invited {
            self.queue.rebroadcast(session.doctor_id).await;
        }
    }

    async fn expire_invite(&self, session_id: Uuid) {
        let Ok(session) = self.live_session(session_id).await else {
            return;
        };
        let mut current = session.lock().await;
        if current.state != CallSessionState::Invited {
            return;
        }

        warn!("Session {} invite expired", session_id);
        self.abandon(&mut current, EndReason::InviteTimeout).await;
        self.publisher
            .publish(
                current.patient_id,
                Role::Patient,
                ServerEvent::error(
                    "timeout",
                    "The consultation invite expired. Please join the queue again.",
                ),
            )
            .await;
    }

    /// Apply a state change if the state machine allows it and tell both
    /// participants. Returns whether the change happened.
    async fn transition(&self, session: &mut CallSession, target: CallSessionState) -> bool {
        if !session.state.can_transition_to(&target) {
            debug!(
                "Session {} ignoring transition {} -> {}",
                session.session_id, session.state, target
            );
            return false;
        }

        debug!("Session {}: {} -> {}", session.session_id, session.state, target);
        session.state = target;

        let event = ServerEvent::SessionStateChanged {
            session_id: session.session_id,
            state: target,
        };
        self.publisher
            .publish(session.patient_id, Role::Patient, event.clone())
            .await;
        self.publisher
            .publish(session.doctor_id, Role::Doctor, event)
            .await;
        true
    }

    async fn release(&self, session: &CallSession) {
        self.index.write().await.release(session);
        self.queue
            .release_consultation(session.doctor_id, session.patient_id)
            .await;
    }

    async fn retire(&self, session: &CallSession) {
        self.index.write().await.sessions.remove(&session.session_id);

        let mut archive = self.archive.write().await;
        archive.push_back(session.clone());
        while archive.len() > self.config.archive_capacity {
            archive.pop_front();
        }
    }

    async fn archived(&self, session_id: Uuid) -> Option<CallSession> {
        self.archive
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    async fn live_session(&self, session_id: Uuid) -> Result<SharedSession, VideoConferencingError> {
        if let Some(session) = self.index.read().await.sessions.get(&session_id) {
            return Ok(Arc::clone(session));
        }

        if self.archived(session_id).await.is_some() {
            Err(VideoConferencingError::Stale(session_id))
        } else {
            Err(VideoConferencingError::SessionNotFound(session_id))
        }
    }

    async fn holding_session(&self, user_id: Uuid, role: Role) -> Option<SharedSession> {
        let index = self.index.read().await;
        let session_id = match role {
            Role::Doctor => index.by_doctor.get(&user_id),
            Role::Patient => index.by_patient.get(&user_id),
        }?;
        index.sessions.get(session_id).cloned()
    }

    async fn doctor_gate(&self, doctor_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(gate) = self.doctor_gates.read().await.get(&doctor_id) {
            return Arc::clone(gate);
        }
        Arc::clone(self.doctor_gates.write().await.entry(doctor_id).or_default())
    }

    fn spawn_invite_timer(self: &Arc<Self>, session_id: Uuid) {
        let manager = Arc::clone(self);
        let invite_timeout = self.config.invite_timeout;
        tokio::spawn(async move {
            sleep(invite_timeout).await;
            manager.expire_invite(session_id).await;
        });
    }

    fn spawn_room_cleanup(&self, room_id: String) {
        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            match gateway.complete_room(&room_id).await {
                Ok(_) | Err(RoomGatewayError::RoomNotFound { .. }) => {
                    debug!("Released room {}", room_id);
                }
                Err(err) => warn!("Failed to release room {}: {}", room_id, err),
            }
        });
    }
}
