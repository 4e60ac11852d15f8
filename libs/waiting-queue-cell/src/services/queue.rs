use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use session_channel_cell::EventPublisher;
use shared_config::CoordinationConfig;
use shared_models::realtime::{
    ResyncSnapshot, Role, ServerEvent, SessionSummary, WaitingPatient,
};

use crate::services::estimator::WaitEstimator;
use crate::{DoctorQueueSnapshot, QueueEntry, QueueError, QueuePosition, QueueTicket};

const MAX_ROOM_NAME_LEN: usize = 64;

/// One doctor's FIFO plus the patients it has promoted into consultation.
struct DoctorQueue {
    doctor_id: Uuid,
    entries: VecDeque<QueueEntry>,
    in_consultation: HashSet<Uuid>,
    /// Promoted patients who asked to leave before their session was claimed.
    leave_requested: HashSet<Uuid>,
    estimator: WaitEstimator,
}

impl DoctorQueue {
    fn new(doctor_id: Uuid, config: &CoordinationConfig) -> Self {
        Self {
            doctor_id,
            entries: VecDeque::new(),
            in_consultation: HashSet::new(),
            leave_requested: HashSet::new(),
            estimator: WaitEstimator::new(config.default_consultation, config.wait_smoothing),
        }
    }

    fn index_of(&self, patient_id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.patient_id == patient_id)
    }

    /// Drop the in-consultation marker. Returns whether the patient asked to
    /// leave while promoted.
    fn end_consultation(&mut self, patient_id: Uuid) -> bool {
        self.in_consultation.remove(&patient_id);
        self.leave_requested.remove(&patient_id)
    }

    fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    fn position_of(&self, patient_id: Uuid) -> Option<QueuePosition> {
        if self.in_consultation.contains(&patient_id) {
            return Some(QueuePosition {
                position: 0,
                estimated_wait: Duration::ZERO,
                queue_length: self.len(),
            });
        }

        self.index_of(patient_id).map(|index| {
            let position = index as u32 + 1;
            QueuePosition {
                position,
                estimated_wait: self.estimator.estimate(position),
                queue_length: self.len(),
            }
        })
    }

    fn waiting(&self) -> Vec<WaitingPatient> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| WaitingPatient {
                patient_id: entry.patient_id,
                position: index as u32 + 1,
                joined_at: entry.joined_at,
            })
            .collect()
    }

    fn ticket(&self, index: usize, already_queued: bool) -> QueueTicket {
        let entry = &self.entries[index];
        let position = index as u32 + 1;
        QueueTicket {
            doctor_id: self.doctor_id,
            patient_id: entry.patient_id,
            position,
            estimated_wait: self.estimator.estimate(position),
            queue_length: self.len(),
            room_name: entry.room_name.clone(),
            joined_at: entry.joined_at,
            already_queued,
        }
    }

    fn allocate_room_name(&self, hint: Option<&str>) -> String {
        let base = hint
            .map(sanitize_room_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("consult-{}", Uuid::new_v4().simple()));

        if self.entries.iter().any(|e| e.room_name == base) {
            suffixed_room_name(&base)
        } else {
            base
        }
    }
}

/// Lowercase alphanumerics and dashes only, bounded length.
pub fn sanitize_room_name(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();

    mapped
        .trim_matches('-')
        .chars()
        .take(MAX_ROOM_NAME_LEN)
        .collect()
}

pub fn suffixed_room_name(base: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

/// Owns every doctor's waiting queue.
///
/// Each doctor's queue sits behind its own lock, so mutations for one doctor
/// are serialized while different doctors proceed in parallel. Position
/// broadcasts are published while that lock is held, which keeps them in
/// mutation order.
pub struct QueueTracker {
    queues: RwLock<HashMap<Uuid, Arc<Mutex<DoctorQueue>>>>,
    sequence: AtomicU64,
    publisher: Arc<dyn EventPublisher>,
    config: CoordinationConfig,
}

impl QueueTracker {
    pub fn new(config: CoordinationConfig, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            publisher,
            config,
        }
    }

    /// Idempotent per (doctor, patient): a repeat join answers with the
    /// existing entry and leaves its rank untouched.
    pub async fn join_queue(
        &self,
        doctor_id: Uuid,
        patient_id: Uuid,
        room_name_hint: Option<&str>,
    ) -> Result<QueueTicket, QueueError> {
        if doctor_id == patient_id {
            return Err(QueueError::ValidationError(
                "A doctor cannot queue for themselves".to_string(),
            ));
        }

        let queue = self.queue(doctor_id).await;
        let mut queue = queue.lock().await;

        if queue.in_consultation.contains(&patient_id) {
            return Err(QueueError::InConsultation { doctor_id, patient_id });
        }

        if let Some(index) = queue.index_of(patient_id) {
            debug!("Patient {} already queued for doctor {}", patient_id, doctor_id);
            let ticket = queue.ticket(index, true);
            self.publisher
                .publish(patient_id, Role::Patient, Self::position_event(&ticket))
                .await;
            return Ok(ticket);
        }

        let entry = QueueEntry {
            entry_id: Uuid::new_v4(),
            patient_id,
            doctor_id,
            joined_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            room_name: queue.allocate_room_name(room_name_hint),
        };
        queue.entries.push_back(entry);

        let ticket = queue.ticket(queue.entries.len() - 1, false);
        info!(
            "Patient {} joined doctor {}'s queue at position {}",
            patient_id, doctor_id, ticket.position
        );

        self.broadcast(&queue).await;
        Ok(ticket)
    }

    /// Returns whether an entry was removed. Unknown entries are a no-op.
    pub async fn leave_queue(&self, doctor_id: Uuid, patient_id: Uuid) -> bool {
        let Some(queue) = self.existing_queue(doctor_id).await else {
            return false;
        };
        let mut queue = queue.lock().await;

        let Some(index) = queue.index_of(patient_id) else {
            debug!("Leave for patient {} not in doctor {}'s queue", patient_id, doctor_id);
            return false;
        };
        queue.entries.remove(index);

        info!("Patient {} left doctor {}'s queue", patient_id, doctor_id);
        self.broadcast(&queue).await;
        true
    }

    /// Remove a patient from every queue they wait in. Returns the affected doctors.
    pub async fn leave_all(&self, patient_id: Uuid) -> Vec<Uuid> {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        let mut left = Vec::new();

        for queue in queues {
            let mut queue = queue.lock().await;
            if let Some(index) = queue.index_of(patient_id) {
                queue.entries.remove(index);
                left.push(queue.doctor_id);
                self.broadcast(&queue).await;
            }
        }

        if !left.is_empty() {
            info!("Patient {} removed from {} queue(s)", patient_id, left.len());
        }
        left
    }

    pub async fn pop_next(&self, doctor_id: Uuid) -> Option<QueueEntry> {
        self.pop_next_where(doctor_id, |_| true).await
    }

    /// Atomically remove the first entry accepted by `eligible` and mark its
    /// patient as in consultation. Entries ahead of it keep their places.
    pub async fn pop_next_where<F>(&self, doctor_id: Uuid, eligible: F) -> Option<QueueEntry>
    where
        F: Fn(&QueueEntry) -> bool + Send,
    {
        let queue = self.existing_queue(doctor_id).await?;
        let mut queue = queue.lock().await;

        let index = queue.entries.iter().position(|entry| eligible(entry))?;
        let entry = queue.entries.remove(index)?;
        queue.in_consultation.insert(entry.patient_id);
        queue.leave_requested.remove(&entry.patient_id);

        info!(
            "Promoted patient {} from doctor {}'s queue ({} still waiting)",
            entry.patient_id,
            doctor_id,
            queue.len()
        );

        self.publisher
            .publish(
                entry.patient_id,
                Role::Patient,
                ServerEvent::PositionUpdate {
                    doctor_id,
                    patient_id: entry.patient_id,
                    position: 0,
                    estimated_wait_seconds: 0,
                    queue_length: queue.len(),
                },
            )
            .await;
        self.broadcast(&queue).await;

        Some(entry)
    }

    /// Put a promoted entry back at the head of its queue, unless the patient
    /// asked to leave in the meantime. Returns whether the entry was requeued.
    pub async fn requeue_front(&self, entry: QueueEntry) -> bool {
        let queue = self.queue(entry.doctor_id).await;
        let mut queue = queue.lock().await;

        if queue.end_consultation(entry.patient_id) {
            info!(
                "Patient {} left while promoted, not requeueing for doctor {}",
                entry.patient_id, entry.doctor_id
            );
            return false;
        }
        if let Some(index) = queue.index_of(entry.patient_id) {
            warn!(
                "Patient {} already back in doctor {}'s queue, moving to front",
                entry.patient_id, entry.doctor_id
            );
            queue.entries.remove(index);
        }

        info!("Requeued patient {} at front of doctor {}'s queue", entry.patient_id, entry.doctor_id);
        queue.entries.push_front(entry);
        self.broadcast(&queue).await;
        true
    }

    /// Undo a promotion that could not be claimed, putting the entry back at
    /// its original rank.
    pub async fn restore(&self, entry: QueueEntry) {
        let queue = self.queue(entry.doctor_id).await;
        let mut queue = queue.lock().await;

        if queue.end_consultation(entry.patient_id) {
            debug!("Patient {} left while promoted, dropping entry", entry.patient_id);
            return;
        }
        if queue.index_of(entry.patient_id).is_some() {
            return;
        }

        let index = queue
            .entries
            .iter()
            .position(|e| e.sequence > entry.sequence)
            .unwrap_or(queue.entries.len());
        debug!("Restoring patient {} to doctor {}'s queue", entry.patient_id, entry.doctor_id);
        queue.entries.insert(index, entry);
        self.broadcast(&queue).await;
    }

    /// Clear the in-consultation marker once a session no longer holds the patient.
    pub async fn release_consultation(&self, doctor_id: Uuid, patient_id: Uuid) -> bool {
        let Some(queue) = self.existing_queue(doctor_id).await else {
            return false;
        };
        let mut queue = queue.lock().await;
        let released = queue.in_consultation.contains(&patient_id);
        queue.end_consultation(patient_id);
        released
    }

    /// Record a leave from a patient who was already promoted out of the
    /// queue. Returns false when the patient is not in consultation with
    /// this doctor.
    pub async fn request_leave(&self, doctor_id: Uuid, patient_id: Uuid) -> bool {
        let Some(queue) = self.existing_queue(doctor_id).await else {
            return false;
        };
        let mut queue = queue.lock().await;

        if !queue.in_consultation.contains(&patient_id) {
            return false;
        }
        queue.leave_requested.insert(patient_id);
        debug!("Leave requested by promoted patient {} of doctor {}", patient_id, doctor_id);
        true
    }

    pub async fn leave_requested(&self, doctor_id: Uuid, patient_id: Uuid) -> bool {
        let Some(queue) = self.existing_queue(doctor_id).await else {
            return false;
        };
        let requested = queue.lock().await.leave_requested.contains(&patient_id);
        requested
    }

    /// Feed a finished consultation into the doctor's wait estimate.
    pub async fn record_consultation(&self, doctor_id: Uuid, duration: Duration) {
        let queue = self.queue(doctor_id).await;
        let mut queue = queue.lock().await;

        queue.estimator.record(duration);
        debug!(
            "Doctor {} average consultation now {:?}",
            doctor_id,
            queue.estimator.average()
        );
        self.broadcast(&queue).await;
    }

    /// Push fresh positions to everyone in the doctor's queue.
    pub async fn rebroadcast(&self, doctor_id: Uuid) {
        if let Some(queue) = self.existing_queue(doctor_id).await {
            let queue = queue.lock().await;
            self.broadcast(&queue).await;
        }
    }

    pub async fn position_of(&self, doctor_id: Uuid, patient_id: Uuid) -> Option<QueuePosition> {
        let queue = self.existing_queue(doctor_id).await?;
        let position = queue.lock().await.position_of(patient_id);
        position
    }

    pub async fn snapshot(&self, doctor_id: Uuid) -> DoctorQueueSnapshot {
        match self.existing_queue(doctor_id).await {
            Some(queue) => {
                let queue = queue.lock().await;
                DoctorQueueSnapshot {
                    doctor_id,
                    queue_length: queue.len(),
                    waiting: queue.waiting(),
                    average_consultation: queue.estimator.average(),
                    in_consultation: queue.in_consultation.iter().copied().collect(),
                }
            }
            None => DoctorQueueSnapshot {
                doctor_id,
                queue_length: 0,
                waiting: Vec::new(),
                average_consultation: self.config.default_consultation,
                in_consultation: Vec::new(),
            },
        }
    }

    /// Resync a patient from inside the queue's critical section, so no
    /// position update for this queue can slip in ahead of the snapshot.
    pub async fn publish_patient_resync(
        &self,
        doctor_id: Uuid,
        patient_id: Uuid,
        session: Option<SessionSummary>,
    ) -> bool {
        let queue = self.queue(doctor_id).await;
        let queue = queue.lock().await;

        let position = queue.position_of(patient_id);
        let snapshot = ResyncSnapshot {
            doctor_id: Some(doctor_id),
            position: position.map(|p| p.position),
            estimated_wait_seconds: position.map(|p| p.estimated_wait.as_secs()),
            queue_length: Some(queue.len()),
            waiting: Vec::new(),
            session,
        };

        self.publisher
            .deliver_resync(patient_id, Role::Patient, snapshot)
            .await
    }

    pub async fn publish_doctor_resync(
        &self,
        doctor_id: Uuid,
        session: Option<SessionSummary>,
    ) -> bool {
        let queue = self.queue(doctor_id).await;
        let queue = queue.lock().await;

        let snapshot = ResyncSnapshot {
            doctor_id: Some(doctor_id),
            position: None,
            estimated_wait_seconds: None,
            queue_length: Some(queue.len()),
            waiting: queue.waiting(),
            session,
        };

        self.publisher
            .deliver_resync(doctor_id, Role::Doctor, snapshot)
            .await
    }

    // Private helper methods

    async fn broadcast(&self, queue: &DoctorQueue) {
        let queue_length = queue.len();

        for (index, entry) in queue.entries.iter().enumerate() {
            let position = index as u32 + 1;
            self.publisher
                .publish(
                    entry.patient_id,
                    Role::Patient,
                    ServerEvent::PositionUpdate {
                        doctor_id: queue.doctor_id,
                        patient_id: entry.patient_id,
                        position,
                        estimated_wait_seconds: queue.estimator.estimate(position).as_secs(),
                        queue_length,
                    },
                )
                .await;
        }

        self.publisher
            .publish(
                queue.doctor_id,
                Role::Doctor,
                ServerEvent::QueueSnapshot {
                    doctor_id: queue.doctor_id,
                    queue_length,
                    waiting: queue.waiting(),
                },
            )
            .await;

        debug!("Broadcast positions for doctor {} ({} waiting)", queue.doctor_id, queue_length);
    }

    fn position_event(ticket: &QueueTicket) -> ServerEvent {
        ServerEvent::PositionUpdate {
            doctor_id: ticket.doctor_id,
            patient_id: ticket.patient_id,
            position: ticket.position,
            estimated_wait_seconds: ticket.estimated_wait.as_secs(),
            queue_length: ticket.queue_length,
        }
    }

    async fn queue(&self, doctor_id: Uuid) -> Arc<Mutex<DoctorQueue>> {
        if let Some(queue) = self.queues.read().await.get(&doctor_id) {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write().await;
        Arc::clone(
            queues
                .entry(doctor_id)
                .or_insert_with(|| Arc::new(Mutex::new(DoctorQueue::new(doctor_id, &self.config)))),
        )
    }

    async fn existing_queue(&self, doctor_id: Uuid) -> Option<Arc<Mutex<DoctorQueue>>> {
        self.queues.read().await.get(&doctor_id).cloned()
    }
}
