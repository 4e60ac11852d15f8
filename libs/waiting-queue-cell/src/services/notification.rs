use std::time::Duration;

use serde::{Deserialize, Serialize};

use shared_models::realtime::ServerEvent;

pub const DEFAULT_SHORT_WAIT_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    InConsultation,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueObservation {
    pub previous_position: Option<u32>,
    pub current_position: u32,
    pub estimated_wait: Duration,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueNotification {
    MovedUp { position: u32 },
    AlmostYourTurn,
    ConsultationStarting,
    ShortWait { estimated_wait_seconds: u64 },
}

/// Turns a patient's stream of queue observations into user-facing
/// notifications, each milestone at most once.
///
/// Only the best position seen so far can be improved on, so repeated or
/// reordered deliveries of an old position never fire again. Latches are
/// cleared only when the patient leaves the queue.
#[derive(Debug, Clone)]
pub struct NotificationDedupGuard {
    short_wait_threshold: Duration,
    best_position: Option<u32>,
    last_position: Option<u32>,
    almost_turn_fired: bool,
    starting_fired: bool,
    short_wait_fired: bool,
}

impl Default for NotificationDedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_SHORT_WAIT_THRESHOLD)
    }
}

impl NotificationDedupGuard {
    pub fn new(short_wait_threshold: Duration) -> Self {
        Self {
            short_wait_threshold,
            best_position: None,
            last_position: None,
            almost_turn_fired: false,
            starting_fired: false,
            short_wait_fired: false,
        }
    }

    pub fn observe(&mut self, observation: QueueObservation) -> Vec<QueueNotification> {
        let mut fired = Vec::new();

        if observation.status == QueueStatus::Left {
            self.reset();
            return fired;
        }

        let current = observation.current_position;
        let previously_queued = observation.previous_position.is_some_and(|p| p > 0)
            || self.best_position.is_some_and(|p| p > 0);

        if current == 0 || observation.status == QueueStatus::InConsultation {
            if previously_queued && !self.starting_fired {
                self.starting_fired = true;
                fired.push(QueueNotification::ConsultationStarting);
            }
            self.last_position = Some(0);
            return fired;
        }

        // Back in the queue after a promotion that fell through.
        if self.last_position == Some(0) || observation.previous_position == Some(0) {
            self.starting_fired = false;
        }

        match self.best_position {
            Some(best) if best > 0 && current < best => {
                fired.push(QueueNotification::MovedUp { position: current });
                if current == 1 && !self.almost_turn_fired {
                    self.almost_turn_fired = true;
                    fired.push(QueueNotification::AlmostYourTurn);
                }
                self.best_position = Some(current);
            }
            Some(best) if best > 0 => {}
            _ => self.best_position = Some(current),
        }

        if observation.estimated_wait < self.short_wait_threshold && !self.short_wait_fired {
            self.short_wait_fired = true;
            fired.push(QueueNotification::ShortWait {
                estimated_wait_seconds: observation.estimated_wait.as_secs(),
            });
        }

        self.last_position = Some(current);
        fired
    }

    /// Feed a server event addressed to this patient. Events that carry no
    /// queue position produce nothing.
    pub fn observe_event(&mut self, event: &ServerEvent) -> Vec<QueueNotification> {
        let (position, wait_seconds) = match event {
            ServerEvent::PositionUpdate { position, estimated_wait_seconds, .. } => {
                (*position, *estimated_wait_seconds)
            }
            ServerEvent::Resync { snapshot } => match snapshot.position {
                Some(position) => (position, snapshot.estimated_wait_seconds.unwrap_or_default()),
                None => return Vec::new(),
            },
            _ => return Vec::new(),
        };

        let status = if position == 0 {
            QueueStatus::InConsultation
        } else {
            QueueStatus::Waiting
        };

        self.observe(QueueObservation {
            previous_position: self.last_position,
            current_position: position,
            estimated_wait: Duration::from_secs(wait_seconds),
            status,
        })
    }

    pub fn reset(&mut self) {
        self.best_position = None;
        self.last_position = None;
        self.almost_turn_fired = false;
        self.starting_fired = false;
        self.short_wait_fired = false;
    }
}
