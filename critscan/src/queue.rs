use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::job::JobId;

/// Payload delivered to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub repository: String,
}

/// One delivery of a message. `attempt` starts at 1.
#[derive(Debug)]
pub struct Delivery {
    pub message: JobMessage,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: JobMessage,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(JobMessage, u32)>,
    dead: Vec<DeadLetter>,
    closed: bool,
}

/// In-process work queue with bounded redelivery.
///
/// A nacked delivery goes back to the tail until it has been attempted
/// `max_attempts` times; after that it is moved to the dead-letter list.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn publish(&self, message: JobMessage) {
        debug!(job_id = %message.job_id, "message published");
        self.state.lock().await.ready.push_back((message, 0));
        self.notify.notify_one();
    }

    /// Next delivery, if one is ready right now.
    pub async fn try_receive(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        state.ready.pop_front().map(|(message, attempts)| Delivery {
            message,
            attempt: attempts + 1,
        })
    }

    /// Wait for the next delivery. Returns `None` once the queue is closed
    /// and drained.
    pub async fn receive(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some((message, attempts)) = state.ready.pop_front() {
                    return Some(Delivery {
                        message,
                        attempt: attempts + 1,
                    });
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn ack(&self, delivery: Delivery) {
        debug!(job_id = %delivery.message.job_id, attempt = delivery.attempt, "delivery acknowledged");
    }

    pub async fn nack(&self, delivery: Delivery, error: impl Into<String>) -> NackOutcome {
        let error = error.into();
        let mut state = self.state.lock().await;
        if delivery.attempt < self.max_attempts {
            debug!(job_id = %delivery.message.job_id, attempt = delivery.attempt, "delivery requeued");
            state.ready.push_back((delivery.message, delivery.attempt));
            drop(state);
            self.notify.notify_one();
            NackOutcome::Requeued
        } else {
            warn!(
                job_id = %delivery.message.job_id,
                attempts = delivery.attempt,
                error = %error,
                "delivery dead-lettered"
            );
            state.dead.push(DeadLetter {
                message: delivery.message,
                attempts: delivery.attempt,
                error,
            });
            NackOutcome::DeadLettered
        }
    }

    /// Stop handing out new work once the ready list is empty.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(1)
    }
}
