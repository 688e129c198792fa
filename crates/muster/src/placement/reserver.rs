use crate::placement::strategy::OfferLease;
use crate::task::state::TaskState;
use crate::task::tracker::Tracker;
use crate::{Map, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Reservation {
    task: TaskId,
    since: Instant,
}

/// Host reservation for stateful tasks.
///
/// A stateful task that keeps failing placement pins one concrete host;
/// offers from that host are then matched to the reserved task before the
/// strategy sees them. A reservation that does not complete within the
/// timeout is dropped and the task rejoins the ordinary path.
pub struct Reserver {
    tracker: Arc<Tracker>,
    reservations: Mutex<Map<String, Reservation>>,
    threshold: u32,
    timeout: Duration,
}

impl Reserver {
    pub fn new(tracker: Arc<Tracker>, threshold: u32, timeout: Duration) -> Self {
        Self {
            tracker,
            reservations: Mutex::new(Map::new()),
            threshold,
            timeout,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_reserved(&self, hostname: &str) -> bool {
        self.reservations.lock().contains_key(hostname)
    }

    /// Reserve `hostname` for a task that exhausted its placement rounds.
    /// The task must be a single-task gang; gangs cannot pin one host.
    pub fn reserve(&self, hostname: &str, task: TaskId) -> bool {
        let mut reservations = self.reservations.lock();
        if reservations.contains_key(hostname) {
            return false;
        }
        if self.tracker.transition(task, TaskState::Reserved, None).is_err() {
            return false;
        }
        log::info!("Task {task} reserved host {hostname}");
        reservations.insert(
            hostname.to_string(),
            Reservation {
                task,
                since: Instant::now(),
            },
        );
        true
    }

    /// Match freshly acquired offers against standing reservations.
    /// Returns (task, lease index) pairs the engine should place directly;
    /// the matched reservations are consumed.
    pub fn match_reserved(&self, leases: &[OfferLease]) -> Vec<(TaskId, usize)> {
        let mut reservations = self.reservations.lock();
        let mut matched = Vec::new();
        for (index, lease) in leases.iter().enumerate() {
            let hostname = &lease.offer.hostname;
            let Some(reservation) = reservations.get(hostname) else {
                continue;
            };
            let Some(task) = self.tracker.get(reservation.task) else {
                reservations.remove(hostname);
                continue;
            };
            if task.state() != TaskState::Reserved {
                reservations.remove(hostname);
                continue;
            }
            if task.spec.demand.fits_in(&lease.remaining) {
                matched.push((reservation.task, index));
                reservations.remove(hostname);
            }
        }
        matched
    }

    /// Drop reservations older than the timeout; their tasks return to
    /// READY and the caller feeds them back into placement.
    pub fn expire(&self, now: Instant) -> Vec<TaskId> {
        let mut reservations = self.reservations.lock();
        let expired: Vec<String> = reservations
            .iter()
            .filter(|(_, r)| now.duration_since(r.since) >= self.timeout)
            .map(|(host, _)| host.clone())
            .collect();
        let mut tasks = Vec::new();
        for host in expired {
            if let Some(reservation) = reservations.remove(&host) {
                log::info!(
                    "Reservation of host {host} by task {} expired",
                    reservation.task
                );
                if self
                    .tracker
                    .transition(reservation.task, TaskState::Ready, None)
                    .is_ok()
                {
                    tasks.push(reservation.task);
                }
            }
        }
        tasks
    }
}
