use crate::common::backoff::ExponentialBackoffPolicy;
use crate::common::queue::WaitQueue;
use crate::config::RmConfig;
use crate::respool::{Gang, ResTree};
use crate::task::state::TaskState;
use crate::task::tracker::Tracker;
use crate::task::{TaskType, TASK_TYPE_COUNT};
use crate::GangId;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reason attached to tasks returned by the placement engine after all
/// rounds and the deadline were exhausted.
pub const REASON_PLACEMENT_TIMEOUT: &str = "failed to place task after timeout";
pub const REASON_PLACING_DWELL: &str = "placing state timeout";
pub const REASON_LAUNCHING_DWELL: &str = "launching state timeout";
pub const REASON_KILLING_DWELL: &str = "killing state timeout";

const SCHEDULING_GANG_BATCH: usize = 100;

/// The global placement queue, partitioned by task type so that batch,
/// stateless and stateful placement run independently. Bounded: a full
/// queue pushes back on admission.
pub struct PlacementQueues {
    queues: [Arc<WaitQueue<Gang>>; TASK_TYPE_COUNT],
}

impl PlacementQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: [
                Arc::new(WaitQueue::new("placement-batch", capacity)),
                Arc::new(WaitQueue::new("placement-stateless", capacity)),
                Arc::new(WaitQueue::new("placement-stateful", capacity)),
            ],
        }
    }

    #[inline]
    pub fn queue(&self, task_type: TaskType) -> &Arc<WaitQueue<Gang>> {
        &self.queues[task_type.index()]
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

/// Periodically admits gangs from every leaf pool into the placement
/// queues and drives the task-level timers (state dwell timeouts, retry
/// backoff, terminal eviction).
pub struct TaskScheduler {
    tree: Arc<ResTree>,
    tracker: Arc<Tracker>,
    queues: Arc<PlacementQueues>,
    config: RmConfig,
    backoff: ExponentialBackoffPolicy,
}

impl TaskScheduler {
    pub fn new(
        tree: Arc<ResTree>,
        tracker: Arc<Tracker>,
        queues: Arc<PlacementQueues>,
        config: RmConfig,
    ) -> Self {
        let backoff = ExponentialBackoffPolicy::new(
            config.rm_task.backoff_base,
            config.rm_task.backoff_cap,
            config.rm_task.backoff_jitter,
        );
        Self {
            tree,
            tracker,
            queues,
            config,
            backoff,
        }
    }

    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.task_scheduling_period;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("Task scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.schedule_cycle(Instant::now()),
            }
        }
        log::info!("Task scheduler stopped");
    }

    /// One scheduling pass: sweep timers, then admit whatever fits.
    pub fn schedule_cycle(&self, now: Instant) {
        self.sweep_dwell_timeouts(now);
        self.requeue_backed_off(now);
        self.admit_gangs();
        self.tracker.evict_due(now);
    }

    /// Tasks stuck in a resource-manager-owned state beyond its dwell
    /// timeout go back to PENDING (with backoff); kills that never get an
    /// ack escalate to LOST.
    fn sweep_dwell_timeouts(&self, now: Instant) {
        let cfg = &self.config.rm_task;
        let mut stuck_gangs: Vec<(GangId, &'static str)> = Vec::new();
        let mut lost_kills = Vec::new();
        self.tracker.for_each(|task| {
            let runtime = task.runtime();
            let dwell = now.duration_since(runtime.last_update);
            match runtime.state {
                TaskState::Placing if dwell > cfg.placing_timeout => {
                    stuck_gangs.push((task.gang, REASON_PLACING_DWELL));
                }
                TaskState::Placed | TaskState::Launching if dwell > cfg.launching_timeout => {
                    stuck_gangs.push((task.gang, REASON_LAUNCHING_DWELL));
                }
                TaskState::Killing if dwell > cfg.killing_timeout => {
                    lost_kills.push(task.id());
                }
                _ => {}
            }
        });
        stuck_gangs.sort_unstable_by_key(|(id, _)| *id);
        stuck_gangs.dedup_by_key(|(id, _)| *id);
        for (gang, reason) in stuck_gangs {
            self.requeue_gang(gang, reason, true);
        }
        for id in lost_kills {
            log::warn!("Kill of task {id} timed out, marking LOST");
            let _ = self
                .tracker
                .transition(id, TaskState::Lost, Some(REASON_KILLING_DWELL.to_string()));
            self.tracker.schedule_eviction(id);
        }
    }

    /// Re-enqueue gangs whose backoff deadline has passed.
    fn requeue_backed_off(&self, now: Instant) {
        let mut due = Vec::new();
        self.tracker.for_each(|task| {
            let runtime = task.runtime();
            if runtime.state == TaskState::Pending && !runtime.in_queue {
                match runtime.backoff_until {
                    Some(deadline) if deadline > now => {}
                    _ => due.push(task.gang),
                }
            }
        });
        due.sort_unstable();
        due.dedup();
        for gang_id in due {
            self.enqueue_pending_gang(gang_id);
        }
    }

    fn enqueue_pending_gang(&self, gang_id: GangId) {
        let Some(gang) = self.tracker.gang(gang_id) else {
            return;
        };
        // The whole gang must be pending and unqueued; a partially killed
        // or already queued gang is left to its other driver.
        let members: Vec<_> = gang
            .tasks
            .iter()
            .filter_map(|id| self.tracker.get(*id))
            .collect();
        if members.len() != gang.tasks.len()
            || !members.iter().all(|t| {
                let rt = t.runtime();
                rt.state == TaskState::Pending && !rt.in_queue
            })
        {
            return;
        }
        let Ok(pool) = self.tree.get(&gang.pool) else {
            return;
        };
        if pool.enqueue_gang(gang).is_ok() {
            for task in &members {
                task.runtime().in_queue = true;
            }
        }
    }

    /// Admission: per leaf pool, dequeue gangs that fit the entitlement
    /// headroom, flip their tasks PENDING -> READY and hand them to the
    /// placement queues. A full placement queue reverts the admission and
    /// stops the pool's pass (backpressure).
    fn admit_gangs(&self) {
        for pool in self.tree.leaves() {
            loop {
                let admitted = pool.dequeue_gangs(
                    SCHEDULING_GANG_BATCH,
                    self.config.controller_quota_fraction,
                );
                if admitted.is_empty() {
                    break;
                }
                let count = admitted.len();
                let mut backpressured = false;
                for gang in admitted {
                    if !self.admit_one(&pool, gang) {
                        backpressured = true;
                        break;
                    }
                }
                if backpressured || count < SCHEDULING_GANG_BATCH {
                    break;
                }
            }
        }
    }

    fn admit_one(&self, pool: &Arc<crate::respool::ResPool>, gang: Gang) -> bool {
        for id in &gang.tasks {
            if let Some(task) = self.tracker.get(*id) {
                task.runtime().in_queue = false;
            }
            let _ = self.tracker.transition(*id, TaskState::Ready, None);
        }
        let queue = self.queues.queue(gang.task_type);
        match queue.try_push(gang) {
            Ok(()) => true,
            Err(gang) => {
                log::debug!(
                    "Placement queue {} full, returning gang {} to pool {}",
                    queue.name(),
                    gang.id,
                    gang.pool
                );
                // Undo the admission: READY -> PENDING releases the
                // allocation, then the gang resumes its old queue slot.
                for id in &gang.tasks {
                    let _ = self.tracker.transition(*id, TaskState::Pending, None);
                    if let Some(task) = self.tracker.get(*id) {
                        task.runtime().in_queue = true;
                    }
                }
                pool.requeue_gang(gang);
                false
            }
        }
    }

    /// Return a dequeued gang to PENDING for another attempt, applying the
    /// placement backoff policy. Shared by the dwell sweeper, the placement
    /// engine (round deadline exceeded) and the service handler.
    pub fn requeue_gang(&self, gang_id: GangId, reason: &str, bump_attempt: bool) {
        let Some(gang) = self.tracker.gang(gang_id) else {
            return;
        };
        let cfg = &self.config.rm_task;
        let mut backoff_until = None;
        for id in &gang.tasks {
            let Some(task) = self.tracker.get(*id) else {
                continue;
            };
            // PLACING has no direct edge to PENDING; it unwinds through
            // READY first.
            if task.state() == TaskState::Placing {
                let _ = self.tracker.transition(*id, TaskState::Ready, None);
            }
            if self
                .tracker
                .transition(*id, TaskState::Pending, Some(reason.to_string()))
                .is_err()
            {
                continue;
            }
            let Some(task) = self.tracker.get(*id) else {
                continue;
            };
            let mut runtime = task.runtime();
            if bump_attempt {
                runtime.placement_attempts += 1;
            }
            if cfg.enable_placement_backoff
                && runtime.placement_attempts > 0
                && runtime.placement_attempts % cfg.placement_attempts_per_cycle == 0
            {
                let cycle = runtime.placement_attempts / cfg.placement_attempts_per_cycle;
                let deadline = Instant::now() + self.backoff.delay(cycle.saturating_sub(1));
                runtime.backoff_until = Some(deadline);
                backoff_until = Some(deadline);
            } else {
                runtime.backoff_until = backoff_until;
            }
        }
        // Without a backoff deadline the gang goes straight back into its
        // pool queue; otherwise the backoff sweeper picks it up later.
        if backoff_until.is_none() {
            self.enqueue_pending_gang(gang_id);
        }
    }
}
