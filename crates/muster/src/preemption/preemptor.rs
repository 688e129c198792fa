use crate::common::queue::WaitQueue;
use crate::common::resources::{ResourceVector, RESOURCE_EPS};
use crate::config::PreemptionConfig;
use crate::respool::{PoolSnapshot, ResTree, ROOT_POOL_ID};
use crate::task::kill::KillCoordinator;
use crate::task::state::TaskState;
use crate::task::tracker::Tracker;
use crate::task::RmTask;
use crate::{Map, PoolId, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const REASON_PREEMPTED: &str = "preempted to reclaim over-allocated resources";

/// Watches for pools whose allocation persistently exceeds their
/// entitlement while siblings are starved, and nominates their cheapest
/// running preemptible tasks for killing.
pub struct Preemptor {
    tree: Arc<ResTree>,
    tracker: Arc<Tracker>,
    kill: Arc<KillCoordinator>,
    config: PreemptionConfig,
    /// Per-pool count of consecutive over-allocated cycles.
    streaks: Mutex<Map<PoolId, u32>>,
    /// PREEMPTING tasks surfaced to the job manager for graceful teardown.
    nominated: Arc<WaitQueue<TaskId>>,
}

impl Preemptor {
    pub fn new(
        tree: Arc<ResTree>,
        tracker: Arc<Tracker>,
        kill: Arc<KillCoordinator>,
        config: PreemptionConfig,
        nominated: Arc<WaitQueue<TaskId>>,
    ) -> Self {
        Self {
            tree,
            tracker,
            kill,
            config,
            streaks: Mutex::new(Map::new()),
            nominated,
        }
    }

    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.task_preemption_period;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("Preemptor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.preemption_cycle().await,
            }
        }
        log::info!("Preemptor stopped");
    }

    pub async fn preemption_cycle(&self) {
        if !self.config.enabled {
            return;
        }
        self.cross_pool_preemption().await;
        self.priority_preemption().await;
    }

    /// Reclaims resources from pools that stay over their entitlement
    /// while a pool in the same subtree has unmet demand.
    async fn cross_pool_preemption(&self) {
        for pool in self.tree.leaves() {
            let snapshot = pool.snapshot();
            let over = snapshot
                .allocation
                .total
                .exceeds(&snapshot.entitlement)
                .is_some();
            if !over {
                self.streaks.lock().remove(&snapshot.id);
                continue;
            }
            let streak = {
                let mut streaks = self.streaks.lock();
                let streak = streaks.entry(snapshot.id.clone()).or_insert(0);
                *streak += 1;
                *streak
            };
            if streak < self.config.sustained_over_allocation_count {
                continue;
            }
            if !self.starved_in_scope(&snapshot) {
                // Nobody who could inherit the excess is waiting for it.
                continue;
            }
            let deficit = snapshot
                .allocation
                .total
                .sub_clamped(&snapshot.entitlement);
            log::info!(
                "Pool {} over-allocated for {streak} cycles (deficit {deficit}), preempting",
                snapshot.id
            );
            self.preempt_in_pool(&snapshot.id, deficit).await;
            self.streaks.lock().remove(&snapshot.id);
        }
    }

    /// True when another leaf sharing a non-root ancestor with `pool` has
    /// queued demand it cannot place. Entitlement is distributed top-down,
    /// so capacity freed here only reaches pools under a common ancestor;
    /// starvation in a disjoint branch cannot license a preemption.
    fn starved_in_scope(&self, pool: &PoolSnapshot) -> bool {
        let mut ancestor = pool.parent.clone();
        while let Some(current) = ancestor {
            if current == ROOT_POOL_ID {
                return false;
            }
            let starved = self.tree.leaves_under(&current).into_iter().any(|leaf| {
                if *leaf.id() == pool.id {
                    return false;
                }
                let snapshot = leaf.snapshot();
                !snapshot.queued_demand.is_zero()
                    && snapshot
                        .allocation
                        .total
                        .exceeds(&snapshot.entitlement)
                        .is_none()
            });
            if starved {
                return true;
            }
            ancestor = match self.tree.get(&current) {
                Ok(node) => node.parent(),
                Err(_) => None,
            };
        }
        false
    }

    /// Within a single pool: when the head of the queue outranks running
    /// work and cannot fit the remaining headroom, lower-priority running
    /// preemptible tasks make room for it. No sustained-cycle requirement;
    /// a starved high-priority gang is acted on immediately.
    async fn priority_preemption(&self) {
        for pool in self.tree.leaves() {
            let snapshot = pool.snapshot();
            let Some(head) = pool.peek_gangs(1).into_iter().next() else {
                continue;
            };
            let headroom = snapshot
                .entitlement
                .sub_clamped(&snapshot.allocation.total);
            if head.demand.fits_in(&headroom) {
                // The scheduler will admit it on its own.
                continue;
            }
            let needed = head.demand.sub_clamped(&headroom);
            let mut victims: Vec<Arc<RmTask>> = Vec::new();
            self.tracker.for_each(|task| {
                if task.spec.pool == snapshot.id
                    && task.is_preemptible()
                    && !task.is_controller()
                    && task.spec.priority < head.priority
                    && task.state() == TaskState::Running
                {
                    victims.push(task.clone());
                }
            });
            victims.sort_by_key(|task| {
                let started = task.runtime().start_time;
                (task.spec.priority, started)
            });

            // Only kill if the freed resources actually admit the gang.
            let mut freed = ResourceVector::ZERO;
            let mut chosen = Vec::new();
            for task in victims {
                if needed.fits_in(&freed) {
                    break;
                }
                freed += task.spec.demand;
                chosen.push(task);
            }
            if !needed.fits_in(&freed) {
                continue;
            }
            log::info!(
                "Pool {}: preempting {} task(s) for higher-priority gang {}",
                snapshot.id,
                chosen.len(),
                head.id
            );
            for task in chosen {
                self.nominate(task.id()).await;
            }
        }
    }

    /// PREEMPTING + preemption queue + the shared kill path.
    async fn nominate(&self, id: TaskId) {
        if self
            .tracker
            .transition(id, TaskState::Preempting, Some(REASON_PREEMPTED.to_string()))
            .is_err()
        {
            return;
        }
        if self.nominated.try_push(id).is_err() {
            log::warn!("Preemption queue full, task {id} not surfaced");
        }
        if let Err(e) = self.kill.kill_task(id, REASON_PREEMPTED).await {
            log::warn!("Preemption kill of task {id} failed: {e}");
        }
    }

    /// Nominate running preemptible non-controller tasks in ascending
    /// (priority, start-time) order until the deficit is covered.
    async fn preempt_in_pool(&self, pool: &PoolId, mut deficit: ResourceVector) {
        let mut candidates: Vec<Arc<RmTask>> = Vec::new();
        self.tracker.for_each(|task| {
            if task.spec.pool == *pool
                && task.is_preemptible()
                && !task.is_controller()
                && task.state() == TaskState::Running
            {
                candidates.push(task.clone());
            }
        });
        candidates.sort_by_key(|task| {
            let started = task.runtime().start_time;
            (task.spec.priority, started)
        });

        for task in candidates {
            if deficit.is_zero() {
                break;
            }
            self.nominate(task.id()).await;
            deficit = deficit.sub_clamped(&task.spec.demand);
        }
        if deficit
            .iter()
            .any(|(_, v)| v > RESOURCE_EPS)
        {
            log::warn!(
                "Pool {pool}: preemptible candidates exhausted, residual deficit {deficit}"
            );
        }
    }
}
