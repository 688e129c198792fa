use crate::api::Store;
use crate::respool::{Gang, GangKind, ResTree};
use crate::task::rmtask::{RmTask, TaskFlags};
use crate::task::state::TaskState;
use crate::{GangId, Map, PoolId, Result, Set, TaskId};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const N_STRIPES: usize = 32;

pub(crate) fn gang_kind_of(flags: TaskFlags) -> GangKind {
    if flags.contains(TaskFlags::CONTROLLER) {
        GangKind::Controller
    } else if flags.contains(TaskFlags::REVOCABLE) {
        GangKind::Revocable
    } else {
        GangKind::NonRevocable
    }
}

/// A task-runtime change awaiting write-back to the durable store.
#[derive(Debug, Clone)]
pub struct RuntimeUpdate {
    pub task: TaskId,
    pub state: TaskState,
    pub host: Option<String>,
}

#[derive(Default)]
pub struct TrackerStats {
    /// Transitions rejected by the table; almost always racing status
    /// events that arrived out of order.
    pub illegal_transitions: AtomicU64,
    pub evicted: AtomicU64,
}

struct Stripe {
    tasks: RwLock<Map<TaskId, Arc<RmTask>>>,
}

/// Concurrent registry of all live tasks.
///
/// A striped map with per-entry locks inside [`RmTask`]: a transition holds
/// only that task's lock plus, for accounting, the owning pool's lock.
/// Terminal tasks linger for a grace period to absorb late status events,
/// then are evicted.
pub struct Tracker {
    stripes: Box<[Stripe]>,
    tree: Arc<ResTree>,
    gangs: RwLock<Map<GangId, Gang>>,
    host_index: RwLock<Map<String, Set<TaskId>>>,
    terminal: Mutex<VecDeque<(Instant, TaskId)>>,
    terminal_grace: Duration,
    /// Runtime changes not yet written back to the store, newest per task.
    dirty: Mutex<Map<TaskId, RuntimeUpdate>>,
    pub stats: TrackerStats,
}

impl Tracker {
    pub fn new(tree: Arc<ResTree>, terminal_grace: Duration) -> Self {
        let stripes = (0..N_STRIPES)
            .map(|_| Stripe {
                tasks: RwLock::new(Map::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            tree,
            gangs: RwLock::new(Map::new()),
            host_index: RwLock::new(Map::new()),
            terminal: Mutex::new(VecDeque::new()),
            terminal_grace,
            dirty: Mutex::new(Map::new()),
            stats: TrackerStats::default(),
        }
    }

    #[inline]
    fn stripe(&self, id: TaskId) -> &Stripe {
        let hash = fxhash::hash64(&id);
        &self.stripes[(hash as usize) % N_STRIPES]
    }

    /// Insert a task; returns false (and keeps the existing record) if the
    /// id is already tracked. The "already there" path makes recovery
    /// idempotent.
    pub fn add_task(&self, task: Arc<RmTask>) -> bool {
        let stripe = self.stripe(task.id());
        let mut tasks = stripe.tasks.write();
        if tasks.contains_key(&task.id()) {
            return false;
        }
        tasks.insert(task.id(), task);
        true
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<RmTask>> {
        self.stripe(id).tasks.read().get(&id).cloned()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.stripe(id).tasks.read().contains_key(&id)
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<RmTask>> {
        let removed = self.stripe(id).tasks.write().remove(&id);
        if let Some(task) = &removed {
            if let Some(host) = task.runtime().host.clone() {
                self.unindex_host(&host, id);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.tasks.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register_gang(&self, gang: Gang) {
        self.gangs.write().insert(gang.id, gang);
    }

    pub fn gang(&self, id: GangId) -> Option<Gang> {
        self.gangs.read().get(&id).cloned()
    }

    /// Shrink a gang after one of its members died individually. An empty
    /// gang is dropped.
    pub fn remove_gang_member(&self, gang: GangId, task: TaskId) {
        let demand = self.get(task).map(|t| t.spec.demand);
        let mut gangs = self.gangs.write();
        if let Some(meta) = gangs.get_mut(&gang) {
            meta.tasks.retain(|t| *t != task);
            if let Some(demand) = demand {
                meta.demand = meta.demand.sub_clamped(&demand);
            }
            if meta.tasks.is_empty() {
                gangs.remove(&gang);
            }
        }
    }

    /// Iterate over every tracked task. Used by the sweepers; O(n).
    pub fn for_each(&self, mut f: impl FnMut(&Arc<RmTask>)) {
        for stripe in self.stripes.iter() {
            for task in stripe.tasks.read().values() {
                f(task);
            }
        }
    }

    pub fn count_for_pool(&self, pool: &str) -> usize {
        let mut count = 0;
        self.for_each(|task| {
            if task.spec.pool == pool {
                count += 1;
            }
        });
        count
    }

    pub fn tasks_by_host(&self, host: &str) -> Vec<TaskId> {
        self.host_index
            .read()
            .get(host)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Advance a task through the state machine and apply the accounting
    /// side effects: releasing the pool allocation when the task stops
    /// holding resources, and maintaining the host index.
    ///
    /// Illegal transitions are counted and surfaced as an error; callers
    /// fed by racing status events ignore it.
    pub fn transition(
        &self,
        id: TaskId,
        to: TaskState,
        reason: Option<String>,
    ) -> Result<TaskState> {
        let task = self.get(id).ok_or(crate::Error::TaskNotFound(id))?;
        let (from, prev_host, new_host) = {
            let mut runtime = task.runtime();
            let prev_host = runtime.host.clone();
            let from = match task.transition_locked(&mut runtime, to, reason) {
                Ok(from) => from,
                Err(e) => {
                    self.stats.illegal_transitions.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            (from, prev_host, runtime.host.clone())
        };
        self.dirty.lock().insert(
            id,
            RuntimeUpdate {
                task: id,
                state: to,
                host: new_host,
            },
        );

        if from.holds_allocation() && !to.holds_allocation() {
            if let Ok(pool) = self.tree.get(&task.spec.pool) {
                pool.sub_allocation(gang_kind_of(task.spec.flags), task.spec.demand);
            }
        }
        if let Some(host) = prev_host {
            if !to.holds_allocation() {
                self.unindex_host(&host, id);
            }
        }
        if matches!(to, TaskState::Succeeded | TaskState::Killed) {
            self.schedule_eviction(id);
        }
        Ok(from)
    }

    /// Record the host chosen by placement and index the task under it.
    pub fn set_placement(&self, id: TaskId, host: String, ports: Vec<u32>) {
        if let Some(task) = self.get(id) {
            task.set_placement(host.clone(), ports);
            self.host_index
                .write()
                .entry(host)
                .or_default()
                .insert(id);
        }
    }

    fn unindex_host(&self, host: &str, id: TaskId) {
        let mut index = self.host_index.write();
        if let Some(set) = index.get_mut(host) {
            set.remove(&id);
            if set.is_empty() {
                index.remove(host);
            }
        }
    }

    /// Mark a task for eviction once the terminal grace period elapses.
    /// Called automatically for SUCCEEDED/KILLED; the retry logic calls it
    /// for FAILED/LOST tasks whose retry budget is spent.
    pub fn schedule_eviction(&self, id: TaskId) {
        self.terminal.lock().push_back((Instant::now(), id));
    }

    /// Drop terminal tasks whose grace period has passed. Tasks that were
    /// retried in the meantime are left alone.
    pub fn evict_due(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        {
            let mut terminal = self.terminal.lock();
            while let Some((at, _)) = terminal.front() {
                if now.duration_since(*at) < self.terminal_grace {
                    break;
                }
                let (_, id) = terminal.pop_front().unwrap();
                due.push(id);
            }
        }
        let mut evicted = 0;
        for id in due {
            let Some(task) = self.get(id) else { continue };
            if !task.state().is_terminal() {
                continue;
            }
            self.remove(id);
            self.gangs.write().remove(&task.gang);
            evicted += 1;
        }
        if evicted > 0 {
            self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            log::debug!("Evicted {evicted} terminal task(s)");
        }
        evicted as usize
    }

    /// Take the pending runtime write-backs, one (the newest) per task.
    pub fn drain_runtime_updates(&self) -> Vec<RuntimeUpdate> {
        let mut dirty = self.dirty.lock();
        dirty.drain().map(|(_, update)| update).collect()
    }

    /// Write pending task-runtime changes to the durable store. A failed
    /// write stays queued for the next pass, unless a newer update for the
    /// same task superseded it in the meantime.
    pub async fn flush_runtime_updates(&self, store: &dyn Store) {
        for update in self.drain_runtime_updates() {
            if let Err(e) = store
                .update_task_runtime(update.task, update.state, update.host.clone())
                .await
            {
                log::warn!("Runtime write-back for task {} failed: {e}", update.task);
                self.dirty.lock().entry(update.task).or_insert(update);
            }
        }
    }

    /// Snapshot of (task, state) pairs matching a filter; used by the
    /// service handler's queries.
    pub fn active_tasks(
        &self,
        pool: Option<&PoolId>,
        states: Option<&[TaskState]>,
    ) -> Vec<Arc<RmTask>> {
        let mut out = Vec::new();
        self.for_each(|task| {
            if let Some(pool) = pool {
                if task.spec.pool != *pool {
                    return;
                }
            }
            if let Some(states) = states {
                if !states.contains(&task.state()) {
                    return;
                }
            }
            out.push(task.clone());
        });
        out
    }
}

/// Periodic write-back of task-runtime changes to the store, so that a
/// later leader's recovery reads current state rather than whatever was
/// durable at task creation. Flushes one final time on cancellation,
/// leaving the store current across a graceful shutdown.
pub async fn runtime_writeback_loop(
    tracker: Arc<Tracker>,
    store: Arc<dyn Store>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    log::info!("Task runtime write-back started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tracker.flush_runtime_updates(store.as_ref()).await,
        }
    }
    tracker.flush_runtime_updates(store.as_ref()).await;
    log::info!("Task runtime write-back stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ResourceConfig, ResourcePoolConfig, SchedulingPolicy};
    use crate::common::resources::{ResourceKind, ResourceVector};
    use crate::respool::ROOT_POOL_ID;
    use crate::task::rmtask::TaskSpec;
    use crate::task::TaskType;

    fn tree_with_leaf() -> Arc<ResTree> {
        let tree = Arc::new(ResTree::new());
        tree.upsert(
            "respool1".to_string(),
            ResourcePoolConfig {
                name: "respool1".to_string(),
                parent: Some(ROOT_POOL_ID.to_string()),
                resources: vec![ResourceConfig {
                    kind: ResourceKind::Cpu,
                    reservation: 10.0,
                    limit: 100.0,
                    share: 1.0,
                }],
                policy: SchedulingPolicy::PriorityFifo,
            },
        )
        .unwrap();
        tree
    }

    fn task(id: u32, state: TaskState) -> Arc<RmTask> {
        Arc::new(RmTask::new(
            TaskSpec {
                id: TaskId::new_test(id),
                pool: "respool1".to_string(),
                demand: ResourceVector::new(2.0, 0.0, 0.0, 0.0),
                num_ports: 0,
                priority: 0,
                flags: TaskFlags::PREEMPTIBLE,
                task_type: TaskType::Batch,
                host_labels: Vec::new(),
                max_failures: 0,
            },
            GangId::new(1),
            state,
        ))
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let tracker = Tracker::new(tree_with_leaf(), Duration::from_secs(60));
        assert!(tracker.add_task(task(0, TaskState::Pending)));
        assert!(!tracker.add_task(task(0, TaskState::Pending)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn terminal_transition_releases_allocation() {
        let tree = tree_with_leaf();
        let pool = tree.get("respool1").unwrap();
        let tracker = Tracker::new(tree.clone(), Duration::from_secs(60));

        let t = task(0, TaskState::Running);
        pool.add_allocation(GangKind::NonRevocable, t.spec.demand);
        tracker.add_task(t);

        tracker
            .transition(TaskId::new_test(0), TaskState::Succeeded, None)
            .unwrap();
        assert!(pool.allocation().total.is_zero());
    }

    #[test]
    fn illegal_transition_is_counted() {
        let tracker = Tracker::new(tree_with_leaf(), Duration::from_secs(60));
        tracker.add_task(task(0, TaskState::Pending));
        assert!(tracker
            .transition(TaskId::new_test(0), TaskState::Running, None)
            .is_err());
        assert_eq!(tracker.stats.illegal_transitions.load(Ordering::Relaxed), 1);
        assert_eq!(
            tracker.get(TaskId::new_test(0)).unwrap().state(),
            TaskState::Pending
        );
    }

    #[test]
    fn host_index_follows_placement() {
        let tracker = Tracker::new(tree_with_leaf(), Duration::from_secs(60));
        tracker.add_task(task(0, TaskState::Placing));
        tracker.set_placement(TaskId::new_test(0), "host-1".to_string(), vec![31000]);
        assert_eq!(tracker.tasks_by_host("host-1"), vec![TaskId::new_test(0)]);

        tracker
            .transition(TaskId::new_test(0), TaskState::Placed, None)
            .unwrap();
        // Still placed on the host.
        assert_eq!(tracker.tasks_by_host("host-1").len(), 1);

        tracker
            .transition(TaskId::new_test(0), TaskState::Killed, None)
            .unwrap();
        assert!(tracker.tasks_by_host("host-1").is_empty());
    }

    #[tokio::test]
    async fn runtime_updates_flush_to_store() {
        let tracker = Tracker::new(tree_with_leaf(), Duration::from_secs(60));
        let store = crate::tests::utils::StubStore::new();

        // Two transitions before the flush coalesce into the newest state.
        tracker.add_task(task(0, TaskState::Pending));
        tracker
            .transition(TaskId::new_test(0), TaskState::Ready, None)
            .unwrap();
        tracker
            .transition(TaskId::new_test(0), TaskState::Placing, None)
            .unwrap();
        tracker.flush_runtime_updates(store.as_ref()).await;
        {
            let updates = store.updates.lock();
            assert_eq!(
                updates.as_slice(),
                &[(TaskId::new_test(0), TaskState::Placing, None)]
            );
        }

        // A failed write stays queued and lands on the next pass.
        tracker.add_task(task(1, TaskState::Running));
        tracker
            .transition(TaskId::new_test(1), TaskState::Succeeded, None)
            .unwrap();
        store.fail(true);
        tracker.flush_runtime_updates(store.as_ref()).await;
        assert_eq!(store.updates.lock().len(), 1);

        store.fail(false);
        tracker.flush_runtime_updates(store.as_ref()).await;
        let updates = store.updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[1],
            (TaskId::new_test(1), TaskState::Succeeded, None)
        );
    }

    #[test]
    fn eviction_waits_for_grace_and_skips_retried_tasks() {
        let tracker = Tracker::new(tree_with_leaf(), Duration::ZERO);
        let t = task(0, TaskState::Running);
        tracker.add_task(t.clone());
        tracker.register_gang(Gang {
            id: GangId::new(1),
            pool: "respool1".to_string(),
            tasks: vec![TaskId::new_test(0)],
            demand: t.spec.demand,
            priority: 0,
            kind: GangKind::NonRevocable,
            task_type: TaskType::Batch,
            seq: 0,
        });

        tracker
            .transition(TaskId::new_test(0), TaskState::Failed, None)
            .unwrap();
        tracker.schedule_eviction(TaskId::new_test(0));
        // Retried before eviction fires: the entry is stale.
        tracker
            .transition(TaskId::new_test(0), TaskState::Pending, None)
            .unwrap();
        assert_eq!(tracker.evict_due(Instant::now()), 0);
        assert!(tracker.contains(TaskId::new_test(0)));

        tracker
            .transition(TaskId::new_test(0), TaskState::Ready, None)
            .unwrap();
        tracker
            .transition(TaskId::new_test(0), TaskState::Killed, None)
            .unwrap();
        assert_eq!(tracker.evict_due(Instant::now()), 1);
        assert!(!tracker.contains(TaskId::new_test(0)));
        assert!(tracker.gang(GangId::new(1)).is_none());
    }
}
