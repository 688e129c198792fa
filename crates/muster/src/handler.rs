//! In-process service façade: the operations the RPC layer dispatches to.
//! Wire transport, auth and metrics live outside the core; everything here
//! is plain method calls returning structured results.

use crate::api::{Placement, TaskStatusUpdate};
use crate::common::queue::WaitQueue;
use crate::common::IdCounter;
use crate::respool::{Gang, PoolSnapshot, ResTree};
use crate::task::kill::KillCoordinator;
use crate::task::rmtask::{is_system_failure, RmTask, TaskSpec};
use crate::task::scheduler::PlacementQueues;
use crate::task::state::TaskState;
use crate::task::tracker::{gang_kind_of, Tracker};
use crate::{Error, GangId, PoolId, Result, TaskId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const REASON_KILLED_BY_USER: &str = "killed on user request";

#[derive(Debug, Default)]
pub struct EnqueueGangsResponse {
    /// Tasks that could not be enqueued, with the reason.
    pub failed: Vec<(TaskId, String)>,
}

#[derive(Debug, Default)]
pub struct KillTasksResponse {
    pub killed: Vec<TaskId>,
    pub not_killed: Vec<(TaskId, String)>,
}

#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub state: TaskState,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActiveTasksFilter {
    pub pool: Option<PoolId>,
    pub states: Option<Vec<TaskState>>,
}

pub struct ServiceHandler {
    tree: Arc<ResTree>,
    tracker: Arc<Tracker>,
    queues: Arc<PlacementQueues>,
    placements: Arc<WaitQueue<Placement>>,
    preemption_queue: Arc<WaitQueue<TaskId>>,
    kill: Arc<KillCoordinator>,
    leader: AtomicBool,
    gang_ids: Mutex<IdCounter>,
    last_processed_offset: AtomicU64,
}

impl ServiceHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: Arc<ResTree>,
        tracker: Arc<Tracker>,
        queues: Arc<PlacementQueues>,
        placements: Arc<WaitQueue<Placement>>,
        preemption_queue: Arc<WaitQueue<TaskId>>,
        kill: Arc<KillCoordinator>,
    ) -> Self {
        Self {
            tree,
            tracker,
            queues,
            placements,
            preemption_queue,
            kill,
            leader: AtomicBool::new(false),
            gang_ids: Mutex::new(IdCounter::new(1)),
            last_processed_offset: AtomicU64::new(0),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub(crate) fn next_gang_id(&self) -> GangId {
        GangId::new(self.gang_ids.lock().increment())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.leader.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotLeader)
        }
    }

    /// Submit gangs to a leaf pool. Each inner vector is one gang; its
    /// tasks are created PENDING and the gang joins the pool queue.
    pub fn enqueue_gangs(
        &self,
        respool: &str,
        gangs: Vec<Vec<TaskSpec>>,
    ) -> Result<EnqueueGangsResponse> {
        self.ensure_leader()?;
        let pool = self.tree.get(respool)?;
        if !pool.is_leaf() {
            return Err(Error::PoolNotLeaf(respool.to_string()));
        }
        let mut response = EnqueueGangsResponse::default();
        'gangs: for specs in gangs {
            if let Err(reason) = validate_gang(&specs) {
                for spec in &specs {
                    response.failed.push((spec.id, reason.clone()));
                }
                continue;
            }
            for spec in &specs {
                if self.tracker.contains(spec.id) {
                    for spec in &specs {
                        response
                            .failed
                            .push((spec.id, "task already exists".to_string()));
                    }
                    continue 'gangs;
                }
            }

            let gang_id = self.next_gang_id();
            let kind = gang_kind_of(specs[0].flags);
            let mut gang = Gang {
                id: gang_id,
                pool: respool.to_string(),
                tasks: Vec::with_capacity(specs.len()),
                demand: Default::default(),
                priority: specs[0].priority,
                kind,
                task_type: specs[0].task_type,
                seq: 0,
            };
            let mut tasks = Vec::with_capacity(specs.len());
            for mut spec in specs {
                spec.pool = respool.to_string();
                gang.tasks.push(spec.id);
                gang.demand += spec.demand;
                tasks.push(Arc::new(RmTask::new(spec, gang_id, TaskState::Initialized)));
            }
            for task in &tasks {
                self.tracker.add_task(task.clone());
                let _ = self.tracker.transition(task.id(), TaskState::Pending, None);
                task.runtime().in_queue = true;
            }
            self.tracker.register_gang(gang.clone());
            log::debug!(
                "Enqueued gang {gang_id} ({} task(s)) into pool {respool}",
                gang.tasks.len()
            );
            pool.enqueue_gang(gang)?;
        }
        Ok(response)
    }

    /// Hand published placements to the launch side.
    pub async fn dequeue_placements(&self, limit: usize, timeout: Duration) -> Vec<Placement> {
        let placements = self.placements.pop_batch(limit, timeout).await;
        // Leaving the resource manager: the launch path owns them now.
        for placement in &placements {
            for task in &placement.tasks {
                let _ = self
                    .tracker
                    .transition(task.task_id, TaskState::Launching, None);
            }
        }
        placements
    }

    /// Alias of [`ServiceHandler::dequeue_placements`] kept for downstream
    /// consumers that poll rather than drain.
    pub async fn get_placements(&self, limit: usize, timeout: Duration) -> Vec<Placement> {
        self.dequeue_placements(limit, timeout).await
    }

    /// Apply a batch of fabric status events. Out-of-order events hit the
    /// transition table, get counted and are dropped; the batch always
    /// advances the offset.
    pub fn notify_task_updates(&self, updates: Vec<TaskStatusUpdate>) -> u64 {
        let mut offset = self.last_processed_offset.load(Ordering::SeqCst);
        for update in updates {
            offset = offset.max(update.offset);
            self.apply_status_update(update);
        }
        self.last_processed_offset.store(offset, Ordering::SeqCst);
        offset
    }

    fn apply_status_update(&self, update: TaskStatusUpdate) {
        let TaskStatusUpdate {
            task_id,
            state,
            reason,
            message,
            ..
        } = update;
        if let Some(message) = message {
            log::debug!("Status update for {task_id}: {state} ({message})");
        }
        match state {
            TaskState::Failed | TaskState::Lost => {
                if self
                    .tracker
                    .transition(task_id, state, reason.clone())
                    .is_err()
                {
                    return;
                }
                self.maybe_retry(task_id, state, reason.as_deref());
            }
            _ => {
                let _ = self.tracker.transition(task_id, state, reason);
            }
        }
    }

    /// FAILED/LOST tasks come back as PENDING while the restart policy
    /// (or the system-failure override) permits; otherwise they age out.
    fn maybe_retry(&self, task_id: TaskId, state: TaskState, reason: Option<&str>) {
        let Some(task) = self.tracker.get(task_id) else {
            return;
        };
        let retry = {
            let mut runtime = task.runtime();
            runtime.failures += 1;
            if !runtime.retry_allowed(task.spec.max_failures, reason) {
                false
            } else if state == TaskState::Lost && !is_system_failure(reason) {
                // LOST retries only when the budget is untouched; a lost
                // task may still be running somewhere.
                runtime.failures <= task.spec.max_failures
            } else {
                if runtime.failures > task.spec.max_failures {
                    runtime.system_failure_retries += 1;
                }
                true
            }
        };
        if retry {
            log::info!("Retrying task {task_id} after {state:?}");
            if self.tracker.transition(task_id, TaskState::Pending, None).is_ok() {
                task.runtime().in_queue = false;
            }
        } else {
            log::info!("Task {task_id} exhausted retries after {state:?}");
            self.tracker.schedule_eviction(task_id);
        }
    }

    /// Launch-side transitions (LAUNCHING ack, LAUNCHED, ...).
    pub fn update_tasks_state(&self, updates: Vec<(TaskId, TaskState)>) -> Result<()> {
        self.ensure_leader()?;
        for (task_id, state) in updates {
            let _ = self.tracker.transition(task_id, state, None);
        }
        Ok(())
    }

    pub async fn kill_tasks(&self, tasks: Vec<TaskId>) -> Result<KillTasksResponse> {
        self.ensure_leader()?;
        let mut response = KillTasksResponse::default();
        for task in tasks {
            match self.kill.kill_task(task, REASON_KILLED_BY_USER).await {
                Ok(()) => response.killed.push(task),
                Err(e) => response.not_killed.push((task, e.to_string())),
            }
        }
        Ok(response)
    }

    pub fn get_active_tasks(&self, filter: ActiveTasksFilter) -> Vec<ActiveTask> {
        self.tracker
            .active_tasks(filter.pool.as_ref(), filter.states.as_deref())
            .into_iter()
            .map(|task| {
                let runtime = task.runtime();
                ActiveTask {
                    task_id: task.spec.id,
                    state: runtime.state,
                    host: runtime.host.clone(),
                }
            })
            .collect()
    }

    /// Tasks nominated by the preemptor, for the job manager to tear down
    /// gracefully.
    pub async fn get_preemptible_tasks(&self, limit: usize, timeout: Duration) -> Vec<TaskId> {
        self.preemption_queue.pop_batch(limit, timeout).await
    }

    // Pool management.

    pub fn create_resource_pool(
        &self,
        id: PoolId,
        config: crate::api::ResourcePoolConfig,
    ) -> Result<()> {
        self.ensure_leader()?;
        if self.tree.contains(&id) {
            return Err(Error::InvalidArgument(format!(
                "resource pool {id} already exists"
            )));
        }
        self.tree.upsert(id, config)
    }

    pub fn update_resource_pool(
        &self,
        id: PoolId,
        config: crate::api::ResourcePoolConfig,
    ) -> Result<()> {
        self.ensure_leader()?;
        if !self.tree.contains(&id) {
            return Err(Error::PoolNotFound(id));
        }
        self.tree.upsert(id, config)
    }

    pub fn delete_resource_pool(&self, id: &str) -> Result<()> {
        self.ensure_leader()?;
        if self.tracker.count_for_pool(id) > 0 {
            return Err(Error::InvalidArgument(format!(
                "pool {id} still has active tasks"
            )));
        }
        self.tree.delete(id)
    }

    pub fn lookup_resource_pool_id(&self, path: &str) -> Result<PoolId> {
        Ok(self.tree.get_by_path(path)?.id().clone())
    }

    pub fn get_resource_pool(
        &self,
        id: &str,
        include_children: bool,
    ) -> Result<(PoolSnapshot, Vec<PoolSnapshot>)> {
        let pool = self.tree.get(id)?;
        let snapshot = pool.snapshot();
        let children = if include_children {
            snapshot
                .children
                .iter()
                .filter_map(|child| self.tree.get(child).ok())
                .map(|child| child.snapshot())
                .collect()
        } else {
            Vec::new()
        };
        Ok((snapshot, children))
    }

    pub fn query_resource_pools(&self) -> Vec<PoolSnapshot> {
        self.tree.pools().iter().map(|pool| pool.snapshot()).collect()
    }

    /// Queue depths, for observability snapshots.
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (
            self.queues.len(),
            self.placements.len(),
            self.preemption_queue.len(),
        )
    }
}

/// A gang must be non-empty and homogeneous: admission, placement and the
/// filter grouping all treat its tasks as interchangeable copies.
fn validate_gang(specs: &[TaskSpec]) -> std::result::Result<(), String> {
    let Some(first) = specs.first() else {
        return Err("gang must contain at least one task".to_string());
    };
    for spec in specs {
        if spec.demand.exceeds(&first.demand).is_some()
            || first.demand.exceeds(&spec.demand).is_some()
            || spec.num_ports != first.num_ports
            || spec.task_type != first.task_type
            || spec.host_labels != first.host_labels
            || gang_kind_of(spec.flags) != gang_kind_of(first.flags)
        {
            return Err("gang tasks must share demand, type and constraints".to_string());
        }
        for (kind, value) in spec.demand.iter() {
            if value < 0.0 {
                return Err(format!("negative {kind} demand"));
            }
        }
    }
    Ok(())
}
