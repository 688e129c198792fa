use crate::common::resources::ResourceVector;
use crate::task::state::{transition_allowed, TaskState};
use crate::task::TaskType;
use crate::{GangId, PoolId, Priority, Result, RunId, TaskId};
use parking_lot::{Mutex, MutexGuard};
use std::time::Instant;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskFlags: u32 {
        /// May be killed to reclaim resources for higher-priority demand.
        const PREEMPTIBLE = 0b0001;
        /// Orchestrates other tasks; admitted from the controller queue.
        const CONTROLLER  = 0b0010;
        /// May only consume surplus capacity beyond the pool reservation.
        const REVOCABLE   = 0b0100;
    }
}

/// Fabric failure reasons treated as system failures: they are retried once
/// even when the task's own retry budget is exhausted.
pub const REASON_CONTAINER_LAUNCH_FAILED: &str = "container-launch-failed";

pub fn is_system_failure(reason: Option<&str>) -> bool {
    matches!(reason, Some(REASON_CONTAINER_LAUNCH_FAILED))
}

/// Immutable description of a task as submitted by the client.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub pool: PoolId,
    pub demand: ResourceVector,
    pub num_ports: u32,
    pub priority: Priority,
    pub flags: TaskFlags,
    pub task_type: TaskType,
    /// Labels a host must carry for this task to land on it.
    pub host_labels: Vec<(String, String)>,
    /// FAILED -> PENDING retries allowed by the restart policy.
    pub max_failures: u32,
}

/// Mutable, per-task lock-protected runtime record.
#[derive(Debug)]
pub struct TaskRuntime {
    pub state: TaskState,
    pub reason: Option<String>,
    pub last_update: Instant,
    /// Consecutive placement attempts since the last successful PLACED.
    pub placement_attempts: u32,
    pub backoff_until: Option<Instant>,
    pub failures: u32,
    pub system_failure_retries: u32,
    pub kill_attempts: u32,
    pub run_id: RunId,
    pub prev_run_id: Option<RunId>,
    pub host: Option<String>,
    pub ports: Vec<u32>,
    pub start_time: Option<Instant>,
    /// Whether the owning gang currently sits in a pool queue. Guards the
    /// no-double-placement invariant on requeue.
    pub in_queue: bool,
}

impl TaskRuntime {
    fn new(state: TaskState) -> Self {
        Self {
            state,
            reason: None,
            last_update: Instant::now(),
            placement_attempts: 0,
            backoff_until: None,
            failures: 0,
            system_failure_retries: 0,
            kill_attempts: 0,
            run_id: RunId::new(0),
            prev_run_id: None,
            host: None,
            ports: Vec::new(),
            start_time: None,
            in_queue: false,
        }
    }

    /// Whether another FAILED/LOST -> PENDING retry is within policy.
    pub fn retry_allowed(&self, max_failures: u32, reason: Option<&str>) -> bool {
        if self.failures <= max_failures {
            return true;
        }
        // System failures get one extra attempt regardless of the policy.
        is_system_failure(reason) && self.system_failure_retries == 0
    }
}

pub struct RmTask {
    pub spec: TaskSpec,
    pub gang: GangId,
    runtime: Mutex<TaskRuntime>,
}

impl std::fmt::Debug for RmTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmTask")
            .field("id", &self.spec.id)
            .field("state", &self.state())
            .finish()
    }
}

impl RmTask {
    pub fn new(spec: TaskSpec, gang: GangId, state: TaskState) -> Self {
        Self {
            spec,
            gang,
            runtime: Mutex::new(TaskRuntime::new(state)),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.spec.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.runtime.lock().state
    }

    #[inline]
    pub fn runtime(&self) -> MutexGuard<'_, TaskRuntime> {
        self.runtime.lock()
    }

    #[inline]
    pub fn is_preemptible(&self) -> bool {
        self.spec.flags.contains(TaskFlags::PREEMPTIBLE)
    }

    #[inline]
    pub fn is_controller(&self) -> bool {
        self.spec.flags.contains(TaskFlags::CONTROLLER)
    }

    #[inline]
    pub fn is_revocable(&self) -> bool {
        self.spec.flags.contains(TaskFlags::REVOCABLE)
    }

    /// Advance the task state, enforcing the transition table.
    ///
    /// Returns the previous state on success. Illegal transitions leave the
    /// record untouched; callers decide whether that is an error (client
    /// request) or noise (racing status events).
    pub fn transition(&self, to: TaskState, reason: Option<String>) -> Result<TaskState> {
        let mut runtime = self.runtime.lock();
        self.transition_locked(&mut runtime, to, reason)
    }

    /// Same as [`RmTask::transition`] for callers already holding the lock.
    pub fn transition_locked(
        &self,
        runtime: &mut TaskRuntime,
        to: TaskState,
        reason: Option<String>,
    ) -> Result<TaskState> {
        let from = runtime.state;
        if !transition_allowed(from, to) {
            return Err(crate::Error::InvalidTransition {
                task: self.spec.id,
                from,
                to,
            });
        }
        log::debug!("Task {} transition {from:?} -> {to:?}", self.spec.id);
        runtime.state = to;
        runtime.reason = reason;
        runtime.last_update = Instant::now();
        match to {
            TaskState::Pending if matches!(from, TaskState::Failed | TaskState::Lost) => {
                // New attempt: a fresh, monotonically increasing run id.
                runtime.prev_run_id = Some(runtime.run_id);
                runtime.run_id = runtime.run_id.next();
                runtime.placement_attempts = 0;
                runtime.backoff_until = None;
                runtime.host = None;
                runtime.ports.clear();
                runtime.start_time = None;
            }
            TaskState::Pending => {
                runtime.host = None;
                runtime.ports.clear();
            }
            TaskState::Placed => {
                runtime.placement_attempts = 0;
                runtime.backoff_until = None;
            }
            TaskState::Running => {
                runtime.start_time = Some(Instant::now());
            }
            _ => {}
        }
        Ok(from)
    }

    /// Record the host and ports chosen by a placement round.
    pub fn set_placement(&self, host: String, ports: Vec<u32>) {
        let mut runtime = self.runtime.lock();
        runtime.host = Some(host);
        runtime.ports = ports;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn spec(id: u32) -> TaskSpec {
        TaskSpec {
            id: TaskId::new_test(id),
            pool: "respool1".to_string(),
            demand: ResourceVector::new(1.0, 10.0, 0.0, 0.0),
            num_ports: 0,
            priority: 0,
            flags: TaskFlags::PREEMPTIBLE,
            task_type: TaskType::Batch,
            host_labels: Vec::new(),
            max_failures: 1,
        }
    }

    #[test]
    fn illegal_transition_is_rejected_and_ignored() {
        let task = RmTask::new(spec(0), GangId::new(1), TaskState::Pending);
        assert!(task.transition(TaskState::Running, None).is_err());
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[test]
    fn retry_bumps_run_id_and_records_previous() {
        let task = RmTask::new(spec(0), GangId::new(1), TaskState::Running);
        task.transition(TaskState::Failed, None).unwrap();
        task.transition(TaskState::Pending, None).unwrap();
        let runtime = task.runtime();
        assert_eq!(runtime.run_id, RunId::new(1));
        assert_eq!(runtime.prev_run_id, Some(RunId::new(0)));
        assert!(runtime.host.is_none());
    }

    #[test]
    fn placed_resets_placement_attempts() {
        let task = RmTask::new(spec(0), GangId::new(1), TaskState::Ready);
        {
            let mut runtime = task.runtime();
            runtime.placement_attempts = 4;
        }
        task.transition(TaskState::Placing, None).unwrap();
        task.transition(TaskState::Placed, None).unwrap();
        assert_eq!(task.runtime().placement_attempts, 0);
    }

    #[test]
    fn system_failure_overrides_exhausted_retry_budget() {
        let mut runtime = TaskRuntime::new(TaskState::Failed);
        runtime.failures = 3;
        assert!(!runtime.retry_allowed(0, Some("oom")));
        assert!(runtime.retry_allowed(0, Some(REASON_CONTAINER_LAUNCH_FAILED)));
        runtime.system_failure_retries = 1;
        assert!(!runtime.retry_allowed(0, Some(REASON_CONTAINER_LAUNCH_FAILED)));
    }
}
