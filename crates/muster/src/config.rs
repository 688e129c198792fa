use crate::task::{TaskType, TASK_TYPE_COUNT};
use std::ops::Index;
use std::time::Duration;

/// Per-task-type table of settings (placement rounds, deadlines, ...).
#[derive(Debug, Clone, Copy)]
pub struct TaskTypeMap<T>([T; TASK_TYPE_COUNT]);

impl<T: Copy> TaskTypeMap<T> {
    pub fn uniform(value: T) -> Self {
        Self([value; TASK_TYPE_COUNT])
    }

    pub fn set(&mut self, task_type: TaskType, value: T) {
        self.0[task_type.index()] = value;
    }
}

impl<T> Index<TaskType> for TaskTypeMap<T> {
    type Output = T;

    #[inline]
    fn index(&self, task_type: TaskType) -> &T {
        &self.0[task_type.index()]
    }
}

#[derive(Debug, Clone)]
pub struct PreemptionConfig {
    pub enabled: bool,
    pub task_preemption_period: Duration,
    /// A pool must stay over its entitlement for this many consecutive
    /// preemptor cycles before its tasks are nominated.
    pub sustained_over_allocation_count: u32,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            task_preemption_period: Duration::from_secs(60),
            sustained_over_allocation_count: 5,
        }
    }
}

/// Name of the retry-delay policy applied between placement attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffPolicyName {
    #[default]
    ExponentialBackoff,
}

#[derive(Debug, Clone)]
pub struct RmTaskConfig {
    pub placing_timeout: Duration,
    pub launching_timeout: Duration,
    pub killing_timeout: Duration,
    pub policy_name: BackoffPolicyName,
    pub enable_placement_backoff: bool,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: Duration,
    /// Placement attempts granted per scheduling cycle before backoff kicks
    /// in between further attempts.
    pub placement_attempts_per_cycle: u32,
    /// Kill RPC attempts before the task is surfaced as `KillFailed`.
    pub max_kill_attempts: u32,
    /// How long terminal tasks linger in the tracker to absorb late status
    /// events before they are evicted.
    pub terminal_grace: Duration,
}

impl Default for RmTaskConfig {
    fn default() -> Self {
        Self {
            placing_timeout: Duration::from_secs(600),
            launching_timeout: Duration::from_secs(600),
            killing_timeout: Duration::from_secs(120),
            policy_name: BackoffPolicyName::ExponentialBackoff,
            enable_placement_backoff: true,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            backoff_jitter: Duration::from_secs(5),
            placement_attempts_per_cycle: 3,
            max_kill_attempts: 5,
            terminal_grace: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyName {
    #[default]
    Batch,
    Label,
}

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub task_dequeue_limit: usize,
    pub task_dequeue_timeout: Duration,
    /// Upper bound on offers requested from the host manager per acquire.
    pub offer_dequeue_limit: usize,
    pub max_placement_duration: TaskTypeMap<Duration>,
    pub max_rounds: TaskTypeMap<u32>,
    pub strategy: StrategyName,
    /// Placement workers per task type.
    pub concurrency: usize,
    /// Also fetch the tasks already running on acquired hosts, so that the
    /// strategy can evaluate task-task affinity.
    pub fetch_offer_tasks: bool,
    /// Failed stateful placements beyond this count reserve a host.
    pub reservation_threshold: u32,
    pub reservation_timeout: Duration,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            task_dequeue_limit: 100,
            task_dequeue_timeout: Duration::from_millis(100),
            offer_dequeue_limit: 1000,
            max_placement_duration: TaskTypeMap::uniform(Duration::from_secs(5)),
            max_rounds: TaskTypeMap::uniform(10),
            strategy: StrategyName::Batch,
            concurrency: 4,
            fetch_offer_tasks: false,
            reservation_threshold: 3,
            reservation_timeout: Duration::from_secs(120),
        }
    }
}

/// Top-level configuration of the resource manager core.
#[derive(Debug, Clone)]
pub struct RmConfig {
    pub task_scheduling_period: Duration,
    pub entitlement_calculation_period: Duration,
    pub preemption: PreemptionConfig,
    pub rm_task: RmTaskConfig,
    pub placement: PlacementConfig,
    /// Capacity of each per-type placement queue; acts as backpressure on
    /// the task scheduler.
    pub scheduler_queue_capacity: usize,
    /// Capacity of the published-placements queue.
    pub placement_output_capacity: usize,
    /// Capacity of the preemption queue surfaced to the job manager.
    pub preemption_queue_capacity: usize,
    /// Fraction of a leaf's entitlement reserved for controller tasks.
    pub controller_quota_fraction: f64,
    /// How long `stop` waits for the periodic loops to wind down.
    pub grace_period: Duration,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            task_scheduling_period: Duration::from_millis(100),
            entitlement_calculation_period: Duration::from_secs(15),
            preemption: PreemptionConfig::default(),
            rm_task: RmTaskConfig::default(),
            placement: PlacementConfig::default(),
            scheduler_queue_capacity: 10_000,
            placement_output_capacity: 10_000,
            preemption_queue_capacity: 10_000,
            controller_quota_fraction: 0.3,
            grace_period: Duration::from_secs(30),
        }
    }
}
