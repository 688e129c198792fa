//! Declared interfaces of the external collaborators (host manager and the
//! durable job/task/pool store) plus the wire models exchanged with them.
//!
//! The core holds no durable state of its own; everything here is either
//! read back at recovery time or borrowed for the duration of one placement
//! round.

use crate::common::resources::{ResourceKind, ResourceVector};
use crate::task::{TaskState, TaskType};
use crate::{JobId, Map, PoolId, Priority, Result, TaskId};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Per-kind slice of a resource pool's policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: ResourceKind,
    /// Guaranteed minimum.
    pub reservation: f64,
    /// Hard ceiling on the pool's entitlement.
    pub limit: f64,
    /// Weight used to apportion surplus beyond reservations.
    pub share: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    #[default]
    PriorityFifo,
}

/// External representation of a resource pool, as persisted by the config
/// store. The root pool is implicit and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePoolConfig {
    pub name: String,
    pub parent: Option<PoolId>,
    pub resources: Vec<ResourceConfig>,
    pub policy: SchedulingPolicy,
}

impl ResourcePoolConfig {
    pub fn reservation(&self) -> ResourceVector {
        let mut v = ResourceVector::ZERO;
        for r in &self.resources {
            v.set(r.kind, r.reservation);
        }
        v
    }

    pub fn limit(&self) -> ResourceVector {
        // Kinds without an explicit entry are unconstrained.
        let mut v = ResourceVector::uniform(f64::INFINITY);
        for r in &self.resources {
            v.set(r.kind, r.limit);
        }
        v
    }

    pub fn share(&self) -> ResourceVector {
        let mut v = ResourceVector::ZERO;
        for r in &self.resources {
            v.set(r.kind, r.share);
        }
        v
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResourcePool {
    pub id: PoolId,
    pub config: ResourcePoolConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Initialized,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobState {
    pub const NON_TERMINAL: [JobState; 3] =
        [JobState::Initialized, JobState::Pending, JobState::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Killed)
    }
}

/// Job configuration as read back from the store during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJobConfig {
    pub id: JobId,
    pub respool: PoolId,
    pub instance_count: u32,
    /// Tasks of one job are gang-scheduled in groups of this size; 1 means
    /// every task is its own gang.
    pub min_instances: u32,
    pub priority: Priority,
    pub preemptible: bool,
    pub controller: bool,
    pub revocable: bool,
    pub task_type: TaskType,
    pub max_failures: u32,
}

/// Task record as read back from the store during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTask {
    pub id: TaskId,
    pub state: TaskState,
    pub demand: ResourceVector,
    pub num_ports: u32,
    pub host: Option<String>,
}

/// A time-bounded right to consume resources on one host, acquired from the
/// host manager for the duration of a placement round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostOffer {
    pub hostname: String,
    pub agent_id: String,
    pub resources: ResourceVector,
    /// Inclusive port ranges available on the host.
    pub port_ranges: SmallVec<[(u32, u32); 4]>,
    pub labels: Map<String, String>,
}

/// Constraints a batch of offers must satisfy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostFilter {
    /// Per-host minimum free resources.
    pub minimum: ResourceVector,
    pub required_labels: Vec<(String, String)>,
    /// Upper bound on the number of offers returned.
    pub limit: usize,
    /// Restrict offers to this host (used for reservation fulfilment).
    pub hostname: Option<String>,
}

#[derive(Debug, Default)]
pub struct AcquiredOffers {
    pub offers: Vec<HostOffer>,
    /// Why hosts were filtered out, keyed by reason, for diagnostics.
    pub filter_counts: Map<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedTask {
    pub task_id: TaskId,
    pub ports: SmallVec<[u32; 4]>,
}

/// The published decision pairing a gang's tasks with a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub hostname: String,
    pub agent_id: String,
    pub tasks: Vec<PlacedTask>,
    pub task_type: TaskType,
}

/// One element of a status-event batch delivered by the fabric (via the
/// event stream owned elsewhere).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub offset: u64,
}

/// Broker of host offers from the underlying cluster fabric.
///
/// Boxed futures rather than an async trait so the implementations stay
/// object-safe behind `Arc<dyn HostManager>`.
pub trait HostManager: Send + Sync {
    fn acquire_host_offers(&self, filter: HostFilter) -> BoxFuture<'_, Result<AcquiredOffers>>;

    fn release_host_offers(&self, offers: Vec<HostOffer>) -> BoxFuture<'_, Result<()>>;

    fn kill_tasks(&self, tasks: Vec<TaskId>) -> BoxFuture<'_, Result<()>>;

    fn cluster_capacity(&self) -> BoxFuture<'_, Result<ResourceVector>>;
}

/// Durable job/task/pool store. Assumed to expose idempotent CRUD by id;
/// only the read/update surface the core needs is declared here.
pub trait Store: Send + Sync {
    fn get_all_resource_pools(&self) -> BoxFuture<'_, Result<Vec<StoredResourcePool>>>;

    fn get_jobs_by_states(&self, states: Vec<JobState>) -> BoxFuture<'_, Result<Vec<JobId>>>;

    fn get_job_config(&self, job: JobId) -> BoxFuture<'_, Result<StoredJobConfig>>;

    fn get_job_runtime(&self, job: JobId) -> BoxFuture<'_, Result<JobState>>;

    fn get_tasks_for_job_by_range(
        &self,
        job: JobId,
        from: u32,
        to: u32,
    ) -> BoxFuture<'_, Result<Vec<StoredTask>>>;

    fn update_task_runtime(
        &self,
        task: TaskId,
        state: TaskState,
        host: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;
}
