//! Shared fixtures: a small pool tree, stub collaborators and builders
//! used across the unit and scenario tests.

use crate::api::{
    AcquiredOffers, HostFilter, HostManager, HostOffer, JobState, Placement, ResourceConfig,
    ResourcePoolConfig, SchedulingPolicy, Store, StoredJobConfig, StoredResourcePool, StoredTask,
};
use crate::common::queue::WaitQueue;
use crate::common::resources::{ResourceKind, ResourceVector};
use crate::common::IdCounter;
use crate::config::{PreemptionConfig, RmConfig};
use crate::handler::ServiceHandler;
use crate::placement::{BatchStrategy, OfferService, PlacementEngine, Reserver};
use crate::preemption::Preemptor;
use crate::respool::{Gang, ResTree, ROOT_POOL_ID};
use crate::task::kill::KillCoordinator;
use crate::task::rmtask::{RmTask, TaskFlags, TaskSpec};
use crate::task::scheduler::{PlacementQueues, TaskScheduler};
use crate::task::tracker::{gang_kind_of, Tracker};
use crate::task::{TaskState, TaskType};
use crate::{GangId, JobId, Map, Result, TaskId};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ---------------------------------------------------------------- stubs

#[derive(Default)]
pub struct StubHostManager {
    pub capacity: Mutex<ResourceVector>,
    pub offers: Mutex<Vec<HostOffer>>,
    pub released: Mutex<Vec<HostOffer>>,
    pub killed: Mutex<Vec<TaskId>>,
    kill_failure: AtomicBool,
    capacity_failure: AtomicBool,
}

impl StubHostManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_capacity(&self, capacity: ResourceVector) {
        *self.capacity.lock() = capacity;
    }

    pub fn add_offer(&self, offer: HostOffer) {
        self.offers.lock().push(offer);
    }

    pub fn fail_kills(&self, fail: bool) {
        self.kill_failure.store(fail, Ordering::SeqCst);
    }

    pub fn fail_capacity(&self, fail: bool) {
        self.capacity_failure.store(fail, Ordering::SeqCst);
    }
}

pub fn offer(hostname: &str, cpu: f64) -> HostOffer {
    HostOffer {
        hostname: hostname.to_string(),
        agent_id: format!("agent-{hostname}"),
        resources: ResourceVector::new(cpu, 4096.0, 4096.0, 0.0),
        port_ranges: smallvec![(31000, 31999)],
        labels: Map::new(),
    }
}

impl HostManager for StubHostManager {
    fn acquire_host_offers(&self, filter: HostFilter) -> BoxFuture<'_, Result<AcquiredOffers>> {
        Box::pin(async move {
            let mut available = self.offers.lock();
            let mut taken = Vec::new();
            let mut kept = Vec::new();
            for offer in available.drain(..) {
                let matches = filter.minimum.fits_in(&offer.resources)
                    && filter
                        .required_labels
                        .iter()
                        .all(|(k, v)| offer.labels.get(k) == Some(v))
                    && filter
                        .hostname
                        .as_ref()
                        .map(|h| *h == offer.hostname)
                        .unwrap_or(true)
                    && (filter.limit == 0 || taken.len() < filter.limit);
                if matches {
                    taken.push(offer);
                } else {
                    kept.push(offer);
                }
            }
            *available = kept;
            Ok(AcquiredOffers {
                offers: taken,
                filter_counts: Map::new(),
            })
        })
    }

    fn release_host_offers(&self, offers: Vec<HostOffer>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.released.lock().extend(offers.iter().cloned());
            self.offers.lock().extend(offers);
            Ok(())
        })
    }

    fn kill_tasks(&self, tasks: Vec<TaskId>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.kill_failure.load(Ordering::SeqCst) {
                return Err(crate::Error::HostManager("injected kill failure".into()));
            }
            self.killed.lock().extend(tasks);
            Ok(())
        })
    }

    fn cluster_capacity(&self) -> BoxFuture<'_, Result<ResourceVector>> {
        Box::pin(async move {
            if self.capacity_failure.load(Ordering::SeqCst) {
                return Err(crate::Error::HostManager("injected capacity failure".into()));
            }
            Ok(*self.capacity.lock())
        })
    }
}

#[derive(Default)]
pub struct StubStore {
    pub pools: Mutex<Vec<StoredResourcePool>>,
    pub jobs: Mutex<Vec<(StoredJobConfig, JobState)>>,
    pub tasks: Mutex<Map<JobId, Vec<StoredTask>>>,
    /// Runtime write-backs observed, in arrival order.
    pub updates: Mutex<Vec<(TaskId, TaskState, Option<String>)>>,
    fail: AtomicBool,
}

impl StubStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(crate::Error::Store("injected store failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Store for StubStore {
    fn get_all_resource_pools(&self) -> BoxFuture<'_, Result<Vec<StoredResourcePool>>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.pools.lock().clone())
        })
    }

    fn get_jobs_by_states(&self, states: Vec<JobState>) -> BoxFuture<'_, Result<Vec<JobId>>> {
        Box::pin(async move {
            self.check()?;
            Ok(self
                .jobs
                .lock()
                .iter()
                .filter(|(_, state)| states.contains(state))
                .map(|(config, _)| config.id)
                .collect())
        })
    }

    fn get_job_config(&self, job: JobId) -> BoxFuture<'_, Result<StoredJobConfig>> {
        Box::pin(async move {
            self.check()?;
            self.jobs
                .lock()
                .iter()
                .find(|(config, _)| config.id == job)
                .map(|(config, _)| config.clone())
                .ok_or_else(|| crate::Error::Store(format!("job {job} not found")))
        })
    }

    fn get_job_runtime(&self, job: JobId) -> BoxFuture<'_, Result<JobState>> {
        Box::pin(async move {
            self.check()?;
            self.jobs
                .lock()
                .iter()
                .find(|(config, _)| config.id == job)
                .map(|(_, state)| *state)
                .ok_or_else(|| crate::Error::Store(format!("job {job} not found")))
        })
    }

    fn get_tasks_for_job_by_range(
        &self,
        job: JobId,
        from: u32,
        to: u32,
    ) -> BoxFuture<'_, Result<Vec<StoredTask>>> {
        Box::pin(async move {
            self.check()?;
            Ok(self
                .tasks
                .lock()
                .get(&job)
                .map(|tasks| {
                    tasks
                        .iter()
                        .filter(|t| {
                            t.id.instance().as_num() >= from && t.id.instance().as_num() < to
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn update_task_runtime(
        &self,
        task: TaskId,
        state: TaskState,
        host: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check()?;
            self.updates.lock().push((task, state, host));
            Ok(())
        })
    }
}

// ------------------------------------------------------------- fixtures

pub fn cpu_config(reservation: f64, limit: f64, share: f64) -> Vec<ResourceConfig> {
    vec![ResourceConfig {
        kind: ResourceKind::Cpu,
        reservation,
        limit,
        share,
    }]
}

pub fn pool_config(name: &str, parent: &str, resources: Vec<ResourceConfig>) -> ResourcePoolConfig {
    ResourcePoolConfig {
        name: name.to_string(),
        parent: Some(parent.to_string()),
        resources,
        policy: SchedulingPolicy::PriorityFifo,
    }
}

/// Spec builder for one test task. Defaults: preemptible batch task with
/// no ports and no retries.
#[derive(Clone)]
pub struct TestTask {
    pub id: u32,
    pub demand: ResourceVector,
    pub num_ports: u32,
    pub priority: crate::Priority,
    pub flags: TaskFlags,
    pub task_type: TaskType,
    pub max_failures: u32,
    pub host_labels: Vec<(String, String)>,
}

impl TestTask {
    pub fn cpu(id: u32, cpu: f64) -> Self {
        Self {
            id,
            demand: ResourceVector::new(cpu, 0.0, 0.0, 0.0),
            num_ports: 0,
            priority: 0,
            flags: TaskFlags::PREEMPTIBLE,
            task_type: TaskType::Batch,
            max_failures: 0,
            host_labels: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: crate::Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ports(mut self, ports: u32) -> Self {
        self.num_ports = ports;
        self
    }

    pub fn not_preemptible(mut self) -> Self {
        self.flags.remove(TaskFlags::PREEMPTIBLE);
        self
    }

    pub fn controller(mut self) -> Self {
        self.flags.insert(TaskFlags::CONTROLLER);
        self
    }

    pub fn revocable(mut self) -> Self {
        self.flags.insert(TaskFlags::REVOCABLE);
        self
    }

    pub fn stateful(mut self) -> Self {
        self.task_type = TaskType::Stateful;
        self
    }

    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn spec(&self, pool: &str) -> TaskSpec {
        TaskSpec {
            id: TaskId::new_test(self.id),
            pool: pool.to_string(),
            demand: self.demand,
            num_ports: self.num_ports,
            priority: self.priority,
            flags: self.flags,
            task_type: self.task_type,
            host_labels: self.host_labels.clone(),
            max_failures: self.max_failures,
        }
    }
}

/// The wired-together core, minus the periodic loops: tests drive cycles
/// by hand to stay deterministic.
pub struct TestRig {
    pub config: RmConfig,
    pub tree: Arc<ResTree>,
    pub tracker: Arc<Tracker>,
    pub queues: Arc<PlacementQueues>,
    pub placements: Arc<WaitQueue<Placement>>,
    pub preemption_queue: Arc<WaitQueue<TaskId>>,
    pub scheduler: Arc<TaskScheduler>,
    pub host_manager: Arc<StubHostManager>,
    gang_ids: Mutex<IdCounter>,
}

impl TestRig {
    pub fn next_gang_id(&self) -> GangId {
        GangId::new(self.gang_ids.lock().increment())
    }

    pub fn kill_coordinator(&self) -> Arc<KillCoordinator> {
        Arc::new(KillCoordinator::new(
            self.tree.clone(),
            self.tracker.clone(),
            self.host_manager.clone(),
            self.config.rm_task.max_kill_attempts,
        ))
    }

    pub fn preemptor(&self, config: PreemptionConfig) -> Preemptor {
        Preemptor::new(
            self.tree.clone(),
            self.tracker.clone(),
            self.kill_coordinator(),
            config,
            self.preemption_queue.clone(),
        )
    }

    pub fn engine(&self) -> Arc<PlacementEngine> {
        let offer_service = Arc::new(OfferService::new(
            self.host_manager.clone(),
            self.tracker.clone(),
            self.config.placement.fetch_offer_tasks,
        ));
        let reserver = Arc::new(Reserver::new(
            self.tracker.clone(),
            self.config.placement.reservation_threshold,
            self.config.placement.reservation_timeout,
        ));
        Arc::new(PlacementEngine::new(
            self.queues.clone(),
            self.tracker.clone(),
            self.scheduler.clone(),
            offer_service,
            Arc::new(BatchStrategy),
            reserver,
            self.placements.clone(),
            self.config.placement.clone(),
        ))
    }

    pub fn handler(&self) -> ServiceHandler {
        let handler = ServiceHandler::new(
            self.tree.clone(),
            self.tracker.clone(),
            self.queues.clone(),
            self.placements.clone(),
            self.preemption_queue.clone(),
            self.kill_coordinator(),
        );
        handler.set_leader(true);
        handler
    }

    /// Force a task into a state, bypassing the transition table. Test
    /// shortcut for setting up mid-lifecycle situations.
    pub fn force_state(&self, id: TaskId, state: TaskState) {
        let task = self.tracker.get(id).expect("task not tracked");
        let mut runtime = task.runtime();
        runtime.state = state;
        runtime.last_update = Instant::now();
        if state == TaskState::Running && runtime.start_time.is_none() {
            runtime.start_time = Some(Instant::now());
        }
    }
}

pub fn test_rig() -> TestRig {
    test_rig_with_config(RmConfig::default())
}

pub fn test_rig_with_config(config: RmConfig) -> TestRig {
    test_rig_custom(
        config,
        vec![
            ("respool1", ROOT_POOL_ID, cpu_config(100.0, 1000.0, 1.0)),
            ("respool11", "respool1", cpu_config(50.0, 1000.0, 1.0)),
            ("respool12", "respool1", cpu_config(50.0, 1000.0, 1.0)),
        ],
    )
}

pub fn test_rig_custom(
    config: RmConfig,
    pools: Vec<(&str, &str, Vec<ResourceConfig>)>,
) -> TestRig {
    let tree = Arc::new(ResTree::new());
    for (id, parent, resources) in pools {
        tree.upsert(id.to_string(), pool_config(id, parent, resources))
            .unwrap();
    }
    let tracker = Arc::new(Tracker::new(tree.clone(), config.rm_task.terminal_grace));
    let queues = Arc::new(PlacementQueues::new(config.scheduler_queue_capacity));
    let placements = Arc::new(WaitQueue::new(
        "placements-out",
        config.placement_output_capacity,
    ));
    let preemption_queue = Arc::new(WaitQueue::new(
        "preemption",
        config.preemption_queue_capacity,
    ));
    let scheduler = Arc::new(TaskScheduler::new(
        tree.clone(),
        tracker.clone(),
        queues.clone(),
        config.clone(),
    ));
    TestRig {
        config,
        tree,
        tracker,
        queues,
        placements,
        preemption_queue,
        scheduler,
        host_manager: StubHostManager::new(),
        gang_ids: Mutex::new(IdCounter::new(1)),
    }
}

pub fn test_handler_rig() -> (TestRig, ServiceHandler) {
    let rig = test_rig();
    let handler = rig.handler();
    (rig, handler)
}

/// Create the tasks of one gang directly in the tracker (PENDING, queued)
/// and enqueue the gang into `pool`. Returns the gang as registered.
pub fn enqueue_test_gang(rig: &TestRig, pool: &str, tasks: &[TestTask]) -> Gang {
    let gang_id = rig.next_gang_id();
    let mut gang = Gang {
        id: gang_id,
        pool: pool.to_string(),
        tasks: Vec::new(),
        demand: ResourceVector::ZERO,
        priority: tasks[0].priority,
        kind: gang_kind_of(tasks[0].flags),
        task_type: tasks[0].task_type,
        seq: 0,
    };
    for test_task in tasks {
        let spec = test_task.spec(pool);
        gang.tasks.push(spec.id);
        gang.demand += spec.demand;
        let task = Arc::new(RmTask::new(spec, gang_id, TaskState::Pending));
        task.runtime().in_queue = true;
        assert!(rig.tracker.add_task(task));
    }
    rig.tracker.register_gang(gang.clone());
    rig.tree
        .get(pool)
        .unwrap()
        .enqueue_gang(gang.clone())
        .unwrap();
    gang
}
