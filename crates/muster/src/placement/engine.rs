use crate::api::{HostFilter, PlacedTask, Placement};
use crate::common::queue::WaitQueue;
use crate::config::PlacementConfig;
use crate::placement::offers::OfferService;
use crate::placement::ports::assign_ports;
use crate::placement::reserver::Reserver;
use crate::placement::strategy::{Assignment, OfferLease, PlacementStrategy};
use crate::respool::Gang;
use crate::task::scheduler::{PlacementQueues, TaskScheduler, REASON_PLACEMENT_TIMEOUT};
use crate::task::state::TaskState;
use crate::task::tracker::Tracker;
use crate::task::TaskType;
use crate::{GangId, Map, Set, TaskId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pause between acquire attempts that returned no offers, so a drained
/// cluster does not turn the round loop into a busy spin.
const EMPTY_ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct EngineStats {
    pub placements_published: AtomicU64,
    pub placement_timeouts: AtomicU64,
    pub empty_acquires: AtomicU64,
}

/// Matches dequeued gangs against host offers, one worker pool per task
/// type. The strategy owns match quality; the engine owns deadlines, retry
/// budgets, gang atomicity and port assignment.
pub struct PlacementEngine {
    queues: Arc<PlacementQueues>,
    tracker: Arc<Tracker>,
    scheduler: Arc<TaskScheduler>,
    offer_service: Arc<OfferService>,
    strategy: Arc<dyn PlacementStrategy>,
    reserver: Arc<Reserver>,
    placements: Arc<WaitQueue<Placement>>,
    config: PlacementConfig,
    pub stats: EngineStats,
}

impl PlacementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Arc<PlacementQueues>,
        tracker: Arc<Tracker>,
        scheduler: Arc<TaskScheduler>,
        offer_service: Arc<OfferService>,
        strategy: Arc<dyn PlacementStrategy>,
        reserver: Arc<Reserver>,
        placements: Arc<WaitQueue<Placement>>,
        config: PlacementConfig,
    ) -> Self {
        Self {
            queues,
            tracker,
            scheduler,
            offer_service,
            strategy,
            reserver,
            placements,
            config,
            stats: EngineStats::default(),
        }
    }

    /// Spawn the per-type worker pools. Strategies that are not safe to
    /// run concurrently get a single worker per type.
    pub fn spawn_workers(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let workers = if self.strategy.concurrency_safe() {
            self.config.concurrency.max(1)
        } else {
            1
        };
        let mut handles = Vec::new();
        for task_type in TaskType::ALL {
            for worker in 0..workers {
                let engine = self.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    log::debug!("Placement worker {task_type}/{worker} started");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = engine.process_once(task_type) => {}
                        }
                    }
                    log::debug!("Placement worker {task_type}/{worker} stopped");
                }));
            }
        }
        handles
    }

    /// One engine iteration: dequeue a batch of gangs, run the round loop
    /// per filter group, hand back what could not be placed. Returns the
    /// number of placements published.
    pub async fn process_once(&self, task_type: TaskType) -> usize {
        self.expire_reservations(task_type);

        let gangs = self
            .queues
            .queue(task_type)
            .pop_batch(self.config.task_dequeue_limit, self.config.task_dequeue_timeout)
            .await;
        if gangs.is_empty() {
            return 0;
        }

        let (assignments, gang_members) = self.start_placing(gangs);
        if assignments.is_empty() {
            return 0;
        }
        let mut published = 0;
        for (filter, indices) in self.strategy.filters(&assignments) {
            let group: Vec<Assignment> =
                indices.into_iter().map(|i| assignments[i].clone()).collect();
            published += self
                .place_group(task_type, filter, group, &gang_members)
                .await;
        }
        published
    }

    /// Flip dequeued gangs READY -> PLACING and build their assignments.
    /// Members that died while queued (individual kills) are dropped via
    /// the refreshed gang metadata.
    fn start_placing(&self, gangs: Vec<Gang>) -> (Vec<Assignment>, Map<GangId, Vec<TaskId>>) {
        let mut assignments = Vec::new();
        let mut gang_members: Map<GangId, Vec<TaskId>> = Map::new();
        for gang in gangs {
            let members = self
                .tracker
                .gang(gang.id)
                .map(|meta| meta.tasks)
                .unwrap_or(gang.tasks);
            for id in members {
                let Some(task) = self.tracker.get(id) else {
                    continue;
                };
                if self
                    .tracker
                    .transition(id, TaskState::Placing, None)
                    .is_err()
                {
                    continue;
                }
                gang_members.entry(gang.id).or_default().push(id);
                assignments.push(Assignment {
                    task: id,
                    gang: gang.id,
                    demand: task.spec.demand,
                    num_ports: task.spec.num_ports,
                    host_labels: task.spec.host_labels.clone(),
                    host: None,
                });
            }
        }
        (assignments, gang_members)
    }

    async fn place_group(
        &self,
        task_type: TaskType,
        mut filter: HostFilter,
        mut assignments: Vec<Assignment>,
        gang_members: &Map<GangId, Vec<TaskId>>,
    ) -> usize {
        filter.limit = self.config.offer_dequeue_limit;
        let deadline = Instant::now() + self.config.max_placement_duration[task_type];
        let max_rounds = self.config.max_rounds[task_type];
        let mut published = 0;
        let mut seen_hosts: Vec<String> = Vec::new();

        for round in 0..max_rounds {
            if assignments.is_empty() || Instant::now() >= deadline {
                break;
            }
            let mut leases = self.offer_service.acquire(filter.clone()).await;
            if leases.is_empty() {
                self.stats.empty_acquires.fetch_add(1, Ordering::Relaxed);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(remaining.min(EMPTY_ACQUIRE_BACKOFF)).await;
                continue;
            }

            // Standing host reservations are served before the strategy
            // sees the offers.
            if task_type == TaskType::Stateful {
                for (task, lease_index) in self.reserver.match_reserved(&leases) {
                    if self
                        .tracker
                        .transition(task, TaskState::Placing, None)
                        .is_ok()
                    {
                        if let Some(record) = self.tracker.get(task) {
                            let mut assignment = Assignment {
                                task,
                                gang: record.gang,
                                demand: record.spec.demand,
                                num_ports: record.spec.num_ports,
                                host_labels: record.spec.host_labels.clone(),
                                host: None,
                            };
                            self.claim_direct(&mut assignment, lease_index, &mut leases);
                            assignments.push(assignment);
                        }
                    }
                }
            }

            for lease in &leases {
                if !seen_hosts.contains(&lease.offer.hostname) {
                    seen_hosts.push(lease.offer.hostname.clone());
                }
            }

            self.strategy.place_once(&mut assignments, &mut leases);
            log::debug!(
                "Placement round {round} ({task_type}): {} assigned / {} total on {} offers",
                assignments.iter().filter(|a| a.host.is_some()).count(),
                assignments.len(),
                leases.len()
            );

            published += self.publish_complete_gangs(task_type, &mut assignments, &mut leases);

            // Offers that carried placements are consumed by the launch
            // path; the rest go back to the host manager.
            let (_used, unused): (Vec<OfferLease>, Vec<OfferLease>) =
                leases.into_iter().partition(|l| !l.assigned.is_empty());
            self.offer_service.release(unused).await;
        }

        // Rounds or deadline exhausted: reserve hosts for desperate
        // stateful tasks, hand the rest back to the scheduler.
        let leftover_gangs: Set<GangId> = assignments.iter().map(|a| a.gang).collect();
        for gang in leftover_gangs {
            if task_type == TaskType::Stateful && self.try_reserve(gang, gang_members, &seen_hosts)
            {
                continue;
            }
            self.stats.placement_timeouts.fetch_add(1, Ordering::Relaxed);
            self.scheduler
                .requeue_gang(gang, REASON_PLACEMENT_TIMEOUT, true);
        }
        published
    }

    /// Port resolution and publication for every gang whose members all
    /// found a host this round. Gangs with only some members assigned are
    /// reverted and stay retryable; published assignments are removed.
    fn publish_complete_gangs(
        &self,
        task_type: TaskType,
        assignments: &mut Vec<Assignment>,
        leases: &mut [OfferLease],
    ) -> usize {
        let mut assigned_of: Map<GangId, u32> = Map::new();
        for assignment in assignments.iter() {
            if assignment.host.is_some() {
                *assigned_of.entry(assignment.gang).or_insert(0) += 1;
            }
        }
        let complete: Set<GangId> = assigned_of
            .into_iter()
            .filter(|(gang, assigned)| {
                let members = self
                    .tracker
                    .gang(*gang)
                    .map(|meta| meta.tasks.len() as u32)
                    .unwrap_or(*assigned);
                *assigned >= members
            })
            .map(|(gang, _)| gang)
            .collect();

        // Resolve ports per assignment, host by host.
        let mut placed: Map<usize, Vec<PlacedTask>> = Map::new();
        let mut failed_gangs: Set<GangId> = Set::new();
        for assignment in assignments.iter() {
            let Some(lease_index) = assignment.host else {
                continue;
            };
            if !complete.contains(&assignment.gang) || failed_gangs.contains(&assignment.gang) {
                continue;
            }
            let lease = &mut leases[lease_index];
            match assign_ports(&lease.offer.port_ranges, &lease.used_ports, assignment.num_ports) {
                Some(ports) => {
                    for port in &ports {
                        lease.used_ports.insert(*port);
                    }
                    lease.claimed_ports = lease.claimed_ports.saturating_sub(assignment.num_ports);
                    placed.entry(lease_index).or_default().push(PlacedTask {
                        task_id: assignment.task,
                        ports: ports.into_iter().collect(),
                    });
                }
                None => {
                    failed_gangs.insert(assignment.gang);
                }
            }
        }

        // Publish per host; transition the tasks and record their hosts.
        let mut published = 0;
        for (lease_index, tasks) in placed {
            // A port failure elsewhere in the gang withdraws the whole gang.
            let tasks: Vec<PlacedTask> = tasks
                .into_iter()
                .filter(|t| {
                    let gang = assignments
                        .iter()
                        .find(|a| a.task == t.task_id)
                        .map(|a| a.gang);
                    gang.map(|g| !failed_gangs.contains(&g)).unwrap_or(false)
                })
                .collect();
            if tasks.is_empty() {
                continue;
            }
            let lease = &leases[lease_index];
            for placed_task in &tasks {
                self.tracker.set_placement(
                    placed_task.task_id,
                    lease.offer.hostname.clone(),
                    placed_task.ports.to_vec(),
                );
                let _ = self
                    .tracker
                    .transition(placed_task.task_id, TaskState::Placed, None);
            }
            let placement = Placement {
                hostname: lease.offer.hostname.clone(),
                agent_id: lease.offer.agent_id.clone(),
                tasks,
                task_type,
            };
            published += placement.tasks.len();
            log::debug!(
                "Publishing placement of {} task(s) on {}",
                placement.tasks.len(),
                placement.hostname
            );
            if self.placements.try_push(placement).is_err() {
                log::error!("Placement output queue full, placement dropped");
            }
        }
        self.stats
            .placements_published
            .fetch_add(published as u64, Ordering::Relaxed);

        // Revert incomplete or withdrawn gangs (returning their lease
        // claims so the offers can be released), drop published ones.
        assignments.retain_mut(|assignment| {
            let keep_for_retry =
                !complete.contains(&assignment.gang) || failed_gangs.contains(&assignment.gang);
            if keep_for_retry {
                if let Some(lease_index) = assignment.host.take() {
                    let lease = &mut leases[lease_index];
                    lease.assigned.retain(|t| *t != assignment.task);
                    lease.remaining += assignment.demand;
                    lease.claimed_ports = lease.claimed_ports.saturating_sub(assignment.num_ports);
                }
                true
            } else {
                false
            }
        });
        published
    }

    fn claim_direct(
        &self,
        assignment: &mut Assignment,
        lease_index: usize,
        leases: &mut [OfferLease],
    ) {
        let lease = &mut leases[lease_index];
        lease.remaining = lease.remaining.sub_clamped(&assignment.demand);
        lease.claimed_ports += assignment.num_ports;
        lease.assigned.push(assignment.task);
        assignment.host = Some(lease_index);
    }

    /// Pin a host for a stateful single-task gang that ran out of rounds.
    /// Candidates are the hosts whose offers this group saw; the first one
    /// without a standing reservation wins.
    fn try_reserve(
        &self,
        gang: GangId,
        gang_members: &Map<GangId, Vec<TaskId>>,
        seen_hosts: &[String],
    ) -> bool {
        let Some(members) = gang_members.get(&gang) else {
            return false;
        };
        if members.len() != 1 {
            return false;
        }
        let id = members[0];
        let Some(task) = self.tracker.get(id) else {
            return false;
        };
        if task.runtime().placement_attempts + 1 < self.reserver.threshold() {
            return false;
        }
        let Some(hostname) = seen_hosts
            .iter()
            .find(|host| !self.reserver.is_reserved(host))
        else {
            return false;
        };
        if self.tracker.transition(id, TaskState::Ready, None).is_err() {
            return false;
        }
        self.reserver.reserve(hostname, id)
    }

    /// Give up on reservations that outlived their timeout and feed the
    /// tasks back into the placement queue.
    fn expire_reservations(&self, task_type: TaskType) {
        if task_type != TaskType::Stateful {
            return;
        }
        for task in self.reserver.expire(Instant::now()) {
            if let Some(record) = self.tracker.get(task) {
                if let Some(gang) = self.tracker.gang(record.gang) {
                    if self.queues.queue(task_type).try_push(gang).is_err() {
                        self.scheduler
                            .requeue_gang(record.gang, REASON_PLACEMENT_TIMEOUT, false);
                    }
                }
            }
        }
    }
}
