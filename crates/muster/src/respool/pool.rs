use crate::api::{ResourcePoolConfig, SchedulingPolicy};
use crate::common::resources::ResourceVector;
use crate::common::IdCounter;
use crate::respool::gang::{Gang, GangKind};
use crate::respool::queue::GangQueue;
use crate::{Error, GangId, PoolId, Result};
use parking_lot::RwLock;

impl GangKind {
    #[inline]
    pub(crate) fn index(&self) -> usize {
        match self {
            GangKind::Controller => 0,
            GangKind::NonRevocable => 1,
            GangKind::Revocable => 2,
        }
    }
}

/// Admitted-resource accounting of one pool, split by the class of the
/// consuming gangs. `total` always covers the other two.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Allocation {
    pub total: ResourceVector,
    pub controller: ResourceVector,
    pub revocable: ResourceVector,
}

impl Allocation {
    pub fn add(&mut self, kind: GangKind, demand: ResourceVector) {
        self.total += demand;
        match kind {
            GangKind::Controller => self.controller += demand,
            GangKind::Revocable => self.revocable += demand,
            GangKind::NonRevocable => {}
        }
    }

    pub fn sub(&mut self, kind: GangKind, demand: ResourceVector) {
        self.total = self.total.sub_clamped(&demand);
        match kind {
            GangKind::Controller => self.controller = self.controller.sub_clamped(&demand),
            GangKind::Revocable => self.revocable = self.revocable.sub_clamped(&demand),
            GangKind::NonRevocable => {}
        }
    }
}

struct PoolState {
    name: String,
    parent: Option<PoolId>,
    children: Vec<PoolId>,
    policy: SchedulingPolicy,
    reservation: ResourceVector,
    limit: ResourceVector,
    share: ResourceVector,
    entitlement: ResourceVector,
    allocation: Allocation,
    /// Controller, non-revocable and revocable queues, in dequeue order.
    queues: [GangQueue; 3],
    seq: IdCounter,
}

/// Read-only view of a pool, taken under its read lock. The entitlement
/// calculator and the preemptor work on snapshots so they never hold more
/// than one pool lock at a time.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub id: PoolId,
    pub name: String,
    pub parent: Option<PoolId>,
    pub children: Vec<PoolId>,
    pub is_leaf: bool,
    pub reservation: ResourceVector,
    pub limit: ResourceVector,
    pub share: ResourceVector,
    pub entitlement: ResourceVector,
    pub allocation: Allocation,
    pub queued_demand: ResourceVector,
    pub head_demand: ResourceVector,
}

/// A node of the resource pool tree. Only leaves hold tasks.
pub struct ResPool {
    id: PoolId,
    state: RwLock<PoolState>,
}

impl std::fmt::Debug for ResPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResPool").field("id", &self.id).finish()
    }
}

impl ResPool {
    pub fn new(id: PoolId, config: &ResourcePoolConfig) -> Self {
        Self {
            id,
            state: RwLock::new(PoolState {
                name: config.name.clone(),
                parent: config.parent.clone(),
                children: Vec::new(),
                policy: config.policy,
                reservation: config.reservation(),
                limit: config.limit(),
                share: config.share(),
                entitlement: ResourceVector::ZERO,
                allocation: Allocation::default(),
                queues: Default::default(),
                seq: IdCounter::new(1),
            }),
        }
    }

    /// The implicit root: no reservation, unbounded limit. Its entitlement
    /// is overwritten with the cluster capacity every calculator cycle.
    pub fn new_root(id: PoolId) -> Self {
        let config = ResourcePoolConfig {
            name: id.clone(),
            parent: None,
            resources: Vec::new(),
            policy: SchedulingPolicy::PriorityFifo,
        };
        Self::new(id, &config)
    }

    #[inline]
    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn parent(&self) -> Option<PoolId> {
        self.state.read().parent.clone()
    }

    pub fn children(&self) -> Vec<PoolId> {
        self.state.read().children.clone()
    }

    pub fn is_leaf(&self) -> bool {
        self.state.read().children.is_empty()
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.state.read().policy
    }

    pub fn reservation(&self) -> ResourceVector {
        self.state.read().reservation
    }

    pub fn limit(&self) -> ResourceVector {
        self.state.read().limit
    }

    pub fn entitlement(&self) -> ResourceVector {
        self.state.read().entitlement
    }

    pub fn allocation(&self) -> Allocation {
        self.state.read().allocation
    }

    /// Atomically replace the entitlement vector: readers observe either
    /// the pre- or post-recomputation value, never a torn mix.
    pub fn set_entitlement(&self, entitlement: ResourceVector) {
        let mut state = self.state.write();
        log::debug!(
            "Pool {} entitlement {} -> {}",
            self.id,
            state.entitlement,
            entitlement
        );
        state.entitlement = entitlement;
    }

    pub(crate) fn apply_config(&self, config: &ResourcePoolConfig) {
        let mut state = self.state.write();
        state.name = config.name.clone();
        state.parent = config.parent.clone();
        state.policy = config.policy;
        state.reservation = config.reservation();
        state.limit = config.limit();
        state.share = config.share();
    }

    pub(crate) fn add_child(&self, child: PoolId) {
        let mut state = self.state.write();
        if !state.children.contains(&child) {
            state.children.push(child);
        }
    }

    pub(crate) fn remove_child(&self, child: &PoolId) {
        self.state.write().children.retain(|c| c != child);
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.read();
        let queued_demand = state
            .queues
            .iter()
            .fold(ResourceVector::ZERO, |acc, q| acc + q.demand());
        let head_demand = state
            .queues
            .iter()
            .fold(ResourceVector::ZERO, |acc, q| acc + q.head_demand());
        PoolSnapshot {
            id: self.id.clone(),
            name: state.name.clone(),
            parent: state.parent.clone(),
            children: state.children.clone(),
            is_leaf: state.children.is_empty(),
            reservation: state.reservation,
            limit: state.limit,
            share: state.share,
            entitlement: state.entitlement,
            allocation: state.allocation,
            queued_demand,
            head_demand,
        }
    }

    /// Demand the entitlement calculator attributes to this pool:
    /// what is already admitted plus what is about to be asked for,
    /// never below the reservation and never above the limit.
    pub fn entitlement_demand(&self) -> ResourceVector {
        let snapshot = self.snapshot();
        (snapshot.allocation.total + snapshot.head_demand)
            .max_with(&snapshot.reservation)
            .cap_at(&snapshot.limit)
    }

    pub fn has_queued_work(&self) -> bool {
        self.state.read().queues.iter().any(|q| !q.is_empty())
    }

    /// Enqueue a freshly submitted gang. Fails on non-leaf pools.
    pub fn enqueue_gang(&self, mut gang: Gang) -> Result<()> {
        let mut state = self.state.write();
        if !state.children.is_empty() {
            return Err(Error::PoolNotLeaf(self.id.clone()));
        }
        gang.seq = state.seq.increment();
        log::debug!(
            "Pool {} enqueue gang {} ({} tasks, {})",
            self.id,
            gang.id,
            gang.len(),
            gang.demand
        );
        state.queues[gang.kind.index()].push(gang);
        Ok(())
    }

    /// Put a previously dequeued gang back, keeping its FIFO position.
    pub fn requeue_gang(&self, gang: Gang) {
        let mut state = self.state.write();
        state.queues[gang.kind.index()].push(gang);
    }

    /// Remove a queued gang (kill of queued work, pool teardown).
    pub fn remove_gang(&self, id: GangId) -> Option<Gang> {
        let mut state = self.state.write();
        state.queues.iter_mut().find_map(|q| q.remove(id))
    }

    pub fn contains_gang(&self, id: GangId) -> bool {
        self.state.read().queues.iter().any(|q| q.contains(id))
    }

    /// Dequeue up to `limit` gangs that fit into the pool's current
    /// headroom (entitlement minus allocation), visiting the controller,
    /// non-revocable and revocable queues in that order.
    ///
    /// Admitted gangs are charged to the pool's allocation immediately.
    /// Gangs that do not fit are skipped but keep their queue position.
    /// Controller gangs are additionally bounded by the controller quota
    /// (a fraction of the entitlement), revocable gangs by the surplus
    /// beyond the reservation.
    pub fn dequeue_gangs(&self, limit: usize, controller_quota_fraction: f64) -> Vec<Gang> {
        let mut state = self.state.write();
        let mut admitted = Vec::new();
        let controller_quota = state.entitlement * controller_quota_fraction;

        for kind in GangKind::DEQUEUE_ORDER {
            if admitted.len() >= limit {
                break;
            }
            let mut skipped = Vec::new();
            while admitted.len() < limit {
                let Some(gang) = state.queues[kind.index()].pop() else {
                    break;
                };
                let headroom = state.entitlement.sub_clamped(&state.allocation.total);
                let fits = gang.demand.fits_in(&headroom)
                    && match kind {
                        GangKind::Controller => (state.allocation.controller + gang.demand)
                            .fits_in(&controller_quota),
                        GangKind::Revocable => {
                            let surplus = state.entitlement.sub_clamped(&state.reservation);
                            (state.allocation.revocable + gang.demand).fits_in(&surplus)
                        }
                        GangKind::NonRevocable => true,
                    };
                if fits {
                    state.allocation.add(kind, gang.demand);
                    admitted.push(gang);
                } else {
                    skipped.push(gang);
                }
            }
            for gang in skipped {
                state.queues[kind.index()].push(gang);
            }
        }
        if !admitted.is_empty() {
            log::debug!(
                "Pool {} admitted {} gang(s), allocation now {}",
                self.id,
                admitted.len(),
                state.allocation.total
            );
        }
        admitted
    }

    /// The first `limit` queued gangs in dequeue order, without removal.
    pub fn peek_gangs(&self, limit: usize) -> Vec<Gang> {
        let state = self.state.read();
        let mut out = Vec::new();
        for kind in GangKind::DEQUEUE_ORDER {
            if out.len() >= limit {
                break;
            }
            for gang in state.queues[kind.index()].peek_many(limit - out.len()) {
                out.push(gang.clone());
            }
        }
        out
    }

    pub fn add_allocation(&self, kind: GangKind, demand: ResourceVector) {
        self.state.write().allocation.add(kind, demand);
    }

    pub fn sub_allocation(&self, kind: GangKind, demand: ResourceVector) {
        self.state.write().allocation.sub(kind, demand);
    }
}
