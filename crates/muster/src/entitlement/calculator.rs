use crate::api::HostManager;
use crate::common::resources::{ResourceKind, ResourceVector, RESOURCE_EPS};
use crate::respool::ResTree;
use crate::Map;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically redistributes the cluster capacity down the pool tree.
///
/// Reservations are hard guarantees; shares apportion only the surplus,
/// and a pool never receives more than it demands or its limit allows.
/// When the host manager is unreachable the last known capacity is used,
/// so entitlements keep tracking demand during the outage.
pub struct EntitlementCalculator {
    tree: Arc<ResTree>,
    host_manager: Arc<dyn HostManager>,
    period: Duration,
    last_capacity: Mutex<Option<ResourceVector>>,
}

/// Inputs of one child in a distribution pass.
struct ChildDemand {
    pool: crate::PoolId,
    demand: ResourceVector,
    reservation: ResourceVector,
    limit: ResourceVector,
    share: ResourceVector,
}

impl EntitlementCalculator {
    pub fn new(tree: Arc<ResTree>, host_manager: Arc<dyn HostManager>, period: Duration) -> Self {
        Self {
            tree,
            host_manager,
            period,
            last_capacity: Mutex::new(None),
        }
    }

    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("Entitlement calculator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.calculate().await,
            }
        }
        log::info!("Entitlement calculator stopped");
    }

    /// One full top-down recomputation.
    pub async fn calculate(&self) {
        let capacity = match self.host_manager.cluster_capacity().await {
            Ok(capacity) => {
                *self.last_capacity.lock() = Some(capacity);
                capacity
            }
            Err(e) => match *self.last_capacity.lock() {
                Some(capacity) => {
                    log::warn!("Cluster capacity query failed ({e}), using last known value");
                    capacity
                }
                None => {
                    log::error!("Cluster capacity query failed ({e}) and none known yet");
                    return;
                }
            },
        };
        self.calculate_with_capacity(capacity);
    }

    /// Deterministic core, also driven directly by tests.
    pub fn calculate_with_capacity(&self, capacity: ResourceVector) {
        let root = self.tree.root();
        root.set_entitlement(capacity);
        let demands = self.aggregate_demands(root.id());

        let mut queue = VecDeque::new();
        queue.push_back(root.id().clone());
        while let Some(pool_id) = queue.pop_front() {
            let Ok(pool) = self.tree.get(&pool_id) else {
                continue;
            };
            let children = pool.children();
            if children.is_empty() {
                continue;
            }
            let mut child_demands = Vec::with_capacity(children.len());
            for child_id in &children {
                let Ok(child) = self.tree.get(child_id) else {
                    continue;
                };
                let snapshot = child.snapshot();
                child_demands.push(ChildDemand {
                    pool: child_id.clone(),
                    demand: demands
                        .get(child_id)
                        .copied()
                        .unwrap_or(snapshot.reservation),
                    reservation: snapshot.reservation,
                    limit: snapshot.limit,
                    share: snapshot.share,
                });
            }
            let entitlements = distribute(pool.entitlement(), &child_demands);
            for (child_id, entitlement) in child_demands.iter().map(|d| &d.pool).zip(entitlements) {
                if let Ok(child) = self.tree.get(child_id) {
                    child.set_entitlement(entitlement);
                }
                queue.push_back(child_id.clone());
            }
        }
    }

    /// Post-order pass: a leaf demands what it has admitted plus what its
    /// queue head asks for; an internal node demands what its children
    /// demand. Both are floored at the reservation and capped at the
    /// limit.
    fn aggregate_demands(&self, pool_id: &crate::PoolId) -> Map<crate::PoolId, ResourceVector> {
        let mut demands = Map::new();
        self.demand_of(pool_id, &mut demands);
        demands
    }

    fn demand_of(
        &self,
        pool_id: &crate::PoolId,
        demands: &mut Map<crate::PoolId, ResourceVector>,
    ) -> ResourceVector {
        let Ok(pool) = self.tree.get(pool_id) else {
            return ResourceVector::ZERO;
        };
        let children = pool.children();
        let demand = if children.is_empty() {
            pool.entitlement_demand()
        } else {
            let snapshot = pool.snapshot();
            let mut sum = ResourceVector::ZERO;
            for child in &children {
                sum += self.demand_of(child, demands);
            }
            sum.max_with(&snapshot.reservation).cap_at(&snapshot.limit)
        };
        demands.insert(pool_id.clone(), demand);
        demand
    }
}

/// Split one pool's entitlement among its children, per resource kind:
/// reservations first (scaled down proportionally if the budget cannot
/// honour them all), then the surplus in proportion to shares, capped at
/// each child's demand and limit. The surplus pass iterates until no child
/// is under-satisfied or the surplus is exhausted; it terminates because
/// every round either satisfies a child or stops making progress.
fn distribute(budget: ResourceVector, children: &[ChildDemand]) -> Vec<ResourceVector> {
    let mut entitlements = vec![ResourceVector::ZERO; children.len()];
    for kind in ResourceKind::ALL {
        let capacity = budget.get(kind);
        let reserved: f64 = children.iter().map(|c| c.reservation.get(kind)).sum();

        // Reservations are honoured in full whenever the budget permits.
        let scale = if reserved > capacity + RESOURCE_EPS && reserved > 0.0 {
            capacity / reserved
        } else {
            1.0
        };
        let mut assigned = 0.0;
        for (child, entitlement) in children.iter().zip(entitlements.iter_mut()) {
            let value = child.reservation.get(kind) * scale;
            entitlement.set(kind, value);
            assigned += value;
        }

        let mut surplus = (capacity - assigned).max(0.0);
        // Bounded by the child count: each round either satisfies at least
        // one child or hands out the entire remaining surplus.
        for _ in 0..=children.len() {
            if surplus <= RESOURCE_EPS {
                break;
            }
            let mut weight = 0.0;
            for (child, entitlement) in children.iter().zip(entitlements.iter()) {
                let target = child.demand.get(kind).min(child.limit.get(kind));
                if entitlement.get(kind) + RESOURCE_EPS < target {
                    weight += child.share.get(kind);
                }
            }
            if weight <= 0.0 {
                break;
            }
            let mut handed_out = 0.0;
            for (child, entitlement) in children.iter().zip(entitlements.iter_mut()) {
                let target = child.demand.get(kind).min(child.limit.get(kind));
                let current = entitlement.get(kind);
                if current + RESOURCE_EPS >= target {
                    continue;
                }
                let fair = surplus * child.share.get(kind) / weight;
                let grant = fair.min(target - current);
                entitlement.set(kind, current + grant);
                handed_out += grant;
            }
            surplus -= handed_out;
            if handed_out <= RESOURCE_EPS {
                break;
            }
        }
    }
    entitlements
}
