use crate::api::{HostFilter, HostOffer};
use crate::common::resources::ResourceVector;
use crate::{GangId, Map, Set, TaskId};

/// One task waiting for a host within a placement round. The strategy
/// fills in `host` (an index into the round's offer leases).
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task: TaskId,
    pub gang: GangId,
    pub demand: ResourceVector,
    pub num_ports: u32,
    pub host_labels: Vec<(String, String)>,
    pub host: Option<usize>,
}

/// A host offer plus the running tally of what this round has already
/// packed onto it.
#[derive(Debug)]
pub struct OfferLease {
    pub offer: HostOffer,
    pub remaining: ResourceVector,
    pub used_ports: Set<u32>,
    /// Ports promised to claims in this round but not yet resolved to
    /// concrete numbers.
    pub claimed_ports: u32,
    pub assigned: Vec<TaskId>,
    /// Tasks already running on the host (populated when the engine is
    /// configured to fetch them), for affinity-aware strategies.
    pub running_tasks: Vec<TaskId>,
}

impl OfferLease {
    pub fn new(offer: HostOffer) -> Self {
        let remaining = offer.resources;
        Self {
            offer,
            remaining,
            used_ports: Set::new(),
            claimed_ports: 0,
            assigned: Vec::new(),
            running_tasks: Vec::new(),
        }
    }

    pub fn free_port_count(&self) -> u32 {
        let total: u32 = self
            .offer
            .port_ranges
            .iter()
            .map(|(lo, hi)| hi - lo + 1)
            .sum();
        total - self.used_ports.len() as u32 - self.claimed_ports
    }

    pub fn matches_labels(&self, labels: &[(String, String)]) -> bool {
        labels
            .iter()
            .all(|(k, v)| self.offer.labels.get(k).map(String::as_str) == Some(v.as_str()))
    }

    fn fits(&self, assignment: &Assignment) -> bool {
        assignment.demand.fits_in(&self.remaining)
            && assignment.num_ports <= self.free_port_count()
            && self.matches_labels(&assignment.host_labels)
    }

    /// Charge the assignment against this lease. Ports are reserved by
    /// count here and resolved to concrete numbers at publication time.
    fn claim(&mut self, assignment: &Assignment) {
        self.remaining = self.remaining.sub_clamped(&assignment.demand);
        self.claimed_ports += assignment.num_ports;
        self.assigned.push(assignment.task);
    }
}

/// A bin-packing policy. The engine treats it as opaque: resource
/// feasibility and constraints are the strategy's responsibility, the
/// engine only enforces deadlines, retry budgets and port assignment.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// One matching pass: mutate `assignments`, setting `host` on those
    /// that found a spot and charging the corresponding lease.
    fn place_once(&self, assignments: &mut [Assignment], offers: &mut [OfferLease]);

    /// Partition assignments into groups sharing one host filter.
    fn filters(&self, assignments: &[Assignment]) -> Vec<(HostFilter, Vec<usize>)>;

    /// Whether multiple workers may run this strategy concurrently.
    fn concurrency_safe(&self) -> bool;
}

/// Group assignments that ask for the same resources, ports and labels, so
/// one offer acquisition serves all of them.
fn filters_by_demand(assignments: &[Assignment]) -> Vec<(HostFilter, Vec<usize>)> {
    type Key = ([u64; 4], u32, Vec<(String, String)>);
    let mut groups: Map<Key, Vec<usize>> = Map::new();
    for (index, assignment) in assignments.iter().enumerate() {
        let key = (
            assignment.demand.bits_key(),
            assignment.num_ports,
            assignment.host_labels.clone(),
        );
        groups.entry(key).or_default().push(index);
    }
    groups
        .into_iter()
        .map(|((_, _, labels), indices)| {
            let minimum = indices
                .iter()
                .fold(ResourceVector::ZERO, |acc, &i| {
                    acc.max_with(&assignments[i].demand)
                });
            (
                HostFilter {
                    minimum,
                    required_labels: labels,
                    limit: 0,
                    hostname: None,
                },
                indices,
            )
        })
        .collect()
}

/// Greedy packing for batch workloads: tasks by descending demand onto the
/// offer with the largest remaining capacity that still fits.
#[derive(Default)]
pub struct BatchStrategy;

impl PlacementStrategy for BatchStrategy {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn place_once(&self, assignments: &mut [Assignment], offers: &mut [OfferLease]) {
        let mut order: Vec<usize> = (0..assignments.len())
            .filter(|&i| assignments[i].host.is_none())
            .collect();
        order.sort_by(|&a, &b| assignments[b].demand.cmp_size(&assignments[a].demand));

        for index in order {
            let assignment = &assignments[index];
            let best = offers
                .iter()
                .enumerate()
                .filter(|(_, lease)| lease.fits(assignment))
                .max_by(|(_, a), (_, b)| a.remaining.cmp_size(&b.remaining))
                .map(|(i, _)| i);
            if let Some(best) = best {
                offers[best].claim(assignment);
                assignments[index].host = Some(best);
            }
        }
    }

    fn filters(&self, assignments: &[Assignment]) -> Vec<(HostFilter, Vec<usize>)> {
        filters_by_demand(assignments)
    }

    fn concurrency_safe(&self) -> bool {
        true
    }
}

/// Label-affinity packing for service workloads: among fitting offers,
/// prefer hosts carrying the most of the task's labels (hard requirements
/// are still enforced by `fits`), breaking ties toward emptier hosts so
/// replicas spread out.
#[derive(Default)]
pub struct LabelStrategy;

impl LabelStrategy {
    fn score(lease: &OfferLease, assignment: &Assignment) -> usize {
        assignment
            .host_labels
            .iter()
            .filter(|(k, v)| lease.offer.labels.get(k).map(String::as_str) == Some(v.as_str()))
            .count()
            + lease
                .running_tasks
                .iter()
                .filter(|running| running.job_id() == assignment.task.job_id())
                .count()
    }
}

impl PlacementStrategy for LabelStrategy {
    fn name(&self) -> &'static str {
        "label"
    }

    fn place_once(&self, assignments: &mut [Assignment], offers: &mut [OfferLease]) {
        for index in 0..assignments.len() {
            if assignments[index].host.is_some() {
                continue;
            }
            let assignment = &assignments[index];
            let best = offers
                .iter()
                .enumerate()
                .filter(|(_, lease)| lease.fits(assignment))
                .max_by(|(_, a), (_, b)| {
                    Self::score(a, assignment)
                        .cmp(&Self::score(b, assignment))
                        .then_with(|| b.assigned.len().cmp(&a.assigned.len()))
                })
                .map(|(i, _)| i);
            if let Some(best) = best {
                offers[best].claim(assignment);
                assignments[index].host = Some(best);
            }
        }
    }

    fn filters(&self, assignments: &[Assignment]) -> Vec<(HostFilter, Vec<usize>)> {
        filters_by_demand(assignments)
    }

    fn concurrency_safe(&self) -> bool {
        true
    }
}
