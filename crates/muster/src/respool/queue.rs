use crate::common::resources::ResourceVector;
use crate::respool::gang::Gang;
use crate::{GangId, Map, Priority};
use priority_queue::PriorityQueue;
use std::cmp::Ordering;

/// Ordering key of a queued gang: descending priority, then ascending
/// enqueue sequence (ties on priority break FIFO).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct GangOrder {
    priority: Priority,
    seq: u64,
}

impl Ord for GangOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for GangOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One logical priority-FIFO queue of gangs inside a leaf pool.
///
/// Gangs put back after a failed admission keep their original sequence
/// number, so "skip but do not remove" restores their exact position.
#[derive(Default)]
pub struct GangQueue {
    heap: PriorityQueue<GangId, GangOrder>,
    gangs: Map<GangId, Gang>,
    demand: ResourceVector,
}

impl GangQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Aggregate demand of all queued gangs.
    pub fn demand(&self) -> ResourceVector {
        self.demand
    }

    /// Demand of the highest-priority gang, zero when empty.
    pub fn head_demand(&self) -> ResourceVector {
        self.peek().map(|g| g.demand).unwrap_or(ResourceVector::ZERO)
    }

    pub fn push(&mut self, gang: Gang) {
        let order = GangOrder {
            priority: gang.priority,
            seq: gang.seq,
        };
        self.demand += gang.demand;
        self.heap.push(gang.id, order);
        self.gangs.insert(gang.id, gang);
    }

    pub fn peek(&self) -> Option<&Gang> {
        self.heap.peek().and_then(|(id, _)| self.gangs.get(id))
    }

    pub fn pop(&mut self) -> Option<Gang> {
        let (id, _) = self.heap.pop()?;
        let gang = self.gangs.remove(&id).expect("gang payload missing");
        self.demand -= gang.demand;
        Some(gang)
    }

    pub fn remove(&mut self, id: GangId) -> Option<Gang> {
        self.heap.remove(&id)?;
        let gang = self.gangs.remove(&id).expect("gang payload missing");
        self.demand -= gang.demand;
        Some(gang)
    }

    pub fn contains(&self, id: GangId) -> bool {
        self.gangs.contains_key(&id)
    }

    /// The first `limit` gangs in dequeue order, without removing them.
    pub fn peek_many(&self, limit: usize) -> Vec<&Gang> {
        let mut heap = self.heap.clone();
        let mut out = Vec::with_capacity(limit.min(heap.len()));
        while out.len() < limit {
            match heap.pop() {
                Some((id, _)) => out.push(&self.gangs[&id]),
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::respool::gang::GangKind;
    use crate::task::TaskType;
    use crate::TaskId;

    fn gang(id: u64, priority: Priority, seq: u64) -> Gang {
        Gang {
            id: GangId::new(id),
            pool: "respool1".to_string(),
            tasks: vec![TaskId::new_test(id as u32)],
            demand: ResourceVector::new(1.0, 0.0, 0.0, 0.0),
            priority,
            kind: GangKind::NonRevocable,
            task_type: TaskType::Batch,
            seq,
        }
    }

    #[test]
    fn orders_by_priority_then_fifo() {
        let mut queue = GangQueue::new();
        queue.push(gang(1, 0, 1));
        queue.push(gang(2, 5, 2));
        queue.push(gang(3, 5, 3));
        queue.push(gang(4, 1, 4));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|g| g.id.as_num())
            .collect();
        assert_eq!(order, vec![2, 3, 4, 1]);
    }

    #[test]
    fn put_back_restores_position() {
        let mut queue = GangQueue::new();
        queue.push(gang(1, 3, 1));
        queue.push(gang(2, 3, 2));
        queue.push(gang(3, 3, 3));

        // Skip the head and put it back: it must come out first again.
        let head = queue.pop().unwrap();
        assert_eq!(head.id.as_num(), 1);
        queue.push(head);
        assert_eq!(queue.pop().unwrap().id.as_num(), 1);
    }

    #[test]
    fn tracks_queued_demand() {
        let mut queue = GangQueue::new();
        queue.push(gang(1, 0, 1));
        queue.push(gang(2, 0, 2));
        assert_eq!(queue.demand(), ResourceVector::new(2.0, 0.0, 0.0, 0.0));
        queue.remove(GangId::new(1));
        assert_eq!(queue.demand(), ResourceVector::new(1.0, 0.0, 0.0, 0.0));
        queue.pop();
        assert!(queue.demand().is_zero());
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_many_is_nondestructive() {
        let mut queue = GangQueue::new();
        queue.push(gang(1, 2, 1));
        queue.push(gang(2, 9, 2));
        let peeked: Vec<u64> = queue.peek_many(5).iter().map(|g| g.id.as_num()).collect();
        assert_eq!(peeked, vec![2, 1]);
        assert_eq!(queue.len(), 2);
    }
}
