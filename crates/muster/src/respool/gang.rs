use crate::common::resources::ResourceVector;
use crate::task::TaskType;
use crate::{GangId, PoolId, Priority, TaskId};
use serde::{Deserialize, Serialize};

/// Which of a leaf pool's logical queues a gang belongs to. Dequeue visits
/// them in the declared order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GangKind {
    Controller,
    #[default]
    NonRevocable,
    Revocable,
}

impl GangKind {
    pub const DEQUEUE_ORDER: [GangKind; 3] = [
        GangKind::Controller,
        GangKind::NonRevocable,
        GangKind::Revocable,
    ];
}

/// The atomic unit of admission and placement: one or more tasks that are
/// admitted, placed and preempted together. Minimum size is 1.
#[derive(Debug, Clone)]
pub struct Gang {
    pub id: GangId,
    pub pool: PoolId,
    pub tasks: Vec<TaskId>,
    /// Aggregate demand of all member tasks.
    pub demand: ResourceVector,
    pub priority: Priority,
    pub kind: GangKind,
    pub task_type: TaskType,
    /// Enqueue sequence number within the owning pool; preserved across
    /// put-backs so skipped gangs keep their FIFO position.
    pub seq: u64,
}

impl Gang {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
