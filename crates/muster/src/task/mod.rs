pub mod kill;
pub mod rmtask;
pub mod scheduler;
pub mod state;
pub mod tracker;

pub use kill::KillCoordinator;
pub use rmtask::{RmTask, TaskFlags, TaskSpec};
pub use state::TaskState;
pub use tracker::Tracker;

use serde::{Deserialize, Serialize};

pub const TASK_TYPE_COUNT: usize = 3;

/// Kind of workload, used to route tasks into per-type placement queues.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Batch,
    Stateless,
    Stateful,
}

impl TaskType {
    pub const ALL: [TaskType; TASK_TYPE_COUNT] =
        [TaskType::Batch, TaskType::Stateless, TaskType::Stateful];

    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskType::Batch => "batch",
            TaskType::Stateless => "stateless",
            TaskType::Stateful => "stateful",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
