use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

define_id_type!(JobId, u32);
define_id_type!(InstanceId, u32);
define_id_type!(GangId, u64);
define_id_type!(RunId, u32);

/// Identifier of a task: the owning job plus the instance index within it.
#[derive(Default, Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId {
    job_id: JobId,
    instance: InstanceId,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.job_id, self.instance)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl TaskId {
    #[inline]
    pub fn new(job_id: JobId, instance: InstanceId) -> Self {
        Self { job_id, instance }
    }

    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn new_test(instance: u32) -> Self {
        Self {
            job_id: 0.into(),
            instance: instance.into(),
        }
    }
}

#[cfg(test)]
impl From<u32> for TaskId {
    fn from(value: u32) -> Self {
        Self::new_test(value)
    }
}

impl RunId {
    /// Run id of the next attempt of the same task.
    #[inline]
    pub fn next(&self) -> RunId {
        RunId::new(self.as_num() + 1)
    }
}
