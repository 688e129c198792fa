use crate::common::ids::TaskId;
use crate::task::TaskState;
use crate::PoolId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RmError {
    #[error("resource pool {0} not found")]
    PoolNotFound(PoolId),
    #[error("resource pool {0} is not a leaf node")]
    PoolNotLeaf(PoolId),
    #[error("invalid resource pool config for {pool}: {reason}")]
    InvalidPoolConfig { pool: PoolId, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("invalid transition of task {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
    #[error("not leader")]
    NotLeader,
    #[error("queue {0} is full")]
    QueueFull(&'static str),
    #[error("store error: {0}")]
    Store(String),
    #[error("host manager error: {0}")]
    HostManager(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<String> for RmError {
    fn from(e: String) -> Self {
        RmError::GenericError(e)
    }
}

impl From<&str> for RmError {
    fn from(e: &str) -> Self {
        RmError::GenericError(e.to_string())
    }
}

impl From<serde_json::error::Error> for RmError {
    fn from(e: serde_json::error::Error) -> Self {
        RmError::GenericError(e.to_string())
    }
}
